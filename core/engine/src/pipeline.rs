//! 图像 + 指令 → 文本 的完整流程
//!
//! 预处理 → 视觉编码（必要时投影）→ 文本嵌入 → 在 `<image>` 处拼接 → prefill → 逐 token 解码 → detokenize

use ndarray::{Array2, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config_manager::{GenerationConfig, ModelConfig, PipelineConfig};
use crate::error::{EngineError, EngineResult};
use crate::fusion::{find_placeholder, fuse_embeddings};
use crate::generation::{DecodeOptions, DecodeSession, StepResult, StopReason, TensorEngine};
use crate::onnx_engine::OnnxEngine;
use crate::performance_logger::{PerformanceLog, PerformanceLogger, PhaseTimer};
use crate::prompt::PromptTemplate;
use crate::tokenizer::BpeTokenizer;
use crate::vision::{preprocess_image, ProjectorFiles, VisionProjector};

/// 一次生成的结果
#[derive(Debug, Clone)]
pub struct Generation {
    /// 去掉首尾空白后的文本
    pub text: String,
    /// 生成的 token，不含 EOS
    pub tokens: Vec<i64>,
    pub stop_reason: StopReason,
    /// 输出字节不是合法 UTF-8，已做有损解码
    pub degraded: bool,
    pub perf: PerformanceLog,
}

pub struct VlmPipeline<E: TensorEngine> {
    engine: E,
    tokenizer: BpeTokenizer,
    projector: Option<VisionProjector>,
    template: PromptTemplate,
    generation: GenerationConfig,
    image_size: u32,
    image_token_id: i64,
    eos_token_id: i64,
    perf_logger: PerformanceLogger,
}

impl VlmPipeline<OnnxEngine> {
    /// 按配置加载全部产物；加载后各组件不再变化
    pub fn load(config: &PipelineConfig) -> EngineResult<Self> {
        config.validate()?;
        let paths = &config.paths;

        let model_config = if paths.model_config.exists() {
            ModelConfig::from_file(&paths.model_config)?
        } else {
            warn!(path = %paths.model_config.display(), "config.json not found, using defaults");
            ModelConfig::default()
        };

        let tokenizer = BpeTokenizer::from_model_dir(&paths.tokenizer_dir)?;
        let projector = if paths.has_projector() {
            Some(VisionProjector::from_files(&ProjectorFiles {
                l1_weight: &paths.projector_l1_weight,
                l1_bias: &paths.projector_l1_bias,
                l2_weight: &paths.projector_l2_weight,
                l2_bias: &paths.projector_l2_bias,
            })?)
        } else {
            warn!(
                dir = %paths.projector_l1_weight.parent().unwrap_or(Path::new(".")).display(),
                "projector weights not found, vision features must already match the decoder hidden width"
            );
            None
        };
        let engine = OnnxEngine::from_paths(paths, &model_config, config.intra_threads)?;

        let mut pipeline = Self::from_parts(engine, tokenizer, projector, &model_config, config.generation.clone());
        pipeline.template = PromptTemplate::new(config.system_prompt.clone());
        pipeline.image_size = config.image_size;
        Ok(pipeline)
    }
}

impl<E: TensorEngine> VlmPipeline<E> {
    /// 由已加载的组件组装；`<image>` 的 id 优先取 tokenizer 的特殊 token
    pub fn from_parts(
        engine: E,
        tokenizer: BpeTokenizer,
        projector: Option<VisionProjector>,
        model_config: &ModelConfig,
        generation: GenerationConfig,
    ) -> Self {
        let image_token_id = match tokenizer.image_id() {
            Some(id) if id != model_config.image_token_index => {
                warn!(
                    tokenizer = id,
                    config = model_config.image_token_index,
                    "image token id differs between tokenizer and config.json, using tokenizer"
                );
                id
            }
            Some(id) => id,
            None => model_config.image_token_index,
        };

        Self {
            engine,
            tokenizer,
            projector,
            template: PromptTemplate::default(),
            generation,
            image_size: crate::vision::DEFAULT_IMAGE_SIZE,
            image_token_id,
            eos_token_id: model_config.eos_token_id,
            perf_logger: PerformanceLogger::default(),
        }
    }

    pub fn tokenizer(&self) -> &BpeTokenizer {
        &self.tokenizer
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    pub fn generation_config_mut(&mut self) -> &mut GenerationConfig {
        &mut self.generation
    }

    pub fn set_perf_logger(&mut self, logger: PerformanceLogger) {
        self.perf_logger = logger;
    }

    /// 描述一张图片
    pub fn generate(&self, image_path: &Path, instruction: &str) -> EngineResult<Generation> {
        let mut timer = PhaseTimer::start();
        let pixels = preprocess_image(image_path, self.image_size)?;
        let preprocess_ms = timer.lap();
        debug!(image = %image_path.display(), preprocess_ms, "image preprocessed");

        let prompt = self.template.render(instruction);
        let mut generation = self.run(&prompt, &pixels, self.make_rng(), timer)?;
        generation.perf.preprocess_ms = preprocess_ms;
        self.finish_log(&mut generation);
        Ok(generation)
    }

    /// 用现成的 prompt 文本和像素张量生成；prompt 中必须有 `<image>`
    pub fn generate_from_prompt(&self, prompt: &str, pixels: &Array4<f32>) -> EngineResult<Generation> {
        self.generate_with_rng(prompt, pixels, self.make_rng())
    }

    pub fn generate_with_rng<R: Rng>(&self, prompt: &str, pixels: &Array4<f32>, rng: R) -> EngineResult<Generation> {
        let mut generation = self.run(prompt, pixels, rng, PhaseTimer::start())?;
        self.finish_log(&mut generation);
        Ok(generation)
    }

    fn make_rng(&self) -> StdRng {
        match self.generation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn finish_log(&self, generation: &mut Generation) {
        generation.perf.ok = true;
        generation.perf.check_output(&generation.text, generation.degraded);
        self.perf_logger.log(&generation.perf);
    }

    fn run<R: Rng>(&self, prompt: &str, pixels: &Array4<f32>, rng: R, mut timer: PhaseTimer) -> EngineResult<Generation> {
        let mut perf = PerformanceLog::new();

        let ids = self.tokenizer.tokenize(prompt)?;
        let placeholder = find_placeholder(&ids, self.image_token_id).ok_or(EngineError::MissingPlaceholder {
            image_id: self.image_token_id,
        })?;
        perf.prompt_tokens = ids.len();

        let vision = self.vision_features(pixels)?;
        perf.vision_ms = timer.lap();

        let text_embeds = self.engine.embed_tokens(&ids)?;
        if text_embeds.nrows() != ids.len() {
            return Err(EngineError::shape(format!(
                "embedding {} tokens returned {} rows",
                ids.len(),
                text_embeds.nrows()
            )));
        }
        let vision = self.project(vision, text_embeds.ncols())?;
        let fused = fuse_embeddings(text_embeds.view(), placeholder, vision.view())?;
        perf.fused_len = fused.nrows();
        perf.embed_ms = timer.lap();
        debug!(
            prompt_tokens = ids.len(),
            placeholder,
            image_tokens = vision.nrows(),
            fused_len = fused.nrows(),
            "embeddings fused"
        );

        let options = DecodeOptions {
            sampling: self.generation.sampling(),
            max_new_tokens: self.generation.max_new_tokens,
            eos_id: self.eos_token_id,
        };
        let mut session = DecodeSession::new(&self.engine, options, rng);
        session.prefill(fused.view())?;
        perf.prefill_ms = timer.lap();

        while let StepResult::Token(id) = session.step()? {
            if tracing::enabled!(tracing::Level::DEBUG) {
                debug!(id, piece = %self.tokenizer.detokenize(&[id]), "sampled");
            }
        }
        let outcome = session.finish();
        perf.decode_ms = timer.lap();

        let decoded = self.tokenizer.detokenize_checked(&outcome.tokens);
        let text = decoded.text.trim().to_string();

        perf.generated_tokens = outcome.tokens.len();
        perf.stop_reason = Some(outcome.stop_reason.as_str().to_string());
        perf.total_ms = timer.total();
        info!(
            generated = outcome.tokens.len(),
            stop = ?outcome.stop_reason,
            cache_len = outcome.cache_len,
            total_ms = perf.total_ms,
            "generation finished"
        );

        Ok(Generation {
            text,
            tokens: outcome.tokens,
            stop_reason: outcome.stop_reason,
            degraded: decoded.degraded,
            perf,
        })
    }

    /// 视觉编码器输出 [1, T, F] → [T, F]
    fn vision_features(&self, pixels: &Array4<f32>) -> EngineResult<Array2<f32>> {
        let features = self.engine.encode_image(pixels)?;
        if features.len_of(Axis(0)) != 1 {
            return Err(EngineError::shape(format!(
                "vision encoder output {:?}, expected batch size 1",
                features.dim()
            )));
        }
        Ok(features.index_axis_move(Axis(0), 0))
    }

    /// 特征宽度与 hidden 一致时不经过投影
    fn project(&self, features: Array2<f32>, hidden: usize) -> EngineResult<Array2<f32>> {
        if features.ncols() == hidden {
            return Ok(features);
        }
        match &self.projector {
            Some(projector) => projector.forward(features.view()),
            None => Err(EngineError::shape(format!(
                "vision features have width {}, decoder hidden width is {hidden} and no projector is loaded",
                features.ncols()
            ))),
        }
    }
}
