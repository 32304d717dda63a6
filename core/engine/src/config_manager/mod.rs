//! 配置：模型 config.json、生成参数、产物路径、流水线配置（TOML）

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::generation::CacheLayout;
use crate::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::sampling::SamplingParams;
use crate::tokenizer::vocab::read_json_file;
use crate::vision::DEFAULT_IMAGE_SIZE;

pub const DEFAULT_IMAGE_TOKEN_INDEX: i64 = 151646;
pub const DEFAULT_EOS_TOKEN_ID: i64 = 151645;

/// `eos_token_id` 在 config.json 里可能是整数，也可能是列表
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIdField {
    One(i64),
    Many(Vec<i64>),
}

impl TokenIdField {
    fn first(&self) -> Option<i64> {
        match self {
            TokenIdField::One(id) => Some(*id),
            TokenIdField::Many(ids) => ids.first().copied(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawModelConfig {
    hidden_size: Option<usize>,
    mm_hidden_size: Option<usize>,
    image_token_index: Option<i64>,
    eos_token_id: Option<TokenIdField>,
    num_hidden_layers: Option<usize>,
    num_attention_heads: Option<usize>,
    num_key_value_heads: Option<usize>,
    head_dim: Option<usize>,
}

/// config.json 中用到的字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub hidden_size: Option<usize>,
    pub mm_hidden_size: Option<usize>,
    pub image_token_index: i64,
    pub eos_token_id: i64,
    pub num_hidden_layers: Option<usize>,
    pub num_attention_heads: Option<usize>,
    pub num_key_value_heads: Option<usize>,
    pub head_dim: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: None,
            mm_hidden_size: None,
            image_token_index: DEFAULT_IMAGE_TOKEN_INDEX,
            eos_token_id: DEFAULT_EOS_TOKEN_ID,
            num_hidden_layers: None,
            num_attention_heads: None,
            num_key_value_heads: None,
            head_dim: None,
        }
    }
}

impl ModelConfig {
    pub fn parse(content: &str) -> EngineResult<Self> {
        let raw: RawModelConfig = serde_json::from_str(content)?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw: RawModelConfig = read_json_file(path)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawModelConfig) -> Self {
        Self {
            hidden_size: raw.hidden_size,
            mm_hidden_size: raw.mm_hidden_size,
            image_token_index: raw.image_token_index.unwrap_or(DEFAULT_IMAGE_TOKEN_INDEX),
            eos_token_id: raw
                .eos_token_id
                .as_ref()
                .and_then(TokenIdField::first)
                .unwrap_or(DEFAULT_EOS_TOKEN_ID),
            num_hidden_layers: raw.num_hidden_layers,
            num_attention_heads: raw.num_attention_heads,
            num_key_value_heads: raw.num_key_value_heads,
            head_dim: raw.head_dim,
        }
    }

    /// 由 config.json 推出 KV cache 形状；字段不全时返回 None
    pub fn cache_layout(&self) -> Option<CacheLayout> {
        let num_layers = self.num_hidden_layers?;
        let heads = self.num_attention_heads?;
        let num_kv_heads = self.num_key_value_heads.unwrap_or(heads);
        let head_dim = match self.head_dim {
            Some(d) => d,
            None => self.hidden_size? / heads.max(1),
        };
        Some(CacheLayout {
            num_layers,
            num_kv_heads,
            head_dim,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub max_new_tokens: usize,
    /// 不设时每次运行使用系统熵
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let sampling = SamplingParams::default();
        Self {
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            repetition_penalty: sampling.repetition_penalty,
            max_new_tokens: 96,
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
        }
    }
}

/// 所有模型产物的路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub vision_encoder: PathBuf,
    pub embed_tokens: PathBuf,
    pub decoder: PathBuf,
    /// vocab.json / merges.txt / tokenizer_config.json / special_tokens_map.json 所在目录
    pub tokenizer_dir: PathBuf,
    pub model_config: PathBuf,
    pub projector_l1_weight: PathBuf,
    pub projector_l1_bias: PathBuf,
    pub projector_l2_weight: PathBuf,
    pub projector_l2_bias: PathBuf,
}

impl ArtifactPaths {
    /// 约定的目录布局：
    /// - `<root>/FastVLM-onnx/onnx/{vision_encoder,embed_tokens,decoder_model_merged}*.onnx`
    /// - `<root>/FastVLM-onnx/{config.json,vocab.json,merges.txt,...}`
    /// - `<root>/vision_projector_l{1,2}_{w,b}.bin`
    ///
    /// onnx 目录里有多个变体（如 `_fp16`、`_q4`）时取文件名排序后的第一个
    pub fn from_root(root: &Path) -> EngineResult<Self> {
        let model_dir = root.join("FastVLM-onnx");
        let onnx_dir = model_dir.join("onnx");
        Ok(Self {
            vision_encoder: find_onnx(&onnx_dir, "vision_encoder")?,
            embed_tokens: find_onnx(&onnx_dir, "embed_tokens")?,
            decoder: find_onnx(&onnx_dir, "decoder_model_merged")?,
            tokenizer_dir: model_dir.clone(),
            model_config: model_dir.join("config.json"),
            projector_l1_weight: root.join("vision_projector_l1_w.bin"),
            projector_l1_bias: root.join("vision_projector_l1_b.bin"),
            projector_l2_weight: root.join("vision_projector_l2_w.bin"),
            projector_l2_bias: root.join("vision_projector_l2_b.bin"),
        })
    }

    /// 四个投影层权重文件是否都在；视觉编码器直接输出 hidden 维特征时可以没有
    pub fn has_projector(&self) -> bool {
        [
            &self.projector_l1_weight,
            &self.projector_l1_bias,
            &self.projector_l2_weight,
            &self.projector_l2_bias,
        ]
        .iter()
        .all(|path| path.is_file())
    }
}

/// 在目录中找 `<prefix>*.onnx`；没有变体时返回 `<prefix>.onnx`（由加载时报告缺失）
fn find_onnx(dir: &Path, prefix: &str) -> EngineResult<PathBuf> {
    let exact = dir.join(format!("{prefix}.onnx"));
    if exact.exists() || !dir.is_dir() {
        return Ok(exact);
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension().map_or(false, |ext| ext == "onnx")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(prefix))
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next().unwrap_or(exact))
}

/// 流水线的完整配置，可从 TOML 读取
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub paths: ArtifactPaths,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_image_size() -> u32 {
    DEFAULT_IMAGE_SIZE
}

fn default_intra_threads() -> usize {
    2
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl PipelineConfig {
    pub fn from_root(root: &Path) -> EngineResult<Self> {
        Ok(Self::with_paths(ArtifactPaths::from_root(root)?))
    }

    pub fn with_paths(paths: ArtifactPaths) -> Self {
        Self {
            paths,
            generation: GenerationConfig::default(),
            image_size: default_image_size(),
            intra_threads: default_intra_threads(),
            system_prompt: default_system_prompt(),
        }
    }

    pub fn parse_toml(content: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> EngineResult<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| EngineError::artifact(path, format!("failed to read: {e}")))?;
        let config = Self::parse_toml(&content)?;
        info!(config = %path.display(), "pipeline config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.image_size == 0 {
            return Err(EngineError::config("image_size must be positive"));
        }
        self.generation.sampling().validate()
    }
}
