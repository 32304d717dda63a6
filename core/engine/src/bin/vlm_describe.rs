use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vlm_engine::config_manager::PipelineConfig;
use vlm_engine::pipeline::VlmPipeline;

const DEFAULT_INSTRUCTION: &str = "Describe this image in detail in English.";

/// 对一张图片生成文字描述
#[derive(Debug, Parser)]
#[command(name = "vlm_describe", version, about)]
struct Args {
    /// 图片路径
    #[arg(long)]
    image: PathBuf,

    /// 用户指令
    #[arg(long, default_value = DEFAULT_INSTRUCTION)]
    prompt: String,

    /// TOML 配置文件；不指定时按 --model-root 的约定布局查找模型
    #[arg(long)]
    config: Option<PathBuf>,

    /// 模型根目录
    #[arg(long, default_value = "models")]
    model_root: PathBuf,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    repetition_penalty: Option<f32>,

    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// 固定随机种子，输出可复现
    #[arg(long)]
    seed: Option<u64>,

    /// 输出逐 token 的调试日志
    #[arg(long, short)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    // 1. 加载配置
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::from_root(&args.model_root)
            .with_context(|| format!("failed to resolve models under {}", args.model_root.display()))?,
    };

    // 2. 命令行参数覆盖配置
    let generation = &mut config.generation;
    if let Some(v) = args.temperature {
        generation.temperature = v;
    }
    if let Some(v) = args.top_p {
        generation.top_p = v;
    }
    if let Some(v) = args.repetition_penalty {
        generation.repetition_penalty = v;
    }
    if let Some(v) = args.max_new_tokens {
        generation.max_new_tokens = v;
    }
    if args.seed.is_some() {
        generation.seed = args.seed;
    }

    // 3. 加载模型
    let pipeline = VlmPipeline::load(&config).context("failed to load pipeline")?;

    // 4. 生成
    let output = pipeline
        .generate(&args.image, &args.prompt)
        .with_context(|| format!("failed to describe {}", args.image.display()))?;

    println!("{}", output.text);
    Ok(())
}
