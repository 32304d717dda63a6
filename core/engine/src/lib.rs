pub mod config_manager;
pub mod error;
pub mod fusion;
pub mod generation;
pub mod onnx_engine;
pub mod onnx_utils;
pub mod performance_logger;
pub mod pipeline;
pub mod prompt;
pub mod sampling;
pub mod tokenizer;
pub mod vision;

pub use config_manager::{ArtifactPaths, GenerationConfig, ModelConfig, PipelineConfig};
pub use error::{EngineError, EngineResult};
pub use fusion::{find_placeholder, fuse_at_image_token, fuse_embeddings};
pub use generation::{
    CacheLayout, DecodeOptions, DecodeOutcome, DecodeSession, DecoderInput, DecoderOutput, KvCache, LayerCache,
    StepResult, StopReason, TensorEngine,
};
pub use onnx_engine::OnnxEngine;
pub use performance_logger::{PerformanceLog, PerformanceLogger};
pub use pipeline::{Generation, VlmPipeline};
pub use prompt::PromptTemplate;
pub use sampling::{sample, SamplingParams, TokenCounts};
pub use tokenizer::{BpeTokenizer, Detokenized, TokenRoles};
pub use vision::{preprocess_image, VisionProjector};
