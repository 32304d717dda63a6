pub mod decode_loop;
pub mod engine;
pub mod kv_cache;

pub use decode_loop::{DecodeOptions, DecodeOutcome, DecodeSession, StepResult, StopReason};
pub use engine::{DecoderInput, DecoderOutput, TensorEngine};
pub use kv_cache::{CacheLayout, KvCache, LayerCache};
