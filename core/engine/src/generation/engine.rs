//! 外部张量计算引擎的接口
//!
//! 视觉编码器、token 嵌入表、decoder 三个计算单元对本 crate 是黑盒，
//! 只约定输入输出形状。ONNX Runtime 实现见 `crate::onnx_engine`。

use ndarray::{Array2, Array3, Array4, ArrayView2};

use super::kv_cache::{CacheLayout, KvCache};
use crate::error::EngineResult;

/// 一次 decoder 调用的输入
pub struct DecoderInput<'a> {
    /// [S, hidden]
    pub inputs_embeds: ArrayView2<'a, f32>,
    /// [cache_len + S]，全 1
    pub attention_mask: Vec<i64>,
    /// [S]，从 cache_len 开始
    pub position_ids: Vec<i64>,
    /// 每层的历史 KV，move 进引擎
    pub past: KvCache,
}

pub struct DecoderOutput {
    /// [S, vocab]
    pub logits: Array2<f32>,
    /// 每层的新 KV，长度 = cache_len + S
    pub present: KvCache,
}

pub trait TensorEngine {
    /// decoder 的层数与 KV 形状
    fn cache_layout(&self) -> CacheLayout;

    /// [1, 3, H, W] → [1, T, feature_width]
    fn encode_image(&self, pixels: &Array4<f32>) -> EngineResult<Array3<f32>>;

    /// ids → [n, hidden]
    fn embed_tokens(&self, ids: &[i64]) -> EngineResult<Array2<f32>>;

    fn decode(&self, input: DecoderInput<'_>) -> EngineResult<DecoderOutput>;
}

impl<E: TensorEngine + ?Sized> TensorEngine for &E {
    fn cache_layout(&self) -> CacheLayout {
        (**self).cache_layout()
    }

    fn encode_image(&self, pixels: &Array4<f32>) -> EngineResult<Array3<f32>> {
        (**self).encode_image(pixels)
    }

    fn embed_tokens(&self, ids: &[i64]) -> EngineResult<Array2<f32>> {
        (**self).embed_tokens(ids)
    }

    fn decode(&self, input: DecoderInput<'_>) -> EngineResult<DecoderOutput> {
        (**self).decode(input)
    }
}
