//! Decoder 的 KV cache
//!
//! 每层一对 (key, value)，形状 [1, kv_heads, positions, head_dim]。
//! 只属于一次生成，不实现 Clone；每次 decoder 调用把旧 cache move 进去，拿回长大的新 cache。

use ndarray::{Array4, Axis};

use crate::error::{EngineError, EngineResult};

/// 层数与每层 KV 的形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

#[derive(Debug)]
pub struct LayerCache {
    pub key: Array4<f32>,
    pub value: Array4<f32>,
}

impl LayerCache {
    pub fn seq_len(&self) -> usize {
        self.key.len_of(Axis(2))
    }
}

#[derive(Debug)]
pub struct KvCache {
    layers: Vec<LayerCache>,
}

impl KvCache {
    /// 第一次调用 decoder 用的空 cache（positions = 0）
    pub fn empty(layout: CacheLayout) -> Self {
        let shape = (1, layout.num_kv_heads, 0, layout.head_dim);
        let layers = (0..layout.num_layers)
            .map(|_| LayerCache {
                key: Array4::zeros(shape),
                value: Array4::zeros(shape),
            })
            .collect();
        Self { layers }
    }

    /// 由引擎返回的 present.* 张量构建，检查每层 key/value 形状一致、各层长度一致
    pub fn from_layers(layers: Vec<LayerCache>) -> EngineResult<Self> {
        let mut expected_len = None;
        for (i, layer) in layers.iter().enumerate() {
            if layer.key.shape() != layer.value.shape() {
                return Err(EngineError::shape(format!(
                    "layer {i}: key shape {:?} differs from value shape {:?}",
                    layer.key.shape(),
                    layer.value.shape()
                )));
            }
            if layer.key.len_of(Axis(0)) != 1 {
                return Err(EngineError::shape(format!(
                    "layer {i}: expected batch size 1, got {}",
                    layer.key.len_of(Axis(0))
                )));
            }
            let len = layer.seq_len();
            match expected_len {
                None => expected_len = Some(len),
                Some(expected) if expected != len => {
                    return Err(EngineError::shape(format!(
                        "layer {i}: cache length {len} differs from layer 0 length {expected}"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// 已缓存的位置数，只从张量形状读取
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(LayerCache::seq_len).unwrap_or(0)
    }

    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    pub fn into_layers(self) -> Vec<LayerCache> {
        self.layers
    }

    /// 检查 `self`（present）是否符合 `layout` 的层数与每层形状，且恰好是 `past_len` + `fed` 个位置
    pub(crate) fn check_growth(&self, layout: CacheLayout, past_len: usize, fed: usize) -> EngineResult<()> {
        if self.num_layers() != layout.num_layers {
            return Err(EngineError::shape(format!(
                "decoder returned {} cache layers, expected {}",
                self.num_layers(),
                layout.num_layers
            )));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            let shape = layer.key.shape();
            if shape[1] != layout.num_kv_heads || shape[3] != layout.head_dim {
                return Err(EngineError::shape(format!(
                    "layer {i}: cache shape {shape:?}, expected [1, {}, _, {}]",
                    layout.num_kv_heads, layout.head_dim
                )));
            }
        }
        let expected = past_len + fed;
        if self.seq_len() != expected {
            return Err(EngineError::shape(format!(
                "decoder cache grew to {} positions, expected {past_len} + {fed} = {expected}",
                self.seq_len()
            )));
        }
        Ok(())
    }
}
