//! 基于 ONNX Runtime 的 `TensorEngine`
//!
//! 三个 session：vision_encoder / embed_tokens / decoder_model_merged。
//! decoder 的输入按名字绑定，输出优先按名字读取，找不到时按位置
//! （logits 在前，随后每层 key、value）。

use ndarray::{Array2, Array3, Array4, Axis, Ix3, Ix4};
use ort::{Session, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config_manager::{ArtifactPaths, ModelConfig};
use crate::error::{EngineError, EngineResult};
use crate::generation::{CacheLayout, DecoderInput, DecoderOutput, KvCache, LayerCache, TensorEngine};
use crate::onnx_utils::{extract_f32, init_onnx_runtime, input_index, load_session, output_index, run_session, Feed};

const PAST_PREFIX: &str = "past_key_values.";
const PRESENT_PREFIX: &str = "present.";

/// decoder 的一个 KV 输入/输出名：`past_key_values.{layer}.key|value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum KvSlot {
    Key(usize),
    Value(usize),
}

fn parse_kv_name(name: &str, prefix: &str) -> Option<KvSlot> {
    let rest = name.strip_prefix(prefix)?;
    let (layer, kind) = rest.split_once('.')?;
    let layer: usize = layer.parse().ok()?;
    match kind {
        "key" => Some(KvSlot::Key(layer)),
        "value" => Some(KvSlot::Value(layer)),
        _ => None,
    }
}

pub struct OnnxEngine {
    vision_session: Mutex<Session>,
    embed_session: Mutex<Session>,
    decoder_session: Mutex<Session>,
    layout: CacheLayout,
}

impl OnnxEngine {
    /// 加载三个模型；KV 形状优先取 decoder 输入的元数据，缺失的维度用 config.json 补齐
    pub fn from_paths(paths: &ArtifactPaths, model_config: &ModelConfig, intra_threads: usize) -> EngineResult<Self> {
        let env = init_onnx_runtime("vlm_engine")?;
        let vision_session = load_session(&env, &paths.vision_encoder, intra_threads)?;
        let embed_session = load_session(&env, &paths.embed_tokens, intra_threads)?;
        let decoder_session = load_session(&env, &paths.decoder, intra_threads)?;
        if input_index(&decoder_session, "inputs_embeds").is_none() {
            return Err(EngineError::artifact(&paths.decoder, "decoder does not take inputs_embeds"));
        }

        let layout = infer_cache_layout(&decoder_session, model_config, &paths.decoder)?;
        info!(
            layers = layout.num_layers,
            kv_heads = layout.num_kv_heads,
            head_dim = layout.head_dim,
            "decoder cache layout"
        );

        Ok(Self {
            vision_session: Mutex::new(vision_session),
            embed_session: Mutex::new(embed_session),
            decoder_session: Mutex::new(decoder_session),
            layout,
        })
    }
}

fn lock<'a>(session: &'a Mutex<Session>, what: &str) -> EngineResult<MutexGuard<'a, Session>> {
    session
        .lock()
        .map_err(|_| EngineError::runtime(format!("{what} session lock poisoned")))
}

fn infer_cache_layout(session: &Session, config: &ModelConfig, path: &Path) -> EngineResult<CacheLayout> {
    let fallback = config.cache_layout();

    let mut layers = 0usize;
    let mut heads = None;
    let mut head_dim = None;
    for input in &session.inputs {
        if let Some(KvSlot::Key(layer)) = parse_kv_name(&input.name, PAST_PREFIX) {
            layers = layers.max(layer + 1);
            if let [_, h, _, d] = input.dimensions.as_slice() {
                heads = heads.or(h.map(|v| v as usize));
                head_dim = head_dim.or(d.map(|v| v as usize));
            }
        }
    }

    if layers == 0 {
        return Err(EngineError::artifact(path, "decoder has no past_key_values inputs"));
    }
    if let Some(fb) = fallback {
        if fb.num_layers != layers {
            warn!(
                from_model = layers,
                from_config = fb.num_layers,
                "layer count in config.json disagrees with decoder inputs"
            );
        }
    }

    let num_kv_heads = heads
        .or(fallback.map(|f| f.num_kv_heads))
        .ok_or_else(|| EngineError::artifact(path, "cannot determine kv head count"))?;
    let head_dim = head_dim
        .or(fallback.map(|f| f.head_dim))
        .ok_or_else(|| EngineError::artifact(path, "cannot determine kv head dim"))?;

    Ok(CacheLayout {
        num_layers: layers,
        num_kv_heads,
        head_dim,
    })
}

fn into_fixed<D: ndarray::Dimension>(array: ndarray::ArrayD<f32>, what: &str) -> EngineResult<ndarray::Array<f32, D>> {
    let shape = array.shape().to_vec();
    array
        .into_dimensionality::<D>()
        .map_err(|_| EngineError::shape(format!("{what} has unexpected shape {shape:?}")))
}

impl TensorEngine for OnnxEngine {
    fn cache_layout(&self) -> CacheLayout {
        self.layout
    }

    fn encode_image(&self, pixels: &Array4<f32>) -> EngineResult<Array3<f32>> {
        let session = lock(&self.vision_session, "vision encoder")?;
        let feeds = [Feed::f32(pixels.clone())];
        let outputs = run_session(&session, &feeds, "vision encoder")?;
        let first = outputs
            .first()
            .ok_or_else(|| EngineError::runtime("vision encoder returned no outputs"))?;
        into_fixed::<Ix3>(extract_f32(first, "image features")?, "image features")
    }

    fn embed_tokens(&self, ids: &[i64]) -> EngineResult<Array2<f32>> {
        let session = lock(&self.embed_session, "embed_tokens")?;
        let input_ids = Array2::from_shape_vec((1, ids.len()), ids.to_vec())
            .map_err(|e| EngineError::shape(e.to_string()))?;
        let feeds = [Feed::i64(input_ids)];
        let outputs = run_session(&session, &feeds, "embed_tokens")?;
        let first = outputs
            .first()
            .ok_or_else(|| EngineError::runtime("embed_tokens returned no outputs"))?;
        let embeds = into_fixed::<Ix3>(extract_f32(first, "token embeddings")?, "token embeddings")?;
        if embeds.len_of(Axis(0)) != 1 {
            return Err(EngineError::shape(format!("token embeddings batch {:?}", embeds.dim())));
        }
        Ok(embeds.index_axis_move(Axis(0), 0))
    }

    fn decode(&self, input: DecoderInput<'_>) -> EngineResult<DecoderOutput> {
        let session = lock(&self.decoder_session, "decoder")?;
        let seq_len = input.inputs_embeds.nrows();
        let past_len = input.past.seq_len();

        let mut past: HashMap<KvSlot, Array4<f32>> = HashMap::new();
        for (layer, cache) in input.past.into_layers().into_iter().enumerate() {
            past.insert(KvSlot::Key(layer), cache.key);
            past.insert(KvSlot::Value(layer), cache.value);
        }

        let mut feeds = Vec::with_capacity(session.inputs.len());
        for meta in &session.inputs {
            let feed = match meta.name.as_str() {
                "inputs_embeds" => Feed::f32(input.inputs_embeds.insert_axis(Axis(0)).to_owned()),
                "attention_mask" => Feed::i64(
                    Array2::from_shape_vec((1, input.attention_mask.len()), input.attention_mask.clone())
                        .map_err(|e| EngineError::shape(e.to_string()))?,
                ),
                "position_ids" => Feed::i64(
                    Array2::from_shape_vec((1, input.position_ids.len()), input.position_ids.clone())
                        .map_err(|e| EngineError::shape(e.to_string()))?,
                ),
                "use_cache_branch" => Feed::boolean(ndarray::arr1(&[past_len > 0])),
                name => {
                    let slot = parse_kv_name(name, PAST_PREFIX)
                        .ok_or_else(|| EngineError::runtime(format!("unsupported decoder input {name}")))?;
                    let tensor = past
                        .remove(&slot)
                        .ok_or_else(|| EngineError::shape(format!("no cache tensor for decoder input {name}")))?;
                    Feed::f32(tensor)
                }
            };
            feeds.push(feed);
        }

        let outputs = run_session(&session, &feeds, "decoder")?;
        let logits_index = output_index(&session, "logits").unwrap_or(0);
        let logits_value = outputs
            .get(logits_index)
            .ok_or_else(|| EngineError::runtime("decoder returned no logits"))?;
        let logits = into_fixed::<Ix3>(extract_f32(logits_value, "logits")?, "logits")?;
        if logits.len_of(Axis(0)) != 1 || logits.len_of(Axis(1)) != seq_len {
            return Err(EngineError::shape(format!(
                "logits shape {:?} for {seq_len} fed positions",
                logits.dim()
            )));
        }
        let logits: Array2<f32> = logits.index_axis_move(Axis(0), 0);

        let mut layers = Vec::with_capacity(self.layout.num_layers);
        for layer in 0..self.layout.num_layers {
            let key = present_tensor(&session, &outputs, layer, "key", 1 + 2 * layer)?;
            let value = present_tensor(&session, &outputs, layer, "value", 2 + 2 * layer)?;
            layers.push(LayerCache { key, value });
        }

        Ok(DecoderOutput {
            logits,
            present: KvCache::from_layers(layers)?,
        })
    }
}

fn present_tensor(
    session: &Session,
    outputs: &[Value<'static>],
    layer: usize,
    kind: &str,
    positional: usize,
) -> EngineResult<Array4<f32>> {
    let name = format!("{PRESENT_PREFIX}{layer}.{kind}");
    let index = output_index(session, &name).unwrap_or(positional);
    let value = outputs
        .get(index)
        .ok_or_else(|| EngineError::shape(format!("decoder output {name} missing")))?;
    into_fixed::<Ix4>(extract_f32(value, &name)?, &name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kv_name() {
        assert_eq!(parse_kv_name("past_key_values.0.key", PAST_PREFIX), Some(KvSlot::Key(0)));
        assert_eq!(parse_kv_name("past_key_values.23.value", PAST_PREFIX), Some(KvSlot::Value(23)));
        assert_eq!(parse_kv_name("present.4.key", PRESENT_PREFIX), Some(KvSlot::Key(4)));
        assert_eq!(parse_kv_name("past_key_values.x.key", PAST_PREFIX), None);
        assert_eq!(parse_kv_name("attention_mask", PAST_PREFIX), None);
        assert_eq!(parse_kv_name("past_key_values.1.query", PAST_PREFIX), None);
    }
}
