//! 集成测试共用：脚本化的内存引擎与最小 tokenizer

#![allow(dead_code)]

use std::cell::{Cell, RefCell};

use ndarray::{Array2, Array3, Array4};
use vlm_engine::tokenizer::bpe::MergeRanks;
use vlm_engine::tokenizer::{byte_level_vocab, BpeTokenizer, SpecialTokens, TokenRoles, Vocabulary};
use vlm_engine::{CacheLayout, DecoderInput, DecoderOutput, EngineResult, KvCache, LayerCache, TensorEngine};

pub const VOCAB_SIZE: usize = 1100;
pub const HIDDEN: usize = 4;
pub const IM_START: i64 = 1000;
pub const IM_END: i64 = 1001;
pub const IMAGE: i64 = 1002;

/// 一次 decoder 调用时引擎看到的输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeCall {
    pub fed: usize,
    pub past_len: usize,
    pub mask_len: usize,
    pub positions: Vec<i64>,
}

/// 按脚本依次让指定 token 的 logit 最大；脚本用完后一直输出最后一个，空脚本时 logits 全为 0
pub struct ScriptedEngine {
    pub layout: CacheLayout,
    pub script: Vec<i64>,
    pub image_tokens: usize,
    pub feature_width: usize,
    /// 为 true 时 present 比应有的多一个位置
    pub corrupt_cache: bool,
    /// 设置后 present 按这个布局生成，而不是 `layout`
    pub present_layout: Option<CacheLayout>,
    /// 脚本 token 之外，再让这个 token 的 logit 略低一点
    pub runner_up: Option<i64>,
    /// 最近一次 prefill 收到的 inputs_embeds
    pub prefill_embeds: RefCell<Option<Array2<f32>>>,
    pub calls: RefCell<Vec<DecodeCall>>,
    pub vision_calls: Cell<usize>,
    pub embed_calls: Cell<usize>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<i64>) -> Self {
        Self {
            layout: CacheLayout {
                num_layers: 2,
                num_kv_heads: 1,
                head_dim: 2,
            },
            script,
            image_tokens: 3,
            feature_width: HIDDEN,
            corrupt_cache: false,
            present_layout: None,
            runner_up: None,
            prefill_embeds: RefCell::new(None),
            calls: RefCell::new(Vec::new()),
            vision_calls: Cell::new(0),
            embed_calls: Cell::new(0),
        }
    }

    pub fn decode_calls(&self) -> Vec<DecodeCall> {
        self.calls.borrow().clone()
    }
}

impl TensorEngine for ScriptedEngine {
    fn cache_layout(&self) -> CacheLayout {
        self.layout
    }

    fn encode_image(&self, _pixels: &Array4<f32>) -> EngineResult<Array3<f32>> {
        self.vision_calls.set(self.vision_calls.get() + 1);
        Ok(Array3::from_elem((1, self.image_tokens, self.feature_width), 0.5))
    }

    fn embed_tokens(&self, ids: &[i64]) -> EngineResult<Array2<f32>> {
        self.embed_calls.set(self.embed_calls.get() + 1);
        Ok(Array2::from_shape_fn((ids.len(), HIDDEN), |(i, _)| ids[i] as f32))
    }

    fn decode(&self, input: DecoderInput<'_>) -> EngineResult<DecoderOutput> {
        let fed = input.inputs_embeds.nrows();
        let past_len = input.past.seq_len();
        if past_len == 0 {
            *self.prefill_embeds.borrow_mut() = Some(input.inputs_embeds.to_owned());
        }
        let call_index = {
            let mut calls = self.calls.borrow_mut();
            calls.push(DecodeCall {
                fed,
                past_len,
                mask_len: input.attention_mask.len(),
                positions: input.position_ids.clone(),
            });
            calls.len() - 1
        };

        let mut logits = Array2::<f32>::zeros((fed, VOCAB_SIZE));
        if let Some(&target) = self.script.get(call_index).or_else(|| self.script.last()) {
            logits.column_mut(target as usize).fill(40.0);
        }
        if let Some(alt) = self.runner_up {
            logits.column_mut(alt as usize).fill(39.0);
        }

        let layout = self.present_layout.unwrap_or(self.layout);
        let grown = past_len + fed + usize::from(self.corrupt_cache);
        let shape = (1, layout.num_kv_heads, grown, layout.head_dim);
        let layers = (0..layout.num_layers)
            .map(|_| LayerCache {
                key: Array4::zeros(shape),
                value: Array4::zeros(shape),
            })
            .collect();

        Ok(DecoderOutput {
            logits,
            present: KvCache::from_layers(layers)?,
        })
    }
}

/// 256 个字节符号 + "lo"、"low"，以及 im_start / im_end / `<image>` 三个特殊 token
pub fn tiny_tokenizer() -> BpeTokenizer {
    let vocab = Vocabulary::new(byte_level_vocab(["lo", "low"])).unwrap();
    let merges = MergeRanks::from_pairs([("l", "o"), ("lo", "w")]);
    let specials = SpecialTokens::new([("<|im_start|>", IM_START), ("<|im_end|>", IM_END), ("<image>", IMAGE)]);
    BpeTokenizer::from_parts(vocab, merges, specials, TokenRoles::default()).unwrap()
}
