//! 自回归解码循环
//!
//! 状态机：`Prefill` → `Step` → `Done`
//! - prefill：整段融合后的嵌入一次送入 decoder，cache 为空
//! - step：采样一个 token；遇到 EOS 或达到 max_new_tokens 即停止，否则嵌入该 token 再调用一次 decoder
//! - done：输出已生成的 token（不含 EOS）
//!
//! 每次调用之间都可以放弃会话，不会中断正在进行的计算。

use ndarray::ArrayView2;
use rand::Rng;
use tracing::debug;

use super::engine::{DecoderInput, TensorEngine};
use super::kv_cache::{CacheLayout, KvCache};
use crate::error::{EngineError, EngineResult};
use crate::sampling::{sample, SamplingParams, TokenCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 采样到 EOS
    Eos,
    /// 生成数达到 max_new_tokens
    MaxTokens,
    /// 调用方在结束前放弃
    Abandoned,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Eos => "eos",
            StopReason::MaxTokens => "max_tokens",
            StopReason::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Token(i64),
    Finished(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Prefill,
    Step,
    Done(StopReason),
}

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub sampling: SamplingParams,
    pub max_new_tokens: usize,
    pub eos_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOutcome {
    /// 生成的 token，不含 EOS
    pub tokens: Vec<i64>,
    pub stop_reason: StopReason,
    /// 结束时 cache 中的位置数
    pub cache_len: usize,
    /// decoder 调用次数（含 prefill）
    pub decoder_calls: usize,
}

/// 一次生成的会话，持有该次生成独占的 KV cache 与 token 计数
pub struct DecodeSession<'e, E: TensorEngine + ?Sized, R: Rng> {
    engine: &'e E,
    rng: R,
    options: DecodeOptions,
    layout: CacheLayout,
    state: SessionState,
    cache: Option<KvCache>,
    next_logits: Vec<f32>,
    counts: TokenCounts,
    generated: Vec<i64>,
    decoder_calls: usize,
}

impl<'e, E: TensorEngine + ?Sized, R: Rng> DecodeSession<'e, E, R> {
    pub fn new(engine: &'e E, options: DecodeOptions, rng: R) -> Self {
        let layout = engine.cache_layout();
        Self {
            engine,
            rng,
            options,
            layout,
            state: SessionState::Prefill,
            cache: None,
            next_logits: Vec::new(),
            counts: TokenCounts::new(),
            generated: Vec::new(),
            decoder_calls: 0,
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map(KvCache::seq_len).unwrap_or(0)
    }

    pub fn generated(&self) -> &[i64] {
        &self.generated
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, SessionState::Done(_))
    }

    /// 送入完整的融合序列 [S, hidden]
    pub fn prefill(&mut self, embeds: ArrayView2<'_, f32>) -> EngineResult<()> {
        if self.state != SessionState::Prefill {
            return Err(EngineError::runtime("prefill called on a session that already started"));
        }
        let seq_len = embeds.nrows();
        if seq_len == 0 {
            return Err(EngineError::shape("prefill sequence is empty"));
        }

        let past = KvCache::empty(self.layout);
        self.forward(embeds, past)?;
        debug!(seq_len, cache_len = self.cache_len(), "prefill done");

        if self.options.max_new_tokens == 0 {
            self.state = SessionState::Done(StopReason::MaxTokens);
        } else {
            self.state = SessionState::Step;
        }
        Ok(())
    }

    /// 采样一个 token；除非已停止，否则随后用它推进一次 decoder
    pub fn step(&mut self) -> EngineResult<StepResult> {
        match self.state {
            SessionState::Prefill => return Err(EngineError::runtime("step called before prefill")),
            SessionState::Done(reason) => return Ok(StepResult::Finished(reason)),
            SessionState::Step => {}
        }

        let id = sample(&self.next_logits, &self.counts, &self.options.sampling, &mut self.rng)?;
        self.counts.record(id);

        if id == self.options.eos_id {
            debug!(step = self.generated.len(), id, "eos sampled");
            self.state = SessionState::Done(StopReason::Eos);
            return Ok(StepResult::Finished(StopReason::Eos));
        }

        self.generated.push(id);
        if self.generated.len() >= self.options.max_new_tokens {
            debug!(step = self.generated.len() - 1, id, "max_new_tokens reached");
            self.state = SessionState::Done(StopReason::MaxTokens);
            return Ok(StepResult::Token(id));
        }

        let embedded = self.engine.embed_tokens(&[id])?;
        if embedded.nrows() != 1 {
            return Err(EngineError::shape(format!(
                "embedding one token returned {} rows",
                embedded.nrows()
            )));
        }
        let past = self
            .cache
            .take()
            .ok_or_else(|| EngineError::runtime("decode session lost its cache"))?;
        self.forward(embedded.view(), past)?;
        debug!(step = self.generated.len() - 1, id, cache_len = self.cache_len(), "decode step");
        Ok(StepResult::Token(id))
    }

    /// 结束会话；未到终态时 stop_reason 为 `Abandoned`
    pub fn finish(self) -> DecodeOutcome {
        let stop_reason = match self.state {
            SessionState::Done(reason) => reason,
            _ => StopReason::Abandoned,
        };
        let cache_len = self.cache_len();
        DecodeOutcome {
            tokens: self.generated,
            stop_reason,
            cache_len,
            decoder_calls: self.decoder_calls,
        }
    }

    /// prefill 后一直 step 直到结束
    pub fn run(mut self, embeds: ArrayView2<'_, f32>) -> EngineResult<DecodeOutcome> {
        self.prefill(embeds)?;
        while let StepResult::Token(_) = self.step()? {}
        Ok(self.finish())
    }

    fn forward(&mut self, embeds: ArrayView2<'_, f32>, past: KvCache) -> EngineResult<()> {
        let fed = embeds.nrows();
        let past_len = past.seq_len();
        let total = past_len + fed;

        let output = self.engine.decode(DecoderInput {
            inputs_embeds: embeds,
            attention_mask: vec![1; total],
            position_ids: (past_len..total).map(|p| p as i64).collect(),
            past,
        })?;
        self.decoder_calls += 1;

        output.present.check_growth(self.layout, past_len, fed)?;
        if output.logits.nrows() != fed || output.logits.ncols() == 0 {
            return Err(EngineError::shape(format!(
                "decoder returned logits of shape {:?} for {fed} positions",
                output.logits.dim()
            )));
        }

        self.next_logits = output.logits.row(fed - 1).to_vec();
        self.cache = Some(output.present);
        Ok(())
    }
}
