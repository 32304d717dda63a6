//! 下一个 token 的采样：重复惩罚 → 温度 → softmax → top-p 截断 → 按概率抽样
//!
//! 随机数源由调用方注入，固定种子时整个生成过程可复现。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

/// 温度的下限，避免除零
pub const MIN_TEMPERATURE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            repetition_penalty: 1.1,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::config(format!("top_p must be in (0, 1], got {}", self.top_p)));
        }
        if !(self.repetition_penalty >= 1.0) {
            return Err(EngineError::config(format!(
                "repetition_penalty must be >= 1, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }

    fn effective_temperature(&self) -> f64 {
        let t = self.temperature as f64;
        if t.is_finite() && t > MIN_TEMPERATURE {
            t
        } else {
            MIN_TEMPERATURE
        }
    }
}

/// 本次生成中每个 token 出现的次数（只增不减）
#[derive(Debug, Clone, Default)]
pub struct TokenCounts {
    counts: HashMap<i64, u32>,
}

impl TokenCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: i64) {
        *self.counts.entry(id).or_insert(0) += 1;
    }

    pub fn count(&self, id: i64) -> u32 {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, u32)> + '_ {
        self.counts.iter().map(|(&id, &n)| (id, n))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// 对出现过的 token：正 logit 除以 penalty，非正 logit 乘以 penalty
pub fn apply_repetition_penalty(logits: &mut [f64], counts: &TokenCounts, penalty: f64) {
    for (id, n) in counts.iter() {
        if n == 0 || id < 0 {
            continue;
        }
        let Some(logit) = logits.get_mut(id as usize) else {
            continue;
        };
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

/// 数值稳定的 softmax（先减去最大值）
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut probs: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f64 = probs.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        probs.iter_mut().for_each(|p| *p /= sum);
    }
    probs
}

/// top-p 截断：按概率降序，保留累计概率首次 ≥ top_p 的最短前缀（至少一个），并重新归一化
///
/// 返回 (token id, 归一化后的概率)，按概率降序
pub fn nucleus(probs: &[f64], top_p: f64) -> Vec<(usize, f64)> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    // 稳定排序，概率相同的 id 保持原有顺序
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let keep = if top_p >= 1.0 {
        order.len()
    } else {
        let mut cumulative = 0.0;
        let mut keep = order.len();
        for (i, &id) in order.iter().enumerate() {
            cumulative += probs[id];
            if cumulative >= top_p {
                keep = i + 1;
                break;
            }
        }
        keep.max(1).min(order.len())
    };

    let kept: Vec<(usize, f64)> = order[..keep].iter().map(|&id| (id, probs[id])).collect();
    let mass: f64 = kept.iter().map(|(_, p)| p).sum();
    if mass > 0.0 {
        kept.into_iter().map(|(id, p)| (id, p / mass)).collect()
    } else {
        let uniform = 1.0 / kept.len().max(1) as f64;
        kept.into_iter().map(|(id, _)| (id, uniform)).collect()
    }
}

/// 用一个 [0,1) 的均匀随机数在截断后的分布中选取
fn pick(kept: &[(usize, f64)], draw: f64) -> usize {
    let mut cumulative = 0.0;
    for &(id, p) in kept {
        cumulative += p;
        if draw < cumulative {
            return id;
        }
    }
    kept.last().map(|&(id, _)| id).unwrap_or(0)
}

/// 采样下一个 token id
pub fn sample<R: Rng>(
    logits: &[f32],
    counts: &TokenCounts,
    params: &SamplingParams,
    rng: &mut R,
) -> EngineResult<i64> {
    if logits.is_empty() {
        return Err(EngineError::shape("cannot sample from empty logits"));
    }

    let mut scores: Vec<f64> = logits.iter().map(|&l| l as f64).collect();
    apply_repetition_penalty(&mut scores, counts, params.repetition_penalty as f64);

    let temperature = params.effective_temperature();
    scores.iter_mut().for_each(|s| *s /= temperature);

    let probs = softmax(&scores);
    let kept = nucleus(&probs, params.top_p as f64);
    let draw: f64 = rng.gen();
    Ok(pick(&kept, draw) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_top_p_one_keeps_everything() {
        let probs = softmax(&[1.0, 2.0, 3.0, 0.5]);
        let kept = nucleus(&probs, 1.0);
        assert_eq!(kept.len(), 4);
        let total: f64 = kept.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tiny_top_p_keeps_only_argmax() {
        let logits = [0.3f32, 2.5, -1.0, 2.4];
        let counts = TokenCounts::new();
        for temperature in [0.01f32, 0.7, 1.0, 5.0] {
            let params = SamplingParams {
                temperature,
                top_p: 1e-9,
                repetition_penalty: 1.0,
            };
            let mut rng = StdRng::seed_from_u64(7);
            for _ in 0..20 {
                assert_eq!(sample(&logits, &counts, &params, &mut rng).unwrap(), 1);
            }
        }
    }

    #[test]
    fn test_nucleus_smallest_prefix() {
        // 降序概率 0.5, 0.3, 0.2：top_p = 0.7 需要前两个
        let kept = nucleus(&[0.2, 0.5, 0.3], 0.7);
        let ids: Vec<usize> = kept.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!((kept[0].1 - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_repetition_penalty_is_monotonic_for_positive_logits() {
        let mut counts = TokenCounts::new();
        counts.record(0);
        let mut previous = f64::INFINITY;
        for penalty in [1.0, 1.1, 1.5, 2.0, 4.0] {
            let mut logits = vec![3.0, 1.0];
            apply_repetition_penalty(&mut logits, &counts, penalty);
            assert!(logits[0] <= previous);
            if penalty > 1.0 {
                assert!(logits[0] < previous);
            }
            assert_eq!(logits[1], 1.0);
            previous = logits[0];
        }
    }

    #[test]
    fn test_repetition_penalty_pushes_negative_logits_down() {
        let mut counts = TokenCounts::new();
        counts.record(1);
        let mut logits = vec![0.0, -2.0];
        apply_repetition_penalty(&mut logits, &counts, 1.5);
        assert_eq!(logits[1], -3.0);
    }

    #[test]
    fn test_zero_temperature_is_clamped() {
        let params = SamplingParams {
            temperature: 0.0,
            top_p: 1.0,
            repetition_penalty: 1.0,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let id = sample(&[0.0, 1.0, 0.5], &TokenCounts::new(), &params, &mut rng).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let logits = [1.0f32, 1.2, 0.9, 1.1, 0.2];
        let params = SamplingParams::default();
        let counts = TokenCounts::new();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..16)
                .map(|_| sample(&logits, &counts, &params, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn test_validate_rejects_bad_params() {
        let bad_top_p = SamplingParams {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(bad_top_p.validate().is_err());
        let bad_penalty = SamplingParams {
            repetition_penalty: 0.9,
            ..Default::default()
        };
        assert!(bad_penalty.validate().is_err());
        assert!(SamplingParams::default().validate().is_ok());
    }
}
