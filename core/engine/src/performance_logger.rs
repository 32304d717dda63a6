//! 性能日志记录模块
//!
//! 记录一次图像描述请求各阶段的耗时，生成结束时以一条 JSON 输出

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// 性能日志条目
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceLog {
    /// 时间戳（ISO 8601）
    pub ts: String,
    /// 图像预处理耗时（毫秒）
    pub preprocess_ms: u64,
    /// 视觉编码耗时（毫秒）
    pub vision_ms: u64,
    /// 文本嵌入 + 投影 + 拼接耗时（毫秒）
    pub embed_ms: u64,
    /// prefill 耗时（毫秒）
    pub prefill_ms: u64,
    /// 逐 token 解码耗时（毫秒）
    pub decode_ms: u64,
    /// 总耗时（毫秒）
    pub total_ms: u64,
    /// 提示词 token 数（含 `<image>`）
    pub prompt_tokens: usize,
    /// 拼接后送入 decoder 的序列长度
    pub fused_len: usize,
    /// 生成的 token 数（不含 EOS）
    pub generated_tokens: usize,
    /// 停止原因
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// 是否成功
    pub ok: bool,
    /// 输出是否可疑（空文本或 UTF-8 解码降级）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspect_output: Option<bool>,
}

impl PerformanceLog {
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            ts: format_iso8601(secs),
            ..Default::default()
        }
    }

    /// 每秒生成的 token 数（只计解码阶段）
    pub fn tokens_per_second(&self) -> f64 {
        if self.decode_ms == 0 {
            return 0.0;
        }
        self.generated_tokens as f64 * 1000.0 / self.decode_ms as f64
    }

    /// 检查输出是否可疑
    pub fn check_output(&mut self, text: &str, degraded: bool) {
        self.suspect_output = Some(degraded || text.trim().is_empty());
    }

    /// 格式化为 JSON 字符串
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 按阶段计时：`lap` 返回自上次 lap 以来的毫秒数
#[derive(Debug)]
pub struct PhaseTimer {
    start: Instant,
    last: Instant,
}

impl PhaseTimer {
    pub fn start() -> Self {
        let now = Instant::now();
        Self { start: now, last: now }
    }

    pub fn lap(&mut self) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        millis(elapsed)
    }

    pub fn total(&self) -> u64 {
        millis(self.start.elapsed())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Unix 秒数 → `YYYY-MM-DDTHH:MM:SSZ`（UTC）
fn format_iso8601(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;

    // 由天数求公历日期（以 0000-03-01 为纪元的换算）
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3_600,
        (rem % 3_600) / 60,
        rem % 60
    )
}

/// 性能日志记录器
#[derive(Debug, Clone)]
pub struct PerformanceLogger {
    enabled: bool,
    warn_suspect: bool,
}

impl PerformanceLogger {
    pub fn new(enabled: bool, warn_suspect: bool) -> Self {
        Self { enabled, warn_suspect }
    }

    /// 记录性能日志
    pub fn log(&self, log: &PerformanceLog) {
        if !self.enabled {
            return;
        }

        info!(target: "perf", "{}", log.to_json());

        if self.warn_suspect && log.suspect_output == Some(true) {
            warn!(
                generated_tokens = log.generated_tokens,
                stop_reason = log.stop_reason.as_deref().unwrap_or("unknown"),
                "suspect output: empty or degraded text"
            );
        }
    }
}

impl Default for PerformanceLogger {
    fn default() -> Self {
        Self {
            enabled: true,
            warn_suspect: true,
        }
    }
}
