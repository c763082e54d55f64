//! Retry timing for a session.
//!
//! Transient failures back off exponentially up to a cap. After a bounded
//! number of consecutive transient failures the policy reports exhaustion so
//! the session re-resolves the feed instead of retrying a cursor that may be
//! expired. "No active feed" uses a separate, coarse interval.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// 初期待機時間（ミリ秒）
    pub initial_delay_ms: u64,
    /// 指数バックオフの倍率
    pub multiplier: f64,
    /// 最大待機時間（ミリ秒）
    pub max_delay_ms: u64,
    /// 配信が見つからない場合の待機時間（ミリ秒）
    pub not_found_delay_ms: u64,
    /// 再解決に切り替えるまでの連続エラー数
    pub max_consecutive_failures: u32,
    /// 配信が見つからない場合の最大試行回数（0 = 無制限）
    pub max_not_found_attempts: u32,
    /// ジッター（0.0〜1.0）
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            not_found_delay_ms: 30_000,
            max_consecutive_failures: 5,
            max_not_found_attempts: 40,
            jitter: 0.0,
        }
    }
}

/// What the session should do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Wait, then retry the same operation
    Retry(Duration),
    /// Too many failures in a row: wait, then re-resolve from scratch
    Exhausted(Duration),
}

impl BackoffDecision {
    pub fn delay(&self) -> Duration {
        match self {
            BackoffDecision::Retry(delay) | BackoffDecision::Exhausted(delay) => *delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    consecutive_failures: u32,
    not_found_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            not_found_attempts: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped and without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = delay_ms.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn on_transient_failure(&mut self) -> BackoffDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.with_jitter(self.base_delay(self.consecutive_failures));

        if self.config.max_consecutive_failures > 0
            && self.consecutive_failures >= self.config.max_consecutive_failures
        {
            // 次の再解決で新しいサイクルを開始する
            self.consecutive_failures = 0;
            BackoffDecision::Exhausted(delay)
        } else {
            BackoffDecision::Retry(delay)
        }
    }

    /// Record a "no active feed" answer.
    ///
    /// Returns `None` once the attempt limit is exceeded.
    pub fn on_not_found(&mut self) -> Option<Duration> {
        self.not_found_attempts = self.not_found_attempts.saturating_add(1);
        if self.config.max_not_found_attempts > 0
            && self.not_found_attempts > self.config.max_not_found_attempts
        {
            return None;
        }
        Some(self.with_jitter(Duration::from_millis(self.config.not_found_delay_ms)))
    }

    /// Forget all failures after a successful call.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.not_found_attempts = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn not_found_attempts(&self) -> u32 {
        self.not_found_attempts
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(factor.max(0.0))
    }
}
