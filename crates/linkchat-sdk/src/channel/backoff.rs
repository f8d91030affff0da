//! 重连退避策略
//!
//! 第 n 次（从 1 开始）重连前等待 `initial * multiplier^(n-1)`，封顶 `max_interval`，
//! 再叠加 ±`jitter_factor` 的随机抖动，避免大量客户端同时重连。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    /// 连续失败多少次后进入 ConnectionError
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// 不含抖动的基准间隔
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let interval = self.initial_interval_ms as f64 * self.backoff_multiplier.powf(exponent);
        Duration::from_millis(interval.min(self.max_interval_ms as f64) as u64)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(base as u64);
        }
        let spread = base * self.jitter_factor;
        let jittered = base + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=8)
            .map(|n| policy.base_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
        assert!(!policy.is_exhausted(7));
        assert!(policy.is_exhausted(8));
    }

    #[test]
    fn test_jitter_band() {
        let policy = ReconnectPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(3).as_millis() as u64;
            assert!((1_600..=2_400).contains(&delay), "delay={}", delay);
        }
    }
}
