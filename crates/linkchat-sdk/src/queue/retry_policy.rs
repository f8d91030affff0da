use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LinkchatSDKError;

/// 发送失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SendFailureReason {
    /// 回复超时 - 可重试
    Timeout,
    /// 网络不可用 / 连接断开 - 可重试
    NetworkUnavailable,
    /// 认证失败 - 需要重新登录，不自动重试
    AuthFailure,
    /// 服务端拒绝 - 不重试
    Rejected(String),
    /// 本地存储失败 - 不重试
    Storage(String),
    Unknown(String),
}

impl SendFailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendFailureReason::Timeout | SendFailureReason::NetworkUnavailable)
    }

    /// 重试延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            SendFailureReason::NetworkUnavailable => 2.0,
            _ => 1.0,
        }
    }
}

impl From<&LinkchatSDKError> for SendFailureReason {
    fn from(error: &LinkchatSDKError) -> Self {
        match error {
            LinkchatSDKError::Timeout(_) => SendFailureReason::Timeout,
            LinkchatSDKError::Network(_) | LinkchatSDKError::NotConnected => {
                SendFailureReason::NetworkUnavailable
            }
            LinkchatSDKError::Auth(_) => SendFailureReason::AuthFailure,
            LinkchatSDKError::Rejected(msg) => SendFailureReason::Rejected(msg.clone()),
            LinkchatSDKError::SqliteError(msg) | LinkchatSDKError::Database(msg) => {
                SendFailureReason::Storage(msg.clone())
            }
            other => SendFailureReason::Unknown(other.to_string()),
        }
    }
}

/// 消息发送重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大自动重试次数
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, retry_count: u32, reason: &SendFailureReason) -> bool {
        retry_count < self.max_retries && reason.is_retryable()
    }

    /// 第 `retry_count` 次失败之后的等待时间；不应重试时返回 None
    pub fn next_delay(&self, retry_count: u32, reason: &SendFailureReason) -> Option<Duration> {
        if !self.should_retry(retry_count, reason) {
            return None;
        }

        // base_delay * (backoff_factor ^ retry_count) * 原因倍数，封顶后加抖动
        let base = self.base_delay_ms as f64 * self.backoff_factor.powf(retry_count as f64);
        let capped = (base * reason.delay_multiplier()).min(self.max_delay_ms as f64);
        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * rand::thread_rng().gen_range(-0.5..0.5)
        } else {
            0.0
        };
        Some(Duration::from_millis((capped + jitter).max(0.0) as u64))
    }
}
