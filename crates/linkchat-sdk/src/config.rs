//! SDK 配置

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::backoff::ReconnectPolicy;
use crate::error::{LinkchatSDKError, Result};
use crate::queue::retry_policy::RetryPolicy;

/// Linkchat SDK 配置（时间单位均为毫秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkchatConfig {
    /// 数据存储目录，每个用户在其下有独立子目录
    pub data_dir: PathBuf,
    /// 服务端地址，例如 `wss://chat.example.com/socket`
    pub server_url: String,
    pub connect_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub push_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// 连续多少次心跳无回复视为断线
    pub heartbeat_miss_threshold: u32,
    pub reconnect: ReconnectPolicy,
    pub retry: RetryPolicy,
    /// 同步每页条数
    pub sync_page_size: u32,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    pub debug_mode: bool,
}

impl Default for LinkchatConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./linkchat_data"),
            server_url: String::new(),
            connect_timeout_ms: 10_000,
            join_timeout_ms: 10_000,
            push_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_miss_threshold: 2,
            reconnect: ReconnectPolicy::default(),
            retry: RetryPolicy::default(),
            sync_page_size: 100,
            event_buffer_size: 1_024,
            debug_mode: false,
        }
    }
}

impl LinkchatConfig {
    pub fn builder() -> LinkchatConfigBuilder {
        LinkchatConfigBuilder::new()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.server_url.trim();
        if url.is_empty() {
            return Err(LinkchatSDKError::Config("server_url 不能为空".to_string()));
        }
        if !["ws://", "wss://", "memory://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
        {
            return Err(LinkchatSDKError::Config(format!(
                "不支持的服务端地址: {}",
                url
            )));
        }
        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("join_timeout_ms", self.join_timeout_ms),
            ("push_timeout_ms", self.push_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(LinkchatSDKError::Config(format!("{} 必须大于 0", name)));
        }
        if self.heartbeat_miss_threshold == 0 {
            return Err(LinkchatSDKError::Config(
                "heartbeat_miss_threshold 必须大于 0".to_string(),
            ));
        }
        if self.sync_page_size == 0 {
            return Err(LinkchatSDKError::Config("sync_page_size 必须大于 0".to_string()));
        }
        if self.reconnect.backoff_multiplier < 1.0 || self.retry.backoff_factor < 1.0 {
            return Err(LinkchatSDKError::Config("退避倍数不能小于 1".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct LinkchatConfigBuilder {
    config: LinkchatConfig,
}

impl LinkchatConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn server_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn push_timeout(mut self, timeout: Duration) -> Self {
        self.config.push_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat(mut self, interval: Duration, miss_threshold: u32) -> Self {
        self.config.heartbeat_interval_ms = interval.as_millis() as u64;
        self.config.heartbeat_miss_threshold = miss_threshold;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn sync_page_size(mut self, size: u32) -> Self {
        self.config.sync_page_size = size;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> Result<LinkchatConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
