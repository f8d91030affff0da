//! 传输层抽象
//!
//! [`Transport`] 负责建立一条双向帧通道（握手时完成认证），
//! 连接的生命周期、心跳、重连都由上层 [`crate::channel::ChannelClient`] 管理。

pub mod frame;
pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
pub use frame::{Frame, ReplyStatus};

/// 建立连接所需的参数
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub url: String,
    pub token: String,
    pub user_id: String,
    pub timeout: Duration,
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// None 表示对端关闭了连接
    async fn next(&mut self) -> Option<Result<Frame>>;
}

/// 一条已建立的连接
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// 打开连接；握手被拒（401/403）返回 `Auth`，不可达或超时返回 `Network`
    async fn open(&self, request: &OpenRequest) -> Result<Link>;
}
