//! 线路帧定义与 JSON 编解码
//!
//! 所有帧都是带 `type` 标签的 JSON 文本：
//!
//! ```json
//! {"type":"push","topic":"user:42","event":"message:send","payload":{...},"ref":7}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LinkchatSDKError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Join {
        topic: String,
        #[serde(rename = "ref")]
        reference: u64,
    },
    Leave {
        topic: String,
        #[serde(rename = "ref")]
        reference: u64,
    },
    Push {
        topic: String,
        event: String,
        #[serde(default)]
        payload: Value,
        #[serde(rename = "ref")]
        reference: u64,
    },
    Heartbeat {
        #[serde(rename = "ref")]
        reference: u64,
    },
    Reply {
        #[serde(rename = "ref")]
        reference: u64,
        status: ReplyStatus,
        #[serde(default)]
        payload: Value,
    },
    Broadcast {
        topic: String,
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("帧编码失败: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("无法解析的帧: {0}")]
    Decode(#[source] serde_json::Error),
}

impl From<FrameError> for LinkchatSDKError {
    fn from(error: FrameError) -> Self {
        LinkchatSDKError::Protocol(error.to_string())
    }
}

impl Frame {
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }

    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        serde_json::from_str(text).map_err(FrameError::Decode)
    }

    /// 需要关联回复的帧的 ref
    pub fn reference(&self) -> Option<u64> {
        match self {
            Frame::Join { reference, .. }
            | Frame::Leave { reference, .. }
            | Frame::Push { reference, .. }
            | Frame::Heartbeat { reference }
            | Frame::Reply { reference, .. } => Some(*reference),
            Frame::Broadcast { .. } => None,
        }
    }
}

/// 用户主 topic
pub fn user_topic(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// 事件名
pub mod events {
    pub const MESSAGE_SEND: &str = "message:send";
    pub const MESSAGE_READ: &str = "message:read";
    pub const CONVERSATION_READ: &str = "conversation:read";
    pub const READ_ALL: &str = "read:all";
    pub const MESSAGE_WITHDRAW: &str = "message:withdraw";
    pub const SYNC: &str = "sync";
    pub const MESSAGE_NEW: &str = "message:new";
    pub const MESSAGE_WITHDRAWN: &str = "message:withdrawn";
}
