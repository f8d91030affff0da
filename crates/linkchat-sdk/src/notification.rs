//! 通知分发
//!
//! SDK 不负责展示通知，只把实时收到的完整消息交给宿主应用实现的分发器。
//! 同步补拉的历史消息不会触发通知。

use async_trait::async_trait;
use tracing::debug;

use crate::storage::entities::Message;

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// 一条实时收到的、来自他人的消息已经入库
    async fn dispatch(&self, message: &Message);
}

/// 默认实现：只记日志
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for NoopNotificationDispatcher {
    async fn dispatch(&self, message: &Message) {
        debug!(
            "[Notification] 收到新消息（未配置通知分发器）: conversation={}, preview={}",
            message.conversation_id,
            message.content.preview()
        );
    }
}
