//! 已读状态协调
//!
//! 先改本地（未读数立即变化），再把变更推给服务端。
//! 服务端失败不回滚本地，只发出 [`SDKEvent::ReadSyncFailed`]，
//! 下一次同步会按合并规则把状态对齐（本地已读不会被回退）。

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::ChannelClient;
use crate::error::Result;
use crate::events::{EventManager, SDKEvent};
use crate::storage::entities::ConversationRef;
use crate::storage::reconcile::ReadChange;
use crate::storage::StorageManager;
use crate::transport::frame::{events, user_topic};
use crate::utils::now_millis;

pub struct ReadStateReconciler {
    self_id: String,
    storage: Arc<StorageManager>,
    channel: ChannelClient,
    events: Arc<EventManager>,
}

impl ReadStateReconciler {
    pub fn new(self_id: String, storage: Arc<StorageManager>, channel: ChannelClient, events: Arc<EventManager>) -> Self {
        Self {
            self_id,
            storage,
            channel,
            events,
        }
    }

    /// 标记若干条消息已读（服务端 ID 或 client_id 均可）
    pub async fn mark_read(&self, ids: Vec<String>) -> Result<ReadChange> {
        if ids.is_empty() {
            return Ok(ReadChange::default());
        }
        let change = self.storage.mark_read(ids).await?;
        self.announce(&change).await;
        if !change.message_ids.is_empty() {
            let targets = change.message_ids.clone();
            self.push_remote(events::MESSAGE_READ, json!({ "ids": targets }), targets)
                .await;
        }
        Ok(change)
    }

    /// 整个会话标记已读
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<ReadChange> {
        let change = self.storage.mark_conversation_read(conversation_id).await?;
        self.announce(&change).await;
        if change.marked > 0 {
            self.push_remote(
                events::CONVERSATION_READ,
                json!({ "conversation_id": conversation_id }),
                vec![conversation_id.to_string()],
            )
            .await;
        }
        Ok(change)
    }

    pub async fn mark_all_read(&self) -> Result<ReadChange> {
        let change = self.storage.mark_all_read().await?;
        self.announce(&change).await;
        if change.marked > 0 {
            self.push_remote(events::READ_ALL, json!({}), Vec::new()).await;
        }
        Ok(change)
    }

    pub async fn total_unread(&self) -> Result<u32> {
        self.storage.total_unread().await
    }

    async fn announce(&self, change: &ReadChange) {
        debug!("[ReadState] 本地标记已读: {} 条", change.marked);
        for conversation in &change.conversations {
            self.events
                .emit(SDKEvent::unread_count_changed(
                    conversation.id.clone(),
                    conversation.unread_count,
                ))
                .await;
        }
    }

    async fn push_remote(&self, event: &str, payload: serde_json::Value, targets: Vec<String>) {
        let topic = user_topic(&self.self_id);
        match self.channel.push(&topic, event, payload).await {
            Ok(_) => info!("[ReadState] ✅ 已读同步成功: {}", event),
            Err(e) => {
                warn!("[ReadState] ⚠️ 已读同步失败，本地状态保留: {} - {}", event, e);
                self.events
                    .emit(SDKEvent::ReadSyncFailed {
                        event: event.to_string(),
                        targets,
                        error: e.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
            }
        }
    }
}

/// 重新读取会话未读数并逐个发出 [`SDKEvent::UnreadCountChanged`]
pub(crate) async fn publish_unread(storage: &StorageManager, events: &EventManager, conversation_ids: Vec<String>) {
    for conversation_id in conversation_ids {
        match storage
            .get_conversation(ConversationRef::Id(conversation_id.clone()))
            .await
        {
            Ok(Some(conversation)) => {
                events
                    .emit(SDKEvent::unread_count_changed(
                        conversation.id,
                        conversation.unread_count,
                    ))
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!("[ReadState] 读取会话未读数失败: {} - {}", conversation_id, e),
        }
    }
}
