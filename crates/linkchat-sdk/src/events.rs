//! SDK 事件系统
//!
//! 事件通过 broadcast 分发给所有订阅者，同时支持按类型注册回调监听器。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::connection_state::ConnectionStatus;
use crate::storage::entities::Message;
use crate::utils::now_millis;

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 连接状态变更（进入 ConnectionError 时携带原因）
    ConnectionStateChanged {
        old_state: ConnectionStatus,
        new_state: ConnectionStatus,
        error: Option<String>,
        timestamp: i64,
    },
    /// 断线重连成功，所有 topic 已按原顺序重新加入
    Reconnected {
        attempts: u32,
        topics: Vec<String>,
        timestamp: i64,
    },
    /// 实时收到一条新消息（同步拉取的历史消息不触发）
    MessageReceived { message: Message, timestamp: i64 },
    MessageSent {
        client_id: String,
        message_id: String,
        conversation_id: String,
        timestamp: i64,
    },
    MessageSendFailed {
        client_id: String,
        conversation_id: String,
        error: String,
        attempts: u32,
        /// 是否会自动重试
        will_retry: bool,
        timestamp: i64,
    },
    MessageWithdrawn {
        message_id: String,
        conversation_id: String,
        timestamp: i64,
    },
    UnreadCountChanged {
        conversation_id: String,
        unread_count: u32,
        timestamp: i64,
    },
    SyncCompleted {
        cursor: Option<i64>,
        applied: usize,
        pages: u32,
        timestamp: i64,
    },
    SyncFailed { error: String, timestamp: i64 },
    /// 已读状态同步到服务端失败（本地状态不回滚）
    ReadSyncFailed {
        event: String,
        targets: Vec<String>,
        error: String,
        timestamp: i64,
    },
    SessionClosed { user_id: String, timestamp: i64 },
}

impl SDKEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            SDKEvent::Reconnected { .. } => "reconnected",
            SDKEvent::MessageReceived { .. } => "message_received",
            SDKEvent::MessageSent { .. } => "message_sent",
            SDKEvent::MessageSendFailed { .. } => "message_send_failed",
            SDKEvent::MessageWithdrawn { .. } => "message_withdrawn",
            SDKEvent::UnreadCountChanged { .. } => "unread_count_changed",
            SDKEvent::SyncCompleted { .. } => "sync_completed",
            SDKEvent::SyncFailed { .. } => "sync_failed",
            SDKEvent::ReadSyncFailed { .. } => "read_sync_failed",
            SDKEvent::SessionClosed { .. } => "session_closed",
        }
    }

    /// 事件关联的会话 ID
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            SDKEvent::MessageReceived { message, .. } => Some(&message.conversation_id),
            SDKEvent::MessageSent { conversation_id, .. }
            | SDKEvent::MessageSendFailed { conversation_id, .. }
            | SDKEvent::MessageWithdrawn { conversation_id, .. }
            | SDKEvent::UnreadCountChanged { conversation_id, .. } => Some(conversation_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SDKEvent::ConnectionStateChanged { timestamp, .. }
            | SDKEvent::Reconnected { timestamp, .. }
            | SDKEvent::MessageReceived { timestamp, .. }
            | SDKEvent::MessageSent { timestamp, .. }
            | SDKEvent::MessageSendFailed { timestamp, .. }
            | SDKEvent::MessageWithdrawn { timestamp, .. }
            | SDKEvent::UnreadCountChanged { timestamp, .. }
            | SDKEvent::SyncCompleted { timestamp, .. }
            | SDKEvent::SyncFailed { timestamp, .. }
            | SDKEvent::ReadSyncFailed { timestamp, .. }
            | SDKEvent::SessionClosed { timestamp, .. } => *timestamp,
        }
    }

    pub fn connection_state_changed(
        old_state: ConnectionStatus,
        new_state: ConnectionStatus,
        error: Option<String>,
    ) -> Self {
        SDKEvent::ConnectionStateChanged {
            old_state,
            new_state,
            error,
            timestamp: now_millis(),
        }
    }

    pub fn unread_count_changed(conversation_id: String, unread_count: u32) -> Self {
        SDKEvent::UnreadCountChanged {
            conversation_id,
            unread_count,
            timestamp: now_millis(),
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub conversation_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_conversation_ids(mut self, conversation_ids: Vec<String>) -> Self {
        self.conversation_ids = Some(conversation_ids);
        self
    }

    pub fn matches(&self, event: &SDKEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(ids) = &self.conversation_ids {
            // 过滤器要求会话 ID，但事件没有
            match event.conversation_id() {
                Some(id) if ids.iter().any(|c| c == id) => {}
                _ => return false,
            }
        }
        true
    }
}

pub type EventListener = Box<dyn Fn(&SDKEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
    /// 事件类型 -> 监听器，`*` 匹配所有事件
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    pub async fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if self.sender.send(event.clone()).is_err() {
            debug!("No active receivers for event: {}", event.event_type());
        }

        let listeners = self.listeners.read().await;
        for key in [event.event_type(), "*"] {
            if let Some(event_listeners) = listeners.get(key) {
                for listener in event_listeners {
                    listener(&event);
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();
        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_reaches_subscribers_and_listeners() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        manager
            .add_listener("sync_failed", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        manager
            .emit(SDKEvent::SyncFailed {
                error: "timeout".into(),
                timestamp: 1,
            })
            .await;
        manager
            .emit(SDKEvent::unread_count_changed("c1".into(), 3))
            .await;

        assert_eq!(rx.recv().await.unwrap().event_type(), "sync_failed");
        assert_eq!(rx.recv().await.unwrap().event_type(), "unread_count_changed");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.listener_count, 1);
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe_filtered(
            EventFilter::new().with_conversation_ids(vec!["c2".into()]),
        );

        manager.emit(SDKEvent::unread_count_changed("c1".into(), 1)).await;
        manager
            .emit(SDKEvent::SessionClosed {
                user_id: "alice".into(),
                timestamp: 1,
            })
            .await;
        manager.emit(SDKEvent::unread_count_changed("c2".into(), 2)).await;

        match rx.recv().await.unwrap() {
            SDKEvent::UnreadCountChanged {
                conversation_id,
                unread_count,
                ..
            } => {
                assert_eq!(conversation_id, "c2");
                assert_eq!(unread_count, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
