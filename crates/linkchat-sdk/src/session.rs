//! 用户会话
//!
//! 一个已登录用户对应一个 [`Session`]：通道客户端、本地存储、发送队列、同步引擎、
//! 已读协调器都挂在它下面，并共享同一个 [`CancellationToken`]。
//! 关闭会话会取消重连循环、重试、进行中的同步和所有观察者，然后断开连接、关闭存储。

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelBroadcast, ChannelClient, ChannelConfig};
use crate::config::LinkchatConfig;
use crate::connection_state::ConnectionStatus;
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::Result;
use crate::events::{EventManager, SDKEvent};
use crate::lifecycle::LifecycleHook;
use crate::notification::NotificationDispatcher;
use crate::queue::SendPipeline;
use crate::read_state::{publish_unread, ReadStateReconciler};
use crate::storage::entities::{ReconcileOutcome, RemoteMessage};
use crate::storage::StorageManager;
use crate::sync::SyncEngine;
use crate::transport::frame::{events, user_topic};
use crate::transport::Transport;
use crate::utils::now_millis;

#[derive(Debug, Deserialize)]
struct NewMessagePayload {
    message: RemoteMessage,
}

#[derive(Debug, Deserialize)]
struct WithdrawnPayload {
    id: String,
    updated_at: i64,
}

#[derive(Debug, Deserialize)]
struct ReadPayload {
    #[serde(default)]
    ids: Vec<String>,
}

pub struct Session {
    user_id: String,
    storage: Arc<StorageManager>,
    channel: ChannelClient,
    pipeline: SendPipeline,
    sync: Arc<SyncEngine>,
    read_state: ReadStateReconciler,
    events: Arc<EventManager>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Session {
    /// 为 `credentials` 对应的用户打开会话（不连接网络）
    pub async fn open(
        config: &LinkchatConfig,
        credentials: &Credentials,
        provider: Arc<dyn CredentialProvider>,
        transport: Arc<dyn Transport>,
        events: Arc<EventManager>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self> {
        credentials.validate()?;
        let user_id = credentials.user_id.clone();
        info!("[Session] 🔐 打开会话: user={}", user_id);

        let storage = Arc::new(StorageManager::open(&config.data_dir, &user_id).await?);

        let cancel = CancellationToken::new();
        let channel = ChannelClient::new(
            ChannelConfig::from(config),
            transport,
            provider,
            events.clone(),
            cancel.clone(),
        );
        let pipeline = SendPipeline::spawn(
            user_id.clone(),
            storage.clone(),
            channel.clone(),
            events.clone(),
            config.retry.clone(),
            cancel.clone(),
        );
        let sync = Arc::new(SyncEngine::new(
            user_id.clone(),
            storage.clone(),
            channel.clone(),
            events.clone(),
            config.sync_page_size,
        ));
        let read_state = ReadStateReconciler::new(
            user_id.clone(),
            storage.clone(),
            channel.clone(),
            events.clone(),
        );

        let session = Self {
            user_id,
            storage,
            channel,
            pipeline,
            sync,
            read_state,
            events,
            cancel,
        };
        session.spawn_router(notifier);
        Ok(session)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn channel(&self) -> &ChannelClient {
        &self.channel
    }

    pub fn pipeline(&self) -> &SendPipeline {
        &self.pipeline
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn read_state(&self) -> &ReadStateReconciler {
        &self.read_state
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 建立连接并加入用户 topic，成功后在后台补一次同步
    pub async fn connect(&self) -> Result<()> {
        self.channel.connect().await?;
        self.channel.join(&user_topic(&self.user_id)).await?;
        spawn_sync(self.sync.clone(), self.cancel.clone(), "connect");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    /// 关闭会话，之后所有后台任务都会退出
    pub async fn close(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        info!("[Session] 🔒 关闭会话: user={}", self.user_id);
        self.cancel.cancel();
        self.channel.disconnect().await;
        let result = self.storage.close().await;
        self.events
            .emit(SDKEvent::SessionClosed {
                user_id: self.user_id.clone(),
                timestamp: now_millis(),
            })
            .await;
        result
    }

    /// 生命周期 Hook：回到前台时恢复连接并同步
    pub fn lifecycle_hook(&self) -> Arc<dyn LifecycleHook> {
        Arc::new(SessionLifecycleHook {
            channel: self.channel.clone(),
            sync: self.sync.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// 把服务端广播路由到存储，并在重连后触发同步
    fn spawn_router(&self, notifier: Arc<dyn NotificationDispatcher>) {
        let router = Router {
            self_id: self.user_id.clone(),
            storage: self.storage.clone(),
            events: self.events.clone(),
            sync: self.sync.clone(),
            notifier,
            cancel: self.cancel.clone(),
        };
        let mut broadcasts = self.channel.subscribe_broadcasts();
        let mut sdk_events = self.events.subscribe();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = broadcasts.recv() => match received {
                        Ok(broadcast) => router.handle_broadcast(broadcast).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("[Session] ⚠️ 广播积压，丢弃 {} 条，改为同步补齐", skipped);
                            spawn_sync(router.sync.clone(), router.cancel.clone(), "lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = sdk_events.recv() => match event {
                        Ok(SDKEvent::Reconnected { attempts, .. }) => {
                            info!("[Session] 🔄 重连成功（{} 次尝试），开始补齐同步", attempts);
                            spawn_sync(router.sync.clone(), router.cancel.clone(), "reconnected");
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("[Session] 广播路由已退出");
        });
    }
}

fn spawn_sync(sync: Arc<SyncEngine>, cancel: CancellationToken, reason: &'static str) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => debug!("[Session] 会话已关闭，放弃同步: {}", reason),
            result = sync.sync() => {
                if let Err(e) = result {
                    debug!("[Session] 后台同步失败 ({}): {}", reason, e);
                }
            }
        }
    });
}

struct Router {
    self_id: String,
    storage: Arc<StorageManager>,
    events: Arc<EventManager>,
    sync: Arc<SyncEngine>,
    notifier: Arc<dyn NotificationDispatcher>,
    cancel: CancellationToken,
}

impl Router {
    async fn handle_broadcast(&self, broadcast: ChannelBroadcast) {
        let result = match broadcast.event.as_str() {
            events::MESSAGE_NEW => self.on_new_message(broadcast.payload).await,
            events::MESSAGE_WITHDRAWN => self.on_withdrawn(broadcast.payload).await,
            events::MESSAGE_READ => self.on_read(broadcast.payload).await,
            other => {
                debug!("[Session] 忽略广播: topic={}, event={}", broadcast.topic, other);
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("[Session] ❌ 处理广播失败: event={}, error={}", broadcast.event, e);
        }
    }

    async fn on_new_message(&self, payload: serde_json::Value) -> Result<()> {
        let NewMessagePayload { message } = serde_json::from_value(payload)?;
        let results = self.storage.apply_remote_batch(vec![message], now_millis()).await?;
        for (outcome, stored) in results {
            if outcome == ReconcileOutcome::Unchanged {
                continue;
            }
            let conversation_id = stored.conversation_id.clone();
            if outcome == ReconcileOutcome::Inserted && stored.sender_id != self.self_id {
                info!(
                    "[Session] 📨 收到新消息: conversation={}, id={}",
                    conversation_id,
                    stored.reference_id()
                );
                self.notifier.dispatch(&stored).await;
                self.events
                    .emit(SDKEvent::MessageReceived {
                        message: stored,
                        timestamp: now_millis(),
                    })
                    .await;
            }
            publish_unread(&self.storage, &self.events, vec![conversation_id]).await;
        }
        Ok(())
    }

    async fn on_withdrawn(&self, payload: serde_json::Value) -> Result<()> {
        let WithdrawnPayload { id, updated_at } = serde_json::from_value(payload)?;
        if let Some(message) = self.storage.withdraw(&id, updated_at).await? {
            info!("[Session] ↩️ 消息已被撤回: id={}", id);
            let conversation_id = message.conversation_id.clone();
            self.events
                .emit(SDKEvent::MessageWithdrawn {
                    message_id: id,
                    conversation_id: conversation_id.clone(),
                    timestamp: now_millis(),
                })
                .await;
            publish_unread(&self.storage, &self.events, vec![conversation_id]).await;
        }
        Ok(())
    }

    /// 其他设备上的已读
    async fn on_read(&self, payload: serde_json::Value) -> Result<()> {
        let ReadPayload { ids } = serde_json::from_value(payload)?;
        if ids.is_empty() {
            return Ok(());
        }
        let change = self.storage.mark_read(ids).await?;
        let touched = change.conversations.into_iter().map(|c| c.id).collect();
        publish_unread(&self.storage, &self.events, touched).await;
        Ok(())
    }
}

struct SessionLifecycleHook {
    channel: ChannelClient,
    sync: Arc<SyncEngine>,
    cancel: CancellationToken,
}

#[async_trait]
impl LifecycleHook for SessionLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        debug!("[Session] App 进入后台，保持连接由心跳维持");
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if self.channel.status() == ConnectionStatus::ConnectionError {
            info!("[Session] 回到前台，尝试恢复连接");
            self.channel.reconnect().await?;
        }
        if self.channel.status() == ConnectionStatus::Joined {
            self.sync.sync().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::notification::NoopNotificationDispatcher;
    use crate::storage::entities::{conversation_id, MessageStatus};
    use crate::testing::{eventually, test_config, FakeServer};

    struct Fixture {
        _dir: tempfile::TempDir,
        server: FakeServer,
        events: Arc<EventManager>,
        session: Session,
    }

    async fn fixture(user_id: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::start();
        let events = Arc::new(EventManager::new(256));
        let credentials = Credentials::new(user_id, "token");
        let session = Session::open(
            &test_config(dir.path()),
            &credentials,
            Arc::new(StaticCredentials::new(credentials.clone())),
            Arc::new(server.transport()),
            events.clone(),
            Arc::new(NoopNotificationDispatcher),
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            server,
            events,
            session,
        }
    }

    #[tokio::test]
    async fn test_connect_syncs_offline_messages() {
        let f = fixture("alice").await;
        f.server.seed("bob", "alice", "while you were away");
        f.session.connect().await.unwrap();

        let storage = f.session.storage();
        eventually("offline message synced", || async move {
            storage.total_unread().await.unwrap() == 1
        })
        .await;
    }

    #[tokio::test]
    async fn test_session_does_not_persist_token() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::start();
        let credentials = Credentials::new("alice", "secret-bearer-123");
        let session = Session::open(
            &test_config(dir.path()),
            &credentials,
            Arc::new(StaticCredentials::new(credentials.clone())),
            Arc::new(server.transport()),
            Arc::new(EventManager::new(64)),
            Arc::new(NoopNotificationDispatcher),
        )
        .await
        .unwrap();
        server.seed("bob", "alice", "hi");
        session.connect().await.unwrap();
        session.sync_engine().sync().await.unwrap();

        let values = session.storage().kv().raw_values();
        assert!(!values.is_empty());
        assert!(values.iter().all(|v| !v.contains("secret-bearer-123")));
        session.close().await.unwrap();
    }

    /// 连接并等待连接时触发的后台同步完成
    async fn connect_settled(f: &Fixture) {
        let mut rx = f.events.subscribe();
        f.session.connect().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !matches!(rx.recv().await, Ok(SDKEvent::SyncCompleted { .. })) {}
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_live_message_and_withdraw_are_applied() {
        let f = fixture("alice").await;
        connect_settled(&f).await;
        let mut rx = f.events.subscribe();

        let remote = f.server.deliver("bob", "alice", "hello");
        let storage = f.session.storage();
        let id = remote.id.clone();
        eventually("live message stored", || {
            let id = id.clone();
            async move { storage.get_message(&id).await.unwrap().is_some() }
        })
        .await;

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Ok(SDKEvent::MessageReceived { message, .. }) = rx.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received.content.preview(), "hello");

        f.server.withdraw(&remote.id);
        eventually("withdraw applied", || {
            let id = id.clone();
            async move {
                storage.get_message(&id).await.unwrap().map(|m| m.status) == Some(MessageStatus::Withdrawn)
            }
        })
        .await;
        assert_eq!(storage.total_unread().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_on_other_device_updates_unread() {
        let f = fixture("alice").await;
        f.session.connect().await.unwrap();
        let remote = f.server.deliver("bob", "alice", "ping");
        let storage = f.session.storage();
        eventually("message stored", || async move {
            storage.total_unread().await.unwrap() == 1
        })
        .await;

        f.server.broadcast(
            &user_topic("alice"),
            events::MESSAGE_READ,
            serde_json::json!({ "ids": [remote.id] }),
        );
        eventually("read applied", || async move {
            storage.total_unread().await.unwrap() == 0
        })
        .await;
        let conversation = storage
            .get_conversation(crate::storage::entities::ConversationRef::Id(conversation_id("alice", "bob")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.unread_count, 0);
    }

    #[tokio::test]
    async fn test_reconnect_triggers_sync() {
        let f = fixture("alice").await;
        f.session.connect().await.unwrap();
        let storage = f.session.storage();

        f.server.drop_connections();
        f.server.seed("bob", "alice", "sent during the outage");
        eventually("synced after reconnect", || async move {
            storage.total_unread().await.unwrap() == 1
        })
        .await;
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let f = fixture("alice").await;
        f.session.connect().await.unwrap();
        let mut rx = f.events.subscribe();

        f.session.close().await.unwrap();
        assert!(f.session.is_closed());
        assert_eq!(f.session.channel().status(), ConnectionStatus::Disconnected);

        let mut closed = false;
        while let Ok(event) = rx.try_recv() {
            if let SDKEvent::SessionClosed { user_id, .. } = event {
                assert_eq!(user_id, "alice");
                closed = true;
            }
        }
        assert!(closed);
        // 重复关闭无副作用
        f.session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreground_hook_syncs() {
        let f = fixture("alice").await;
        f.session.connect().await.unwrap();
        let storage = f.session.storage();

        // 同步互斥执行，连接时触发的后台同步不会与之交错
        f.server.seed("bob", "alice", "missed push");
        f.session.lifecycle_hook().on_foreground().await.unwrap();
        assert_eq!(storage.total_unread().await.unwrap(), 1);
    }
}
