//! 对外门面
//!
//! [`ChatRepository`] 是 UI 层唯一接触的入口：登录即打开该用户的 [`Session`]，
//! 切换用户或登出会完整关闭旧会话后再打开新的。
//!
//! 读操作以 [`Observation`] 的形式提供：订阅时先推送一次当前结果，
//! 之后每次相关写入提交都会重新查询并推送。

use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LinkchatConfig;
use crate::connection_state::ConnectionState;
use crate::credentials::CredentialProvider;
use crate::error::{LinkchatSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::lifecycle::LifecycleManager;
use crate::message_type::MessageContent;
use crate::notification::{NoopNotificationDispatcher, NotificationDispatcher};
use crate::read_state::publish_unread;
use crate::session::Session;
use crate::storage::entities::{Conversation, ConversationRef, Message, MessagePage};
use crate::storage::reconcile::ReadChange;
use crate::storage::{StorageManager, StoreChange};
use crate::sync::SyncReport;
use crate::transport::websocket::WebSocketTransport;
use crate::transport::Transport;

const OBSERVATION_BUFFER: usize = 16;

/// 一个可观察的查询结果
///
/// 调用 [`Observation::unsubscribe`] 或直接丢弃即可停止；会话关闭时自动结束。
pub struct Observation<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T> Observation<T> {
    /// 下一次结果；观察结束后返回 None
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl<T> Drop for Observation<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> std::fmt::Debug for Observation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("active", &self.is_active())
            .finish()
    }
}

/// 推送一个值；观察已取消或接收端已丢弃时返回 false
async fn deliver<T>(tx: &mpsc::Sender<T>, cancel: &CancellationToken, value: T) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(value) => sent.is_ok(),
    }
}

/// 订阅存储变更，`relevant` 命中时重新执行 `query`
fn observe_store<T, F, Fut>(
    storage: Arc<StorageManager>,
    session_cancel: &CancellationToken,
    relevant: impl Fn(&StoreChange) -> bool + Send + 'static,
    query: F,
) -> Observation<T>
where
    T: Send + 'static,
    F: Fn(Arc<StorageManager>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send,
{
    let (tx, rx) = mpsc::channel(OBSERVATION_BUFFER);
    let cancel = session_cancel.child_token();
    // 先订阅再做首次查询，避免漏掉两者之间的提交
    let mut changes = storage.subscribe_changes();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut refresh = true;
        loop {
            if refresh {
                match query(storage.clone()).await {
                    Ok(value) => {
                        if !deliver(&tx, &task_cancel, value).await {
                            break;
                        }
                    }
                    Err(e) => warn!("[Repository] 观察查询失败: {}", e),
                }
            }
            refresh = tokio::select! {
                _ = task_cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => relevant(&change),
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => break,
                },
            };
        }
        debug!("[Repository] 观察已结束");
    });

    Observation { rx, cancel }
}

pub struct ChatRepository {
    config: LinkchatConfig,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn NotificationDispatcher>,
    events: Arc<EventManager>,
    lifecycle: LifecycleManager,
    session: RwLock<Option<Arc<Session>>>,
}

impl std::fmt::Debug for ChatRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRepository")
            .field("server_url", &self.config.server_url)
            .finish()
    }
}

impl ChatRepository {
    pub fn new(
        config: LinkchatConfig,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        info!("[Repository] 🚀 初始化: server={}", config.server_url);
        Ok(Self {
            config,
            transport,
            notifier,
            events,
            lifecycle: LifecycleManager::new(),
            session: RwLock::new(None),
        })
    }

    /// 使用 WebSocket 传输、不分发通知
    pub fn with_websocket(config: LinkchatConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(WebSocketTransport::new()),
            Arc::new(NoopNotificationDispatcher),
        )
    }

    pub fn config(&self) -> &LinkchatConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    async fn session(&self) -> Result<Arc<Session>> {
        self.session.read().await.clone().ok_or(LinkchatSDKError::NoSession)
    }

    pub async fn current_user(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.user_id().to_string())
    }

    // ========== 会话 ==========

    /// 登录：为凭据对应的用户打开会话，已有会话会先被关闭
    pub async fn login(&self, provider: Arc<dyn CredentialProvider>) -> Result<()> {
        let credentials = provider.credentials().await?;
        credentials.validate()?;

        let mut slot = self.session.write().await;
        if let Some(previous) = slot.take() {
            info!(
                "[Repository] 🔄 切换用户: {} -> {}",
                previous.user_id(),
                credentials.user_id
            );
            self.lifecycle.clear_hooks();
            if let Err(e) = previous.close().await {
                warn!("[Repository] 关闭旧会话失败: {}", e);
            }
        }

        let session = Session::open(
            &self.config,
            &credentials,
            provider,
            self.transport.clone(),
            self.events.clone(),
            self.notifier.clone(),
        )
        .await?;
        self.lifecycle.register_hook(session.lifecycle_hook());
        *slot = Some(Arc::new(session));
        info!("[Repository] ✅ 登录成功: user={}", credentials.user_id);
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        self.lifecycle.clear_hooks();
        info!("[Repository] 👋 登出: user={}", session.user_id());
        session.close().await
    }

    pub async fn connect(&self) -> Result<()> {
        self.session().await?.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.session().await?.disconnect().await;
        Ok(())
    }

    // ========== 发送 ==========

    pub async fn send(&self, receiver_id: &str, content: MessageContent) -> Result<Message> {
        self.session().await?.pipeline().send(receiver_id, content).await
    }

    pub async fn retry(&self, client_id: &str) -> Result<Message> {
        self.session().await?.pipeline().retry(client_id).await
    }

    pub async fn cancel(&self, client_id: &str) -> Result<Message> {
        self.session().await?.pipeline().cancel(client_id).await
    }

    pub async fn withdraw(&self, message_id: &str) -> Result<Message> {
        self.session().await?.pipeline().withdraw(message_id).await
    }

    // ========== 已读 ==========

    pub async fn mark_read(&self, ids: Vec<String>) -> Result<ReadChange> {
        self.session().await?.read_state().mark_read(ids).await
    }

    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<ReadChange> {
        self.session()
            .await?
            .read_state()
            .mark_conversation_read(conversation_id)
            .await
    }

    pub async fn mark_all_read(&self) -> Result<ReadChange> {
        self.session().await?.read_state().mark_all_read().await
    }

    pub async fn total_unread(&self) -> Result<u32> {
        self.session().await?.read_state().total_unread().await
    }

    // ========== 同步 ==========

    pub async fn sync(&self) -> Result<SyncReport> {
        self.session().await?.sync_engine().sync().await
    }

    // ========== 查询 ==========

    pub async fn get_conversation(&self, by: ConversationRef) -> Result<Option<Conversation>> {
        self.session().await?.storage().get_conversation(by).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.session().await?.storage().list_conversations().await
    }

    pub async fn messages(&self, conversation_id: &str, page: MessagePage) -> Result<Vec<Message>> {
        self.session()
            .await?
            .storage()
            .list_messages(conversation_id, page)
            .await
    }

    /// 删除会话及其全部消息
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        let session = self.session().await?;
        let deleted = session.storage().delete_conversation(conversation_id).await?;
        if deleted {
            info!("[Repository] 🗑️ 会话已删除: {}", conversation_id);
            self.events
                .emit(SDKEvent::unread_count_changed(conversation_id.to_string(), 0))
                .await;
        }
        Ok(deleted)
    }

    // ========== 观察 ==========

    /// 会话列表（按最近活动排序）
    pub async fn observe_conversations(&self) -> Result<Observation<Vec<Conversation>>> {
        let session = self.session().await?;
        Ok(observe_store(
            session.storage().clone(),
            session.cancel_token(),
            |_| true,
            |storage| async move { storage.list_conversations().await },
        ))
    }

    /// 某个会话的一页消息
    pub async fn observe_messages(
        &self,
        conversation_id: &str,
        page: MessagePage,
    ) -> Result<Observation<Vec<Message>>> {
        let session = self.session().await?;
        let watched = conversation_id.to_string();
        let queried = watched.clone();
        Ok(observe_store(
            session.storage().clone(),
            session.cancel_token(),
            move |change| change.touches(&watched),
            move |storage| {
                let conversation_id = queried.clone();
                async move { storage.list_messages(&conversation_id, page).await }
            },
        ))
    }

    pub async fn observe_connection_state(&self) -> Result<Observation<ConnectionState>> {
        let session = self.session().await?;
        let mut state = session.channel().watch_state();
        let (tx, rx) = mpsc::channel(OBSERVATION_BUFFER);
        let cancel = session.cancel_token().child_token();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let current = state.borrow_and_update().clone();
                if !deliver(&tx, &task_cancel, current).await {
                    break;
                }
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Observation { rx, cancel })
    }

    /// SDK 事件流，跨会话保持有效
    pub fn subscribe_events(&self) -> broadcast::Receiver<SDKEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    // ========== 生命周期 ==========

    pub async fn enter_foreground(&self) -> Result<()> {
        self.lifecycle.notify_foreground().await
    }

    pub async fn enter_background(&self) -> Result<()> {
        self.lifecycle.notify_background().await
    }

    /// 刷新所有会话的未读数事件（例如 UI 重建后）
    pub async fn republish_unread(&self) -> Result<()> {
        let session = self.session().await?;
        let ids = session
            .storage()
            .list_conversations()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        publish_unread(session.storage(), &self.events, ids).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_state::ConnectionStatus;
    use crate::credentials::{Credentials, StaticCredentials};
    use crate::storage::entities::{conversation_id, MessageStatus};
    use crate::testing::{eventually, test_config, FakeServer};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        received: Mutex<Vec<Message>>,
    }

    #[async_trait::async_trait]
    impl NotificationDispatcher for RecordingNotifier {
        async fn dispatch(&self, message: &Message) {
            self.received.lock().push(message.clone());
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        server: FakeServer,
        notifier: Arc<RecordingNotifier>,
        repo: ChatRepository,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::start();
        let notifier = Arc::new(RecordingNotifier::default());
        let repo = ChatRepository::new(
            test_config(dir.path()),
            Arc::new(server.transport()),
            notifier.clone(),
        )
        .unwrap();
        Harness {
            _dir: dir,
            server,
            notifier,
            repo,
        }
    }

    fn login_as(user_id: &str) -> Arc<dyn CredentialProvider> {
        Arc::new(StaticCredentials::new(Credentials::new(user_id, "token")))
    }

    async fn next_matching<T>(observation: &mut Observation<T>, mut accept: impl FnMut(&T) -> bool) -> T {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let value = observation.next().await.expect("observation ended");
                if accept(&value) {
                    return value;
                }
            }
        })
        .await
        .expect("observation timed out")
    }

    /// 登录、连接并等待连接时触发的后台同步完成
    async fn online(h: &Harness, user_id: &str) {
        let mut rx = h.repo.subscribe_events();
        h.repo.login(login_as(user_id)).await.unwrap();
        h.repo.connect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !matches!(rx.recv().await, Ok(SDKEvent::SyncCompleted { .. })) {}
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_requires_session() {
        let h = harness();
        assert!(matches!(h.repo.connect().await, Err(LinkchatSDKError::NoSession)));
        assert!(matches!(
            h.repo.send("bob", MessageContent::text("hi")).await,
            Err(LinkchatSDKError::NoSession)
        ));
        assert!(h.repo.current_user().await.is_none());
        // 没有会话时登出无副作用
        h.repo.logout().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_and_receive_through_facade() {
        let h = harness();
        online(&h, "alice").await;
        let mut conversations = h.repo.observe_conversations().await.unwrap();
        assert!(next_matching(&mut conversations, |_| true).await.is_empty());

        h.server.deliver("bob", "alice", "is it still available?");
        let list = next_matching(&mut conversations, |list| {
            list.first().map_or(false, |c| c.unread_count == 1)
        })
        .await;
        assert_eq!(list[0].id, conversation_id("alice", "bob"));
        let notifier = &h.notifier;
        eventually("notification dispatched", || async move {
            notifier.received.lock().len() == 1
        })
        .await;

        let conv = conversation_id("alice", "bob");
        let mut messages = h.repo.observe_messages(&conv, MessagePage::default()).await.unwrap();
        let sent = h.repo.send("bob", MessageContent::text("yes")).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Sending);
        let page = next_matching(&mut messages, |page| {
            page.iter()
                .any(|m| m.client_id == sent.client_id && m.status == MessageStatus::Sent)
        })
        .await;
        assert_eq!(page.len(), 2);
        // 发送出去的消息不产生通知
        assert_eq!(h.notifier.received.lock().len(), 1);

        h.repo.mark_conversation_read(&conv).await.unwrap();
        assert_eq!(h.repo.total_unread().await.unwrap(), 0);
        let by_peer = h
            .repo
            .get_conversation(ConversationRef::Participant("bob".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_peer.id, conv);
    }

    #[tokio::test]
    async fn test_switching_user_isolates_data() {
        let h = harness();
        let mut rx = h.repo.subscribe_events();
        h.repo.login(login_as("alice")).await.unwrap();
        h.repo.connect().await.unwrap();
        h.repo.send("bob", MessageContent::text("hi bob")).await.unwrap();
        let mut alice_view = h.repo.observe_conversations().await.unwrap();
        next_matching(&mut alice_view, |list| list.len() == 1).await;

        h.repo.login(login_as("carol")).await.unwrap();
        assert_eq!(h.repo.current_user().await.as_deref(), Some("carol"));
        assert!(h.repo.conversations().await.unwrap().is_empty());
        assert_eq!(h.repo.lifecycle().hook_count(), 1);

        // 旧会话的观察随会话一起结束
        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            while alice_view.next().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SDKEvent::SessionClosed { user_id, .. }) = rx.recv().await {
                    return user_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed, "alice");
    }

    #[tokio::test]
    async fn test_offline_send_is_delivered_after_connect() {
        let h = harness();
        h.repo.login(login_as("alice")).await.unwrap();
        let sent = h.repo.send("bob", MessageContent::text("queued")).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Sending);

        h.repo.connect().await.unwrap();
        let repo = &h.repo;
        let client_id = sent.client_id.clone();
        eventually("queued message acked", || {
            let client_id = client_id.clone();
            async move {
                let conv = conversation_id("alice", "bob");
                repo.messages(&conv, MessagePage::default())
                    .await
                    .unwrap()
                    .iter()
                    .any(|m| m.client_id == client_id && m.status == MessageStatus::Sent)
            }
        })
        .await;
        assert_eq!(h.server.stored_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_enter_foreground_syncs() {
        let h = harness();
        h.repo.login(login_as("alice")).await.unwrap();
        h.repo.connect().await.unwrap();
        h.server.seed("bob", "alice", "pushed while backgrounded");

        h.repo.enter_background().await.unwrap();
        h.repo.enter_foreground().await.unwrap();
        assert_eq!(h.repo.total_unread().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_observation() {
        let h = harness();
        h.repo.login(login_as("alice")).await.unwrap();
        let mut state = h.repo.observe_connection_state().await.unwrap();
        let first = next_matching(&mut state, |_| true).await;
        assert_eq!(first.status, ConnectionStatus::Disconnected);

        h.repo.connect().await.unwrap();
        next_matching(&mut state, |s| s.status == ConnectionStatus::Joined).await;

        state.unsubscribe();
        assert!(!state.is_active());
        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            while state.next().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let h = harness();
        h.repo.login(login_as("alice")).await.unwrap();
        h.repo.connect().await.unwrap();
        h.server.seed("bob", "alice", "one");
        h.server.seed("bob", "alice", "two");
        h.repo.sync().await.unwrap();
        assert_eq!(h.repo.total_unread().await.unwrap(), 2);

        let conv = conversation_id("alice", "bob");
        assert!(h.repo.delete_conversation(&conv).await.unwrap());
        assert!(h.repo.messages(&conv, MessagePage::default()).await.unwrap().is_empty());
        assert_eq!(h.repo.total_unread().await.unwrap(), 0);
        assert!(!h.repo.delete_conversation(&conv).await.unwrap());

        h.repo.logout().await.unwrap();
        assert!(matches!(h.repo.total_unread().await, Err(LinkchatSDKError::NoSession)));
    }
}
