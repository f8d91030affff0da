//! 实时通道客户端
//!
//! 在一条传输连接上复用多个 topic：
//! - join/leave/push/heartbeat 都携带自增 ref，回复按 ref 关联到等待方；
//! - 心跳连续未响应达到阈值，按连接断开处理；
//! - 非主动断开后按退避策略自动重连，重连成功后按原加入顺序重新 join 所有 topic，
//!   全部完成后才进入 Joined 并发出 `Reconnected` 事件。

pub mod backoff;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use backoff::ReconnectPolicy;

use crate::config::LinkchatConfig;
use crate::connection_state::{ConnectionState, ConnectionStateManager, ConnectionStatus};
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::{LinkchatSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::transport::frame::user_topic;
use crate::transport::{Frame, FrameSink, FrameStream, Link, OpenRequest, ReplyStatus, Transport};
use crate::utils::now_millis;

const BROADCAST_BUFFER: usize = 256;

/// 通道参数（从 [`LinkchatConfig`] 派生）
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub join_timeout: Duration,
    pub push_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub reconnect: ReconnectPolicy,
}

impl From<&LinkchatConfig> for ChannelConfig {
    fn from(config: &LinkchatConfig) -> Self {
        Self {
            url: config.server_url.clone(),
            connect_timeout: config.connect_timeout(),
            join_timeout: config.join_timeout(),
            push_timeout: config.push_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_miss_threshold: config.heartbeat_miss_threshold,
            reconnect: config.reconnect.clone(),
        }
    }
}

/// 服务端在某个 topic 上的广播
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBroadcast {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

type ReplyWaiter = oneshot::Sender<Result<Value>>;
type JoinWaiter = oneshot::Sender<Result<()>>;

/// 当前连接的写入端
struct LinkHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

struct Inner {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    state: ConnectionStateManager,
    events: Arc<EventManager>,
    broadcasts: broadcast::Sender<ChannelBroadcast>,
    next_ref: AtomicU64,
    /// 每建立一条连接加一，用于丢弃旧连接任务的迟到通知
    generation: AtomicU64,
    reconnect_epoch: AtomicU64,
    link: Mutex<Option<LinkHandle>>,
    pending: Mutex<HashMap<u64, ReplyWaiter>>,
    /// 已加入的 topic，按加入顺序；断线后保留，重连时据此重新加入
    topics: Mutex<Vec<String>>,
    /// 当前连接上已确认加入的 topic：(generation, topics)，换连接时清空
    live_topics: Mutex<(u64, Vec<String>)>,
    joining: Mutex<HashMap<String, Vec<JoinWaiter>>>,
    user_id: Mutex<Option<String>>,
    reconnect_loop: Mutex<Option<(u64, CancellationToken)>>,
    shutdown: CancellationToken,
}

/// 实时通道客户端（可克隆，内部共享同一条连接）
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("url", &self.inner.config.url)
            .field("status", &self.inner.state.status())
            .field("topics", &*self.inner.topics.lock())
            .finish()
    }
}

impl ChannelClient {
    pub fn new(
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        events: Arc<EventManager>,
        shutdown: CancellationToken,
    ) -> Self {
        let (broadcasts, _) = broadcast::channel(BROADCAST_BUFFER);
        let state = ConnectionStateManager::new(config.url.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                credentials,
                state,
                events,
                broadcasts,
                next_ref: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                reconnect_epoch: AtomicU64::new(0),
                link: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                topics: Mutex::new(Vec::new()),
                live_topics: Mutex::new((0, Vec::new())),
                joining: Mutex::new(HashMap::new()),
                user_id: Mutex::new(None),
                reconnect_loop: Mutex::new(None),
                shutdown,
            }),
        }
    }

    // ========== 状态 ==========

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<ChannelBroadcast> {
        self.inner.broadcasts.subscribe()
    }

    /// 已加入的 topic（包括断线后等待重新加入的）
    pub fn joined_topics(&self) -> Vec<String> {
        self.inner.topics.lock().clone()
    }

    /// topic 是否已在当前连接上加入
    pub fn is_joined(&self, topic: &str) -> bool {
        self.inner.live_topics.lock().1.iter().any(|t| t == topic)
    }

    fn is_tracked(&self, topic: &str) -> bool {
        self.inner.topics.lock().iter().any(|t| t == topic)
    }

    fn current_generation(&self) -> Option<u64> {
        self.inner.link.lock().as_ref().map(|handle| handle.generation)
    }

    fn mark_live(&self, generation: u64, topic: &str) {
        let mut live = self.inner.live_topics.lock();
        if live.0 == generation && !live.1.iter().any(|t| t == topic) {
            live.1.push(topic.to_string());
        }
    }

    /// 最近一次连接使用的用户 ID
    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id.lock().clone()
    }

    fn is_primary(&self, topic: &str) -> bool {
        self.inner
            .user_id
            .lock()
            .as_deref()
            .map_or(false, |uid| user_topic(uid) == topic)
    }

    async fn set_status(&self, next: ConnectionStatus) -> bool {
        let old = self.inner.state.status();
        if old == next {
            return true;
        }
        if !self.inner.state.transition(next) {
            return false;
        }
        info!("[Channel] 🔄 连接状态: {} -> {}", old, next);
        self.inner
            .events
            .emit(SDKEvent::connection_state_changed(old, next, None))
            .await;
        true
    }

    async fn set_error(&self, error: &LinkchatSDKError) {
        let old = self.inner.state.status();
        if old == ConnectionStatus::ConnectionError {
            return;
        }
        if self.inner.state.fail(error.to_string()) {
            error!("[Channel] ❌ 连接进入错误状态: {}", error);
            self.inner
                .events
                .emit(SDKEvent::connection_state_changed(
                    old,
                    ConnectionStatus::ConnectionError,
                    Some(error.to_string()),
                ))
                .await;
        }
    }

    // ========== 连接 ==========

    /// 建立连接：Disconnected/ConnectionError → Connecting → Connected
    ///
    /// 失败时进入 ConnectionError，不会自动重试。
    pub async fn connect(&self) -> Result<()> {
        match self.inner.state.status() {
            ConnectionStatus::Connected | ConnectionStatus::Joined => return Ok(()),
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                return Err(LinkchatSDKError::InvalidOperation(
                    "连接正在建立中".to_string(),
                ))
            }
            ConnectionStatus::Disconnected | ConnectionStatus::ConnectionError => {}
        }

        self.stop_reconnect_loop();
        self.set_status(ConnectionStatus::Connecting).await;
        info!("[Channel] 🚀 开始连接: {}", self.inner.config.url);

        let opened = async {
            let credentials = self.inner.credentials.credentials().await?;
            credentials.validate()?;
            let link = self.open_link(&credentials).await?;
            Ok::<_, LinkchatSDKError>((credentials, link))
        }
        .await;

        match opened {
            Ok((credentials, link)) => {
                self.inner.state.set_user(credentials.user_id.clone());
                *self.inner.user_id.lock() = Some(credentials.user_id);
                self.install_link(link, None);
                self.set_status(ConnectionStatus::Connected).await;
                info!("[Channel] ✅ 连接已建立");
                Ok(())
            }
            Err(e) => {
                self.set_error(&e).await;
                Err(e)
            }
        }
    }

    /// 主动断开：任意状态 → Disconnected，清空 topic 并停止重连
    pub async fn disconnect(&self) {
        self.set_status(ConnectionStatus::Disconnected).await;
        self.stop_reconnect_loop();
        self.drop_link("连接已主动断开");
        self.inner.topics.lock().clear();
        info!("[Channel] 🔌 已断开连接");
    }

    /// 调用方从 ConnectionError 发起的重连
    ///
    /// 之前加入过 topic 时走完整的重连流程（按顺序重新 join），否则等同于 `connect`。
    pub async fn reconnect(&self) -> Result<()> {
        match self.inner.state.status() {
            ConnectionStatus::Connected | ConnectionStatus::Joined => return Ok(()),
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                return Err(LinkchatSDKError::InvalidOperation(
                    "重连已在进行中".to_string(),
                ))
            }
            ConnectionStatus::Disconnected => return self.connect().await,
            ConnectionStatus::ConnectionError => {}
        }

        if self.inner.topics.lock().is_empty() {
            return self.connect().await;
        }

        let (epoch, token) = self.begin_reconnect().ok_or_else(|| {
            LinkchatSDKError::InvalidOperation("重连已在进行中".to_string())
        })?;
        self.set_status(ConnectionStatus::Reconnecting).await;
        self.clone().reconnect_loop(epoch, token).await
    }

    async fn open_link(&self, credentials: &Credentials) -> Result<Link> {
        let request = OpenRequest {
            url: self.inner.config.url.clone(),
            token: credentials.token.clone(),
            user_id: credentials.user_id.clone(),
            timeout: self.inner.config.connect_timeout,
        };
        self.inner.transport.open(&request).await
    }

    /// 接管一条新连接，启动读、写、心跳三个任务
    ///
    /// `abort` 已取消时（重连握手期间被主动断开）丢弃这条连接并返回 None。
    /// 检查与替换持有同一把锁；`disconnect` 先取消重连再清理连接。
    fn install_link(&self, link: Link, abort: Option<&CancellationToken>) -> Option<u64> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.inner.shutdown.child_token();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let previous = {
            let mut current = self.inner.link.lock();
            if abort.map_or(false, |token| token.is_cancelled()) {
                debug!("[Channel] 重连已取消，丢弃新建立的连接");
                return None;
            }
            *self.inner.live_topics.lock() = (generation, Vec::new());
            current.replace(LinkHandle {
                generation,
                outbound,
                cancel: cancel.clone(),
            })
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let Link { sink, stream } = link;
        tokio::spawn(self.clone().run_writer(generation, sink, outbound_rx, cancel.clone()));
        tokio::spawn(self.clone().run_reader(generation, stream, cancel.clone()));
        tokio::spawn(self.clone().run_heartbeat(generation, cancel));
        debug!("[Channel] 连接任务已启动: generation={}", generation);
        Some(generation)
    }

    /// 丢弃当前连接，所有等待中的回复以 `Network` 失败
    fn drop_link(&self, reason: &str) {
        if let Some(handle) = self.inner.link.lock().take() {
            handle.cancel.cancel();
        }
        self.inner.live_topics.lock().1.clear();
        self.fail_pending(reason);
    }

    fn fail_pending(&self, reason: &str) {
        let waiters: Vec<ReplyWaiter> = self.inner.pending.lock().drain().map(|(_, w)| w).collect();
        if !waiters.is_empty() {
            debug!("[Channel] {} 个等待中的请求因断线失败", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(Err(LinkchatSDKError::Network(reason.to_string())));
        }
    }

    async fn run_writer(
        self,
        generation: u64,
        mut sink: Box<dyn FrameSink>,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = outbound.recv() => frame,
            };
            let Some(frame) = frame else { break };
            if let Err(e) = sink.send(frame).await {
                warn!("[Channel] 写入帧失败: {}", e);
                self.on_link_lost(generation, e.to_string()).await;
                break;
            }
            self.inner.state.record_sent();
        }
        let _ = sink.close().await;
        debug!("[Channel] 写任务退出: generation={}", generation);
    }

    async fn run_reader(self, generation: u64, mut stream: Box<dyn FrameStream>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    self.inner.state.record_received();
                    self.dispatch(frame);
                }
                Some(Err(e)) => {
                    warn!("[Channel] 读取帧失败，重置连接: {}", e);
                    self.on_link_lost(generation, e.to_string()).await;
                    break;
                }
                None => {
                    self.on_link_lost(generation, "服务端关闭了连接".to_string()).await;
                    break;
                }
            }
        }
        debug!("[Channel] 读任务退出: generation={}", generation);
    }

    async fn run_heartbeat(self, generation: u64, cancel: CancellationToken) {
        let interval = self.inner.config.heartbeat_interval;
        let threshold = self.inner.config.heartbeat_miss_threshold.max(1);
        let mut misses = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let heartbeat = self.request(|reference| Frame::Heartbeat { reference }, interval);
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = heartbeat => result,
            };

            match result {
                Ok(_) => misses = 0,
                Err(LinkchatSDKError::NotConnected) => return,
                Err(e) => {
                    misses += 1;
                    warn!("[Channel] 💔 心跳未响应 ({}/{}): {}", misses, threshold, e);
                    if misses >= threshold {
                        self.on_link_lost(generation, format!("心跳连续 {} 次未响应", misses))
                            .await;
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Reply {
                reference,
                status,
                payload,
            } => {
                let waiter = self.inner.pending.lock().remove(&reference);
                let Some(waiter) = waiter else {
                    debug!("[Channel] 丢弃无人等待的回复: ref={}", reference);
                    return;
                };
                let result = match status {
                    ReplyStatus::Ok => Ok(payload),
                    ReplyStatus::Error => Err(LinkchatSDKError::Rejected(reply_reason(&payload))),
                };
                let _ = waiter.send(result);
            }
            Frame::Broadcast { topic, event, payload } => {
                debug!("[Channel] 📨 广播: topic={}, event={}", topic, event);
                let _ = self.inner.broadcasts.send(ChannelBroadcast { topic, event, payload });
            }
            other => warn!("[Channel] 忽略服务端发来的意外帧: {:?}", other),
        }
    }

    /// 连接非主动断开：失败所有等待方，进入 Reconnecting 并启动重连
    async fn on_link_lost(&self, generation: u64, reason: String) {
        {
            let mut link = self.inner.link.lock();
            match link.as_ref() {
                Some(handle) if handle.generation == generation => {
                    handle.cancel.cancel();
                    *link = None;
                }
                // 旧连接的迟到通知
                _ => return,
            }
        }

        warn!("[Channel] ⚠️ 连接断开: {}", reason);
        self.inner.live_topics.lock().1.clear();
        self.fail_pending(&reason);

        if self.inner.shutdown.is_cancelled() {
            return;
        }
        match self.inner.state.status() {
            ConnectionStatus::Connected | ConnectionStatus::Joined | ConnectionStatus::Reconnecting => {}
            _ => return,
        }

        self.set_status(ConnectionStatus::Reconnecting).await;
        self.spawn_reconnect_loop();
    }

    // ========== 重连 ==========

    fn begin_reconnect(&self) -> Option<(u64, CancellationToken)> {
        let mut guard = self.inner.reconnect_loop.lock();
        if let Some((_, token)) = guard.as_ref() {
            if !token.is_cancelled() {
                return None;
            }
        }
        let epoch = self.inner.reconnect_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.inner.shutdown.child_token();
        *guard = Some((epoch, token.clone()));
        Some((epoch, token))
    }

    fn end_reconnect(&self, epoch: u64) {
        let mut guard = self.inner.reconnect_loop.lock();
        if matches!(guard.as_ref(), Some((current, _)) if *current == epoch) {
            *guard = None;
        }
    }

    fn stop_reconnect_loop(&self) {
        if let Some((_, token)) = self.inner.reconnect_loop.lock().take() {
            token.cancel();
        }
    }

    fn spawn_reconnect_loop(&self) {
        let Some((epoch, token)) = self.begin_reconnect() else {
            debug!("[Channel] 重连已在进行中");
            return;
        };
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.reconnect_loop(epoch, token).await {
                debug!("[Channel] 重连结束: {}", e);
            }
        });
    }

    async fn reconnect_loop(self, epoch: u64, cancel: CancellationToken) -> Result<()> {
        let result = self.run_reconnect_attempts(&cancel).await;
        self.end_reconnect(epoch);
        result
    }

    async fn run_reconnect_attempts(&self, cancel: &CancellationToken) -> Result<()> {
        let policy = self.inner.config.reconnect.clone();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let delay = policy.delay_for(attempts);
            info!(
                "[Channel] 🔁 第 {} 次重连将在 {}ms 后开始",
                attempts,
                delay.as_millis()
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LinkchatSDKError::ShuttingDown("重连已取消".to_string()))
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LinkchatSDKError::ShuttingDown("重连已取消".to_string()))
                }
                outcome = self.try_reconnect(cancel) => outcome,
            };

            match outcome {
                Ok(topics) => {
                    info!(
                        "[Channel] ✅ 重连成功: attempts={}, topics={:?}",
                        attempts, topics
                    );
                    self.inner
                        .events
                        .emit(SDKEvent::Reconnected {
                            attempts,
                            topics,
                            timestamp: now_millis(),
                        })
                        .await;
                    return Ok(());
                }
                Err(_) if cancel.is_cancelled() => {
                    return Err(LinkchatSDKError::ShuttingDown("重连已取消".to_string()))
                }
                Err(e) => {
                    self.drop_link(&e.to_string());
                    self.set_status(ConnectionStatus::Reconnecting).await;

                    if e.is_auth() {
                        error!("[Channel] ❌ 重连认证失败，停止重连: {}", e);
                        self.set_error(&e).await;
                        return Err(e);
                    }
                    warn!("[Channel] 第 {} 次重连失败: {}", attempts, e);
                    if policy.is_exhausted(attempts) {
                        let exhausted = LinkchatSDKError::Network(format!(
                            "重连 {} 次后仍失败: {}",
                            attempts, e
                        ));
                        self.set_error(&exhausted).await;
                        return Err(exhausted);
                    }
                }
            }
        }
    }

    /// 单次重连：重新读取凭证，重建连接，按原顺序重新加入 topic
    async fn try_reconnect(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let credentials = self.inner.credentials.credentials().await?;
        credentials.validate()?;
        let expected = self.inner.user_id.lock().clone();
        if let Some(expected) = expected {
            if expected != credentials.user_id {
                return Err(LinkchatSDKError::Auth(format!(
                    "凭证用户已变更: {} -> {}",
                    expected, credentials.user_id
                )));
            }
        }

        let link = self.open_link(&credentials).await?;
        if self.install_link(link, Some(cancel)).is_none() {
            return Err(LinkchatSDKError::ShuttingDown("重连已取消".to_string()));
        }
        self.set_status(ConnectionStatus::Connected).await;

        let snapshot = self.inner.topics.lock().clone();
        let primary = user_topic(&credentials.user_id);
        let mut failed = Vec::new();
        for topic in &snapshot {
            match self.send_join(topic).await {
                Ok(()) => {}
                Err(e @ LinkchatSDKError::Join { .. }) if *topic != primary => {
                    warn!("[Channel] topic 重新加入被拒绝，已移除: {}", e);
                    failed.push(topic.clone());
                }
                Err(e) => return Err(e),
            }
        }

        let topics = {
            let mut topics = self.inner.topics.lock();
            topics.retain(|t| !failed.contains(t));
            topics.clone()
        };
        self.inner.state.set_joined_topics(topics.clone());
        if topics.contains(&primary) {
            self.set_status(ConnectionStatus::Joined).await;
        }
        Ok(topics)
    }

    // ========== topic ==========

    /// 加入 topic；同一 topic 的并发 join 合并为一次请求
    pub async fn join(&self, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(LinkchatSDKError::InvalidArgument("topic 不能为空".to_string()));
        }
        // 已记录的 topic 断线后由重连流程负责重新加入
        if self.is_tracked(topic) {
            return Ok(());
        }
        if self.inner.link.lock().is_none() {
            return Err(LinkchatSDKError::NotConnected);
        }

        let waiter = {
            let mut joining = self.inner.joining.lock();
            match joining.get_mut(topic) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    joining.insert(topic.to_string(), Vec::new());
                    None
                }
            }
        };
        if let Some(rx) = waiter {
            debug!("[Channel] 合并并发 join: {}", topic);
            return rx
                .await
                .unwrap_or_else(|_| Err(LinkchatSDKError::Network("join 已中断".to_string())));
        }

        let slot = JoinSlot {
            joining: &self.inner.joining,
            topic,
            finished: false,
        };
        let result = match self.send_join(topic).await {
            Err(LinkchatSDKError::Timeout(reason)) => Err(LinkchatSDKError::Join {
                topic: topic.to_string(),
                reason,
            }),
            other => other,
        };

        match &result {
            Ok(()) => {
                self.record_joined(topic).await;
                info!("[Channel] ✅ 已加入 topic: {}", topic);
            }
            Err(e) => warn!("[Channel] ❌ 加入 topic 失败: {}", e),
        }
        slot.finish(&result);
        result
    }

    async fn send_join(&self, topic: &str) -> Result<()> {
        let generation = self.current_generation().ok_or(LinkchatSDKError::NotConnected)?;
        let name = topic.to_string();
        let reply = self
            .request(
                move |reference| Frame::Join { topic: name, reference },
                self.inner.config.join_timeout,
            )
            .await;
        match reply {
            Ok(_) => {
                self.mark_live(generation, topic);
                Ok(())
            }
            Err(LinkchatSDKError::Rejected(reason)) => Err(LinkchatSDKError::Join {
                topic: topic.to_string(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    async fn record_joined(&self, topic: &str) {
        let topics = {
            let mut topics = self.inner.topics.lock();
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
            topics.clone()
        };
        self.inner.state.set_joined_topics(topics);
        if self.is_primary(topic) {
            self.set_status(ConnectionStatus::Joined).await;
        }
    }

    /// 离开 topic；本地先移除，重连时不再重新加入
    pub async fn leave(&self, topic: &str) -> Result<()> {
        let topics = {
            let mut topics = self.inner.topics.lock();
            let before = topics.len();
            topics.retain(|t| t != topic);
            if topics.len() == before {
                return Ok(());
            }
            topics.clone()
        };
        self.inner.state.set_joined_topics(topics);
        self.inner.live_topics.lock().1.retain(|t| t != topic);

        let name = topic.to_string();
        match self
            .request(
                move |reference| Frame::Leave { topic: name, reference },
                self.inner.config.join_timeout,
            )
            .await
        {
            Ok(_) | Err(LinkchatSDKError::NotConnected) => {
                info!("[Channel] 已离开 topic: {}", topic);
                Ok(())
            }
            Err(e) => {
                warn!("[Channel] 离开 topic 失败: topic={}, error={}", topic, e);
                Err(e)
            }
        }
    }

    // ========== push ==========

    /// 在 topic 上发送事件，等待服务端回复
    ///
    /// 回复 ok 返回 payload；error 回复为 `Rejected`；超时为 `Timeout`。
    /// topic 必须已在当前连接上加入，重连后重新加入完成之前返回 `NotConnected`。
    pub async fn push(&self, topic: &str, event: &str, payload: Value) -> Result<Value> {
        if self.inner.link.lock().is_none() {
            return Err(LinkchatSDKError::NotConnected);
        }
        if !self.is_joined(topic) {
            // 重连后尚未重新加入：按未连接处理，调用方稍后重试
            if self.is_tracked(topic) {
                return Err(LinkchatSDKError::NotConnected);
            }
            return Err(LinkchatSDKError::InvalidOperation(format!(
                "topic 尚未加入: {}",
                topic
            )));
        }

        let (topic_name, event_name) = (topic.to_string(), event.to_string());
        let result = self
            .request(
                move |reference| Frame::Push {
                    topic: topic_name,
                    event: event_name,
                    payload,
                    reference,
                },
                self.inner.config.push_timeout,
            )
            .await;
        if let Err(e) = &result {
            debug!("[Channel] push 失败: topic={}, event={}, error={}", topic, event, e);
        }
        result
    }

    /// 发送带 ref 的帧并等待对应回复
    async fn request<F>(&self, build: F, timeout: Duration) -> Result<Value>
    where
        F: FnOnce(u64) -> Frame,
    {
        let reference = self.inner.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(reference, tx);

        if let Err(e) = self.send_frame(build(reference)) {
            self.inner.pending.lock().remove(&reference);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkchatSDKError::Network("连接已断开，回复丢失".to_string())),
            Err(_) => {
                self.inner.pending.lock().remove(&reference);
                Err(LinkchatSDKError::Timeout(format!(
                    "ref={} 在 {}ms 内未收到回复",
                    reference,
                    timeout.as_millis()
                )))
            }
        }
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let link = self.inner.link.lock();
        let handle = link.as_ref().ok_or(LinkchatSDKError::NotConnected)?;
        handle
            .outbound
            .send(frame)
            .map_err(|_| LinkchatSDKError::Network("连接写入端已关闭".to_string()))
    }
}

/// 进行中的 join；提前释放（调用方被取消）时移除占位，合并的等待方随之失败
struct JoinSlot<'a> {
    joining: &'a Mutex<HashMap<String, Vec<JoinWaiter>>>,
    topic: &'a str,
    finished: bool,
}

impl JoinSlot<'_> {
    fn finish(mut self, result: &Result<()>) {
        self.finished = true;
        let waiters = self.joining.lock().remove(self.topic).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for JoinSlot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.joining.lock().remove(self.topic);
        }
    }
}

fn reply_reason(payload: &Value) -> String {
    payload
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}
