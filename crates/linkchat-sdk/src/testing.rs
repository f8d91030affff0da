//! 测试用的进程内服务端
//!
//! 通过内存传输实现完整的线路协议：join/leave/heartbeat、消息发送 ACK、
//! 游标同步、已读与撤回，以及可控的故障注入（拒绝握手、丢 ACK、不回心跳、断连）。

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelClient, ChannelConfig, ReconnectPolicy};
use crate::config::LinkchatConfig;
use crate::credentials::{Credentials, StaticCredentials};
use crate::error::LinkchatSDKError;
use crate::events::EventManager;
use crate::message_type::MessageContent;
use crate::queue::retry_policy::RetryPolicy;
use crate::storage::entities::{conversation_id, MessageStatus, RemoteMessage};
use crate::storage::StorageManager;
use crate::transport::frame::{events, user_topic};
use crate::transport::memory::{memory_transport, MemoryListener, MemoryTransport, ServerConnection, ServerSender};
use crate::transport::{Frame, ReplyStatus};
use crate::utils::now_millis;

pub(crate) fn test_reconnect_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_interval_ms: 20,
        max_interval_ms: 100,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
        max_attempts: 3,
    }
}

pub(crate) fn test_channel_config() -> ChannelConfig {
    ChannelConfig {
        url: "memory://test".to_string(),
        connect_timeout: Duration::from_secs(1),
        join_timeout: Duration::from_secs(1),
        push_timeout: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_miss_threshold: 2,
        reconnect: test_reconnect_policy(),
    }
}

pub(crate) fn test_config(data_dir: &Path) -> LinkchatConfig {
    LinkchatConfig {
        data_dir: data_dir.to_path_buf(),
        server_url: "memory://test".to_string(),
        connect_timeout_ms: 1_000,
        join_timeout_ms: 1_000,
        push_timeout_ms: 300,
        heartbeat_interval_ms: 50,
        heartbeat_miss_threshold: 2,
        reconnect: test_reconnect_policy(),
        retry: RetryPolicy {
            max_retries: 3,
            base_delay_ms: 20,
            max_delay_ms: 100,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        },
        sync_page_size: 2,
        event_buffer_size: 256,
        debug_mode: true,
    }
}

struct LiveConnection {
    sender: ServerSender,
    topics: Vec<String>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ServerState {
    handshake_error: Option<LinkchatSDKError>,
    rejected: u32,
    connections: u32,
    live: HashMap<u32, LiveConnection>,
    join_log: Vec<(u32, String)>,
    rejected_topics: HashSet<String>,
    held_topics: HashSet<String>,
    rejected_events: HashSet<String>,
    held_events: HashSet<String>,
    ignore_heartbeats: bool,
    drop_acks: u32,
    messages: Vec<RemoteMessage>,
    pushes: Vec<(String, Value)>,
    clock: i64,
}

impl ServerState {
    fn next_ts(&mut self) -> i64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    fn broadcast(&self, topic: &str, event: &str, payload: Value) {
        let frame = Frame::Broadcast {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        };
        for conn in self.live.values() {
            if conn.topics.iter().any(|t| t == topic) {
                let _ = conn.sender.send(&frame);
            }
        }
    }

    fn handle(&mut self, conn_id: u32, user_id: &str, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Join { topic, reference } => {
                if self.rejected_topics.contains(&topic) {
                    return Some(error_reply(reference, "unauthorized"));
                }
                if self.held_topics.contains(&topic) {
                    return None;
                }
                self.join_log.push((conn_id, topic.clone()));
                if let Some(conn) = self.live.get_mut(&conn_id) {
                    conn.topics.push(topic);
                }
                Some(ok_reply(reference, json!({})))
            }
            Frame::Leave { topic, reference } => {
                if let Some(conn) = self.live.get_mut(&conn_id) {
                    conn.topics.retain(|t| *t != topic);
                }
                Some(ok_reply(reference, json!({})))
            }
            Frame::Heartbeat { reference } => {
                if self.ignore_heartbeats {
                    None
                } else {
                    Some(ok_reply(reference, json!({})))
                }
            }
            Frame::Push {
                event,
                payload,
                reference,
                ..
            } => {
                self.pushes.push((event.clone(), payload.clone()));
                if self.held_events.contains(&event) {
                    return None;
                }
                if self.rejected_events.contains(&event) {
                    return Some(error_reply(reference, "rejected"));
                }
                self.handle_push(user_id, &event, payload, reference)
            }
            _ => None,
        }
    }

    fn handle_push(&mut self, user_id: &str, event: &str, payload: Value, reference: u64) -> Option<Frame> {
        match event {
            events::MESSAGE_SEND => {
                let client_id = payload["client_id"].as_str().unwrap_or_default().to_string();
                let receiver_id = payload["receiver_id"].as_str().unwrap_or_default().to_string();
                let content: MessageContent = match serde_json::from_value(payload["content"].clone()) {
                    Ok(content) => content,
                    Err(_) => return Some(error_reply(reference, "bad content")),
                };

                let existing = self
                    .messages
                    .iter()
                    .find(|m| m.client_id.as_deref() == Some(client_id.as_str()))
                    .cloned();
                let message = match existing {
                    Some(message) => message,
                    None => {
                        let ts = self.next_ts();
                        let message = RemoteMessage {
                            id: format!("m{}", self.messages.len() + 1),
                            client_id: Some(client_id.clone()),
                            sender_id: user_id.to_string(),
                            receiver_id: receiver_id.clone(),
                            content,
                            status: None,
                            created_at: ts,
                            updated_at: ts,
                            sender: None,
                        };
                        self.messages.push(message.clone());
                        self.broadcast(
                            &user_topic(&receiver_id),
                            events::MESSAGE_NEW,
                            json!({ "message": message }),
                        );
                        message
                    }
                };

                if self.drop_acks > 0 {
                    self.drop_acks -= 1;
                    return None;
                }
                Some(ok_reply(
                    reference,
                    json!({
                        "id": message.id,
                        "client_id": client_id,
                        "created_at": message.created_at,
                        "updated_at": message.updated_at,
                    }),
                ))
            }
            events::SYNC => {
                let since = payload["since"].as_i64();
                let since_id = payload["since_id"].as_str().unwrap_or_default().to_string();
                let limit = payload["limit"].as_u64().unwrap_or(100) as usize;
                let mut visible: Vec<RemoteMessage> = self
                    .messages
                    .iter()
                    .filter(|m| m.sender_id == user_id || m.receiver_id == user_id)
                    .filter(|m| {
                        since.map_or(true, |since| (m.updated_at, m.id.as_str()) > (since, since_id.as_str()))
                    })
                    .cloned()
                    .collect();
                visible.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
                let has_more = visible.len() > limit;
                visible.truncate(limit);
                Some(ok_reply(
                    reference,
                    json!({ "messages": visible, "has_more": has_more }),
                ))
            }
            events::MESSAGE_READ => {
                let ids: Vec<String> = serde_json::from_value(payload["ids"].clone()).unwrap_or_default();
                self.mark_read_where(|m| m.receiver_id == user_id && ids.contains(&m.id));
                Some(ok_reply(reference, json!({})))
            }
            events::CONVERSATION_READ => {
                let target = payload["conversation_id"].as_str().unwrap_or_default().to_string();
                self.mark_read_where(|m| {
                    m.receiver_id == user_id && conversation_id(&m.sender_id, &m.receiver_id) == target
                });
                Some(ok_reply(reference, json!({})))
            }
            events::READ_ALL => {
                self.mark_read_where(|m| m.receiver_id == user_id);
                Some(ok_reply(reference, json!({})))
            }
            events::MESSAGE_WITHDRAW => {
                let id = payload["id"].as_str().unwrap_or_default().to_string();
                match self.withdraw(&id, Some(user_id)) {
                    Some(updated_at) => Some(ok_reply(reference, json!({ "id": id, "updated_at": updated_at }))),
                    None => Some(error_reply(reference, "not found")),
                }
            }
            _ => Some(error_reply(reference, "unknown event")),
        }
    }

    fn mark_read_where<F: Fn(&RemoteMessage) -> bool>(&mut self, filter: F) {
        let ts = self.next_ts();
        for message in self.messages.iter_mut().filter(|m| filter(m)) {
            if message.status.map_or(true, |s| !s.is_terminal()) {
                message.status = Some(MessageStatus::Read);
                message.updated_at = ts;
            }
        }
    }

    fn withdraw(&mut self, id: &str, by: Option<&str>) -> Option<i64> {
        let ts = self.next_ts();
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == id && by.map_or(true, |uid| m.sender_id == uid))?;
        message.status = Some(MessageStatus::Withdrawn);
        message.updated_at = ts;
        let (sender, receiver) = (message.sender_id.clone(), message.receiver_id.clone());
        let payload = json!({ "id": id, "updated_at": ts });
        self.broadcast(&user_topic(&receiver), events::MESSAGE_WITHDRAWN, payload.clone());
        self.broadcast(&user_topic(&sender), events::MESSAGE_WITHDRAWN, payload);
        Some(ts)
    }
}

fn ok_reply(reference: u64, payload: Value) -> Frame {
    Frame::Reply {
        reference,
        status: ReplyStatus::Ok,
        payload,
    }
}

fn error_reply(reference: u64, reason: &str) -> Frame {
    Frame::Reply {
        reference,
        status: ReplyStatus::Error,
        payload: json!({ "reason": reason }),
    }
}

/// 进程内服务端
pub(crate) struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    transport: MemoryTransport,
}

impl FakeServer {
    pub(crate) fn start() -> Self {
        let (transport, listener) = memory_transport();
        let state = Arc::new(Mutex::new(ServerState::default()));
        tokio::spawn(accept_loop(state.clone(), listener));
        Self { state, transport }
    }

    pub(crate) fn transport(&self) -> MemoryTransport {
        self.transport.clone()
    }

    // ---------- 故障注入 ----------

    pub(crate) fn reject_handshakes(&self, error: LinkchatSDKError) {
        self.state.lock().handshake_error = Some(error);
    }

    pub(crate) fn accept_handshakes(&self) {
        self.state.lock().handshake_error = None;
    }

    pub(crate) fn reject_join(&self, topic: &str) {
        self.state.lock().rejected_topics.insert(topic.to_string());
    }

    /// 收到该 topic 的 join 后不回复
    pub(crate) fn hold_join(&self, topic: &str) {
        self.state.lock().held_topics.insert(topic.to_string());
    }

    pub(crate) fn release_join(&self, topic: &str) {
        self.state.lock().held_topics.remove(topic);
    }

    pub(crate) fn reject_event(&self, event: &str) {
        self.state.lock().rejected_events.insert(event.to_string());
    }

    pub(crate) fn accept_event(&self, event: &str) {
        self.state.lock().rejected_events.remove(event);
    }

    /// 收到该事件后不回复
    pub(crate) fn hold_event(&self, event: &str) {
        self.state.lock().held_events.insert(event.to_string());
    }

    pub(crate) fn ignore_heartbeats(&self, ignore: bool) {
        self.state.lock().ignore_heartbeats = ignore;
    }

    /// 接下来 n 条消息照常入库，但不回 ACK
    pub(crate) fn drop_next_acks(&self, n: u32) {
        self.state.lock().drop_acks = n;
    }

    /// 服务端主动断开所有连接
    pub(crate) fn drop_connections(&self) {
        let live = std::mem::take(&mut self.state.lock().live);
        for conn in live.values() {
            conn.cancel.cancel();
        }
    }

    pub(crate) fn send_raw(&self, text: &str) {
        for conn in self.state.lock().live.values() {
            let _ = conn.sender.send_raw(text.to_string());
        }
    }

    pub(crate) fn broadcast(&self, topic: &str, event: &str, payload: Value) {
        self.state.lock().broadcast(topic, event, payload);
    }

    // ---------- 数据 ----------

    /// 其他用户发来一条消息：入库并推送给接收方
    pub(crate) fn deliver(&self, sender_id: &str, receiver_id: &str, text: &str) -> RemoteMessage {
        let mut state = self.state.lock();
        let message = state.create_message(sender_id, receiver_id, text);
        state.broadcast(
            &user_topic(receiver_id),
            events::MESSAGE_NEW,
            json!({ "message": message }),
        );
        message
    }

    /// 只入库不推送（离线期间产生的消息）
    pub(crate) fn seed(&self, sender_id: &str, receiver_id: &str, text: &str) -> RemoteMessage {
        self.state.lock().create_message(sender_id, receiver_id, text)
    }

    /// 模拟用户在另一台设备上全部已读：受影响的消息共用同一个 `updated_at`
    pub(crate) fn read_all_elsewhere(&self, user_id: &str) -> i64 {
        let mut state = self.state.lock();
        state.mark_read_where(|m| m.receiver_id == user_id);
        state.clock
    }

    pub(crate) fn withdraw(&self, id: &str) -> Option<i64> {
        self.state.lock().withdraw(id, None)
    }

    pub(crate) fn stored_messages(&self) -> Vec<RemoteMessage> {
        self.state.lock().messages.clone()
    }

    pub(crate) fn pushes(&self, event: &str) -> Vec<Value> {
        self.state
            .lock()
            .pushes
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    // ---------- 统计 ----------

    pub(crate) fn join_log(&self) -> Vec<(u32, String)> {
        self.state.lock().join_log.clone()
    }

    pub(crate) fn connection_count(&self) -> u32 {
        self.state.lock().connections
    }

    pub(crate) fn rejected_count(&self) -> u32 {
        self.state.lock().rejected
    }
}

impl ServerState {
    fn create_message(&mut self, sender_id: &str, receiver_id: &str, text: &str) -> RemoteMessage {
        let ts = self.next_ts();
        let message = RemoteMessage {
            id: format!("m{}", self.messages.len() + 1),
            client_id: None,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: MessageContent::text(text),
            status: None,
            created_at: ts,
            updated_at: ts,
            sender: None,
        };
        self.messages.push(message.clone());
        message
    }
}

async fn accept_loop(state: Arc<Mutex<ServerState>>, mut listener: MemoryListener) {
    while let Some(pending) = listener.accept().await {
        let rejection = {
            let mut state = state.lock();
            let rejection = state.handshake_error.clone();
            if rejection.is_some() {
                state.rejected += 1;
            }
            rejection
        };
        if let Some(error) = rejection {
            pending.reject(error);
            continue;
        }

        let conn = pending.accept();
        let cancel = CancellationToken::new();
        let conn_id = {
            let mut state = state.lock();
            state.connections += 1;
            let conn_id = state.connections;
            state.live.insert(
                conn_id,
                LiveConnection {
                    sender: conn.sender(),
                    topics: Vec::new(),
                    cancel: cancel.clone(),
                },
            );
            conn_id
        };
        tokio::spawn(serve(state.clone(), conn_id, conn, cancel));
    }
}

async fn serve(state: Arc<Mutex<ServerState>>, conn_id: u32, mut conn: ServerConnection, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = conn.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let Ok(frame) = frame else { continue };

        let reply = state.lock().handle(conn_id, &conn.user_id, frame);
        if let Some(reply) = reply {
            if conn.send(&reply).is_err() {
                break;
            }
        }
    }
    state.lock().live.remove(&conn_id);
}

/// 轮询直到条件成立，5 秒未成立则 panic
pub(crate) async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("等待超时: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 一个用户的存储 + 通道，连到同一个 [`FakeServer`]
pub(crate) struct TestBed {
    pub dir: tempfile::TempDir,
    pub server: FakeServer,
    pub user_id: String,
    pub storage: Arc<StorageManager>,
    pub channel: ChannelClient,
    pub events: Arc<EventManager>,
    pub cancel: CancellationToken,
}

impl TestBed {
    pub(crate) async fn new(user_id: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = FakeServer::start();
        let storage = Arc::new(StorageManager::open(dir.path(), user_id).await.expect("open storage"));
        let events = Arc::new(EventManager::new(256));
        let cancel = CancellationToken::new();
        let channel = ChannelClient::new(
            test_channel_config(),
            Arc::new(server.transport()),
            Arc::new(StaticCredentials::new(Credentials::new(user_id, "token"))),
            events.clone(),
            cancel.clone(),
        );
        Self {
            dir,
            server,
            user_id: user_id.to_string(),
            storage,
            channel,
            events,
            cancel,
        }
    }

    pub(crate) async fn go_online(&self) {
        self.channel.connect().await.expect("connect");
        self.channel.join(&user_topic(&self.user_id)).await.expect("join");
    }
}
