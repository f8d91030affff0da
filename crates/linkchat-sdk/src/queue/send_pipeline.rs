//! 消息发送管道
//!
//! `send` 先把消息以 Sending 状态写入本地库并立即返回，随后由唯一的后台 worker
//! 按 FIFO 顺序推送到服务端：
//!
//! - ACK 按 client_id 对账，写入服务端 ID 与时间戳，状态变为 Sent；
//! - 失败保持 Sending，累计 `send_attempts` 并记录错误；瞬时错误按 [`RetryPolicy`]
//!   延迟重试，认证失败或被服务端拒绝的不自动重试；
//! - 通道未处于 Joined 时任务挂起，不计入尝试次数；每次进入 Joined 都会把库里所有
//!   Sending 消息按 `order_seq` 重新排队。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry_policy::{RetryPolicy, SendFailureReason};
use crate::channel::ChannelClient;
use crate::connection_state::{ConnectionState, ConnectionStatus};
use crate::error::{LinkchatSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::message_type::MessageContent;
use crate::storage::entities::{conversation_id, Message, MessageStatus, SendAck};
use crate::storage::StorageManager;
use crate::transport::frame::{events, user_topic};
use crate::utils::now_millis;

/// 发送统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendMetrics {
    pub send_attempt_total: u64,
    pub send_success_total: u64,
    pub send_failure_total: u64,
    pub retry_scheduled_total: u64,
}

impl SendMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.send_attempt_total == 0 {
            0.0
        } else {
            self.send_success_total as f64 / self.send_attempt_total as f64
        }
    }
}

enum SendCommand {
    Enqueue(String),
    Cancel(String),
    Flush,
}

struct Shared {
    self_id: String,
    storage: Arc<StorageManager>,
    channel: ChannelClient,
    events: Arc<EventManager>,
    retry: RetryPolicy,
    metrics: Mutex<SendMetrics>,
}

/// 发送管道句柄（可克隆）
#[derive(Clone)]
pub struct SendPipeline {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<SendCommand>,
}

impl std::fmt::Debug for SendPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline")
            .field("self_id", &self.shared.self_id)
            .field("metrics", &*self.shared.metrics.lock())
            .finish()
    }
}

impl SendPipeline {
    /// 创建管道并启动后台 worker；`cancel` 被取消时 worker 退出
    pub fn spawn(
        self_id: String,
        storage: Arc<StorageManager>,
        channel: ChannelClient,
        events: Arc<EventManager>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let state = channel.watch_state();
        let joined = state.borrow().status == ConnectionStatus::Joined;
        let shared = Arc::new(Shared {
            self_id,
            storage,
            channel,
            events,
            retry,
            metrics: Mutex::new(SendMetrics::default()),
        });

        let worker = SendWorker {
            shared: shared.clone(),
            commands: commands_rx,
            state,
            queue: VecDeque::new(),
            retries: DelayQueue::new(),
            scheduled: HashMap::new(),
            joined,
            cancel,
        };
        tokio::spawn(worker.run());

        Self { shared, commands }
    }

    /// 发送消息：写入本地（Sending）后立即返回，实际发送在后台完成
    pub async fn send(&self, receiver_id: &str, content: MessageContent) -> Result<Message> {
        let self_id = &self.shared.self_id;
        if receiver_id.trim().is_empty() {
            return Err(LinkchatSDKError::InvalidArgument("receiver_id 不能为空".to_string()));
        }
        if receiver_id == self_id {
            return Err(LinkchatSDKError::InvalidArgument("不能给自己发送消息".to_string()));
        }

        let now = now_millis();
        let draft = Message {
            id: None,
            client_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id(self_id, receiver_id),
            sender_id: self_id.clone(),
            receiver_id: receiver_id.to_string(),
            content,
            status: MessageStatus::Sending,
            created_at: now,
            updated_at: now,
            send_attempts: 0,
            last_error: None,
            order_seq: 0,
        };
        let (_, message) = self.shared.storage.insert_outgoing(draft, now).await?;
        debug!(
            "[SendPipeline] 📝 消息已写入本地: client_id={}, order_seq={}",
            message.client_id, message.order_seq
        );

        self.submit(SendCommand::Enqueue(message.client_id.clone()))?;
        Ok(message)
    }

    /// 手动重试：同一个 client_id 重新排队
    pub async fn retry(&self, client_id: &str) -> Result<Message> {
        let message = self
            .shared
            .storage
            .get_message(client_id)
            .await?
            .ok_or_else(|| LinkchatSDKError::NotFound(format!("消息不存在: {}", client_id)))?;
        if !message.is_sending() {
            return Err(LinkchatSDKError::InvalidOperation(format!(
                "消息状态为 {}，无需重发",
                message.status
            )));
        }
        info!("[SendPipeline] 🔁 手动重发: client_id={}", message.client_id);
        self.submit(SendCommand::Enqueue(message.client_id.clone()))?;
        Ok(message)
    }

    /// 取消仍在发送中的消息（本地标记为删除，worker 跳过）
    pub async fn cancel(&self, client_id: &str) -> Result<Message> {
        let message = self
            .shared
            .storage
            .cancel_send(client_id)
            .await?
            .ok_or_else(|| LinkchatSDKError::NotFound(format!("消息不存在: {}", client_id)))?;
        info!("[SendPipeline] 🚫 已取消发送: client_id={}", message.client_id);
        self.submit(SendCommand::Cancel(message.client_id.clone()))?;
        Ok(message)
    }

    /// 撤回已发送的消息（需要在线）
    pub async fn withdraw(&self, id: &str) -> Result<Message> {
        let message = self
            .shared
            .storage
            .get_message(id)
            .await?
            .ok_or_else(|| LinkchatSDKError::NotFound(format!("消息不存在: {}", id)))?;
        let server_id = match (&message.id, message.sender_id == self.shared.self_id) {
            (Some(server_id), true) => server_id.clone(),
            (None, _) => {
                return Err(LinkchatSDKError::InvalidOperation(
                    "消息尚未送达，请使用取消发送".to_string(),
                ))
            }
            (_, false) => {
                return Err(LinkchatSDKError::InvalidOperation(
                    "只能撤回自己发送的消息".to_string(),
                ))
            }
        };

        let reply = self
            .shared
            .channel
            .push(
                &user_topic(&self.shared.self_id),
                events::MESSAGE_WITHDRAW,
                json!({ "id": server_id }),
            )
            .await?;
        let updated_at = reply["updated_at"].as_i64().unwrap_or_else(now_millis);

        let withdrawn = self
            .shared
            .storage
            .withdraw(&server_id, updated_at)
            .await?
            .ok_or_else(|| LinkchatSDKError::NotFound(format!("消息不存在: {}", server_id)))?;
        info!("[SendPipeline] ↩️ 消息已撤回: id={}", server_id);
        self.shared
            .events
            .emit(SDKEvent::MessageWithdrawn {
                message_id: server_id,
                conversation_id: withdrawn.conversation_id.clone(),
                timestamp: now_millis(),
            })
            .await;
        Ok(withdrawn)
    }

    /// 把所有 Sending 消息重新排队
    pub fn flush(&self) -> Result<()> {
        self.submit(SendCommand::Flush)
    }

    pub fn metrics(&self) -> SendMetrics {
        self.shared.metrics.lock().clone()
    }

    fn submit(&self, command: SendCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| LinkchatSDKError::ShuttingDown("发送队列已停止".to_string()))
    }
}

/// 后台 worker：串行处理队列，保证派发顺序
struct SendWorker {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<SendCommand>,
    state: watch::Receiver<ConnectionState>,
    queue: VecDeque<String>,
    retries: DelayQueue<String>,
    scheduled: HashMap<String, delay_queue::Key>,
    joined: bool,
    cancel: CancellationToken,
}

impl SendWorker {
    async fn run(mut self) {
        info!("[SendPipeline] 🚀 发送 worker 已启动: uid={}", self.shared.self_id);
        loop {
            if self.joined {
                if let Some(client_id) = self.queue.pop_front() {
                    let cancel = self.cancel.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.dispatch(client_id) => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(expired) = self.retries.next(), if !self.retries.is_empty() => {
                    let client_id = expired.into_inner();
                    self.scheduled.remove(&client_id);
                    debug!("[SendPipeline] ⏰ 重试时间到: client_id={}", client_id);
                    self.enqueue(client_id);
                }
                changed = self.state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = self.state.borrow_and_update().status;
                    let was_joined = self.joined;
                    self.joined = status == ConnectionStatus::Joined;
                    if self.joined && !was_joined {
                        self.flush().await;
                    }
                }
            }
        }
        info!("[SendPipeline] 发送 worker 已退出: uid={}", self.shared.self_id);
    }

    async fn handle_command(&mut self, command: SendCommand) {
        match command {
            SendCommand::Enqueue(client_id) => self.enqueue(client_id),
            SendCommand::Cancel(client_id) => {
                self.queue.retain(|queued| *queued != client_id);
                if let Some(key) = self.scheduled.remove(&client_id) {
                    self.retries.remove(&key);
                }
            }
            SendCommand::Flush => self.flush().await,
        }
    }

    fn enqueue(&mut self, client_id: String) {
        if let Some(key) = self.scheduled.remove(&client_id) {
            self.retries.remove(&key);
        }
        if !self.queue.contains(&client_id) {
            self.queue.push_back(client_id);
        }
        if !self.joined {
            debug!("[SendPipeline] 通道未就绪，任务挂起: 队列长度={}", self.queue.len());
        }
    }

    /// 按 order_seq 重新装载所有 Sending 消息
    async fn flush(&mut self) {
        match self.shared.storage.list_sending().await {
            Ok(pending) => {
                self.queue.clear();
                self.retries.clear();
                self.scheduled.clear();
                self.queue.extend(pending.into_iter().map(|m| m.client_id));
                if !self.queue.is_empty() {
                    info!("[SendPipeline] 🔁 重新排队 {} 条待发送消息", self.queue.len());
                }
            }
            Err(e) => error!("[SendPipeline] 读取待发送消息失败: {}", e),
        }
    }

    async fn dispatch(&mut self, client_id: String) {
        let message = match self.shared.storage.get_message(&client_id).await {
            Ok(Some(message)) if message.is_sending() => message,
            Ok(_) => {
                debug!("[SendPipeline] 跳过不再处于发送中的消息: {}", client_id);
                return;
            }
            Err(e) => {
                error!("[SendPipeline] 读取消息失败: client_id={}, error={}", client_id, e);
                return;
            }
        };

        match self.send_once(&message).await {
            Ok(ack) => self.on_ack(&message, ack).await,
            // 排队期间连接已断开：放回队首，等待重新加入
            Err(LinkchatSDKError::NotConnected) | Err(LinkchatSDKError::InvalidOperation(_)) => {
                debug!("[SendPipeline] 通道不可用，任务挂起: {}", client_id);
                self.queue.push_front(client_id);
                self.joined = false;
            }
            Err(e) => self.on_failure(&message, e).await,
        }
    }

    async fn send_once(&self, message: &Message) -> Result<SendAck> {
        let payload = json!({
            "client_id": message.client_id,
            "receiver_id": message.receiver_id,
            "content": serde_json::to_value(&message.content)?,
            "created_at": message.created_at,
        });
        let topic = user_topic(&self.shared.self_id);
        if !self.shared.channel.is_joined(&topic) {
            return Err(LinkchatSDKError::NotConnected);
        }

        self.shared.metrics.lock().send_attempt_total += 1;
        let reply = self
            .shared
            .channel
            .push(&topic, events::MESSAGE_SEND, payload)
            .await?;
        let ack: SendAck = serde_json::from_value(reply)
            .map_err(|e| LinkchatSDKError::Protocol(format!("无法解析发送回执: {}", e)))?;
        if ack.client_id != message.client_id {
            return Err(LinkchatSDKError::Protocol(format!(
                "发送回执 client_id 不匹配: expected={}, actual={}",
                message.client_id, ack.client_id
            )));
        }
        Ok(ack)
    }

    async fn on_ack(&mut self, message: &Message, ack: SendAck) {
        match self.shared.storage.apply_ack(ack).await {
            Ok(Some((_, stored))) => {
                self.shared.metrics.lock().send_success_total += 1;
                info!(
                    "[SendPipeline] ✅ 消息已送达: client_id={}, id={}",
                    stored.client_id,
                    stored.reference_id()
                );
                self.shared
                    .events
                    .emit(SDKEvent::MessageSent {
                        client_id: stored.client_id.clone(),
                        message_id: stored.reference_id().to_string(),
                        conversation_id: stored.conversation_id.clone(),
                        timestamp: now_millis(),
                    })
                    .await;
            }
            Ok(None) => warn!(
                "[SendPipeline] 收到 ACK 但本地消息已不存在: client_id={}",
                message.client_id
            ),
            Err(e) => error!(
                "[SendPipeline] ❌ 写入 ACK 失败: client_id={}, error={}",
                message.client_id, e
            ),
        }
    }

    async fn on_failure(&mut self, message: &Message, error: LinkchatSDKError) {
        self.shared.metrics.lock().send_failure_total += 1;
        let reason = SendFailureReason::from(&error);
        let attempts = match self
            .shared
            .storage
            .record_send_failure(&message.client_id, &error.to_string())
            .await
        {
            Ok(Some(updated)) => updated.send_attempts,
            // 失败期间被取消或已被同步确认
            Ok(None) => return,
            Err(e) => {
                error!("[SendPipeline] 记录发送失败出错: {}", e);
                message.send_attempts + 1
            }
        };

        let delay = self.shared.retry.next_delay(attempts.saturating_sub(1), &reason);
        match delay {
            Some(delay) => {
                warn!(
                    "[SendPipeline] ⚠️ 发送失败，{}ms 后重试: client_id={}, attempts={}, error={}",
                    delay.as_millis(),
                    message.client_id,
                    attempts,
                    error
                );
                let key = self.retries.insert(message.client_id.clone(), delay);
                self.scheduled.insert(message.client_id.clone(), key);
                self.shared.metrics.lock().retry_scheduled_total += 1;
            }
            None => error!(
                "[SendPipeline] ❌ 发送失败，不再自动重试: client_id={}, attempts={}, reason={:?}",
                message.client_id, attempts, reason
            ),
        }

        self.shared
            .events
            .emit(SDKEvent::MessageSendFailed {
                client_id: message.client_id.clone(),
                conversation_id: message.conversation_id.clone(),
                error: error.to_string(),
                attempts,
                will_retry: delay.is_some(),
                timestamp: now_millis(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{ConversationRef, MessagePage};
    use crate::testing::{eventually, test_config, TestBed};

    struct Harness {
        bed: TestBed,
        pipeline: SendPipeline,
    }

    impl std::ops::Deref for Harness {
        type Target = TestBed;

        fn deref(&self) -> &TestBed {
            &self.bed
        }
    }

    async fn harness() -> Harness {
        let bed = TestBed::new("alice").await;
        let pipeline = SendPipeline::spawn(
            "alice".to_string(),
            bed.storage.clone(),
            bed.channel.clone(),
            bed.events.clone(),
            test_config(bed.dir.path()).retry,
            bed.cancel.clone(),
        );
        Harness { bed, pipeline }
    }

    impl Harness {
        async fn wait_status(&self, client_id: &str, status: MessageStatus) -> Message {
            let storage = &self.storage;
            eventually(&format!("{} -> {}", client_id, status), || async move {
                storage
                    .get_message(client_id)
                    .await
                    .unwrap()
                    .map_or(false, |m| m.status == status)
            })
            .await;
            self.storage.get_message(client_id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_send_returns_immediately_then_acks() {
        let h = harness().await;
        h.go_online().await;
        let mut rx = h.events.subscribe();

        let local = h.pipeline.send("bob", MessageContent::text("hi")).await.unwrap();
        assert_eq!(local.status, MessageStatus::Sending);
        assert_eq!(local.send_attempts, 0);
        assert!(local.id.is_none());

        let sent = h.wait_status(&local.client_id, MessageStatus::Sent).await;
        assert_eq!(sent.client_id, local.client_id);
        assert_eq!(sent.id.as_deref(), Some("m1"));
        assert_eq!(sent.order_seq, local.order_seq);

        let conversation = h
            .storage
            .get_conversation(ConversationRef::Participant("bob".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.last_message_id.as_deref(), Some("m1"));

        let mut saw_sent = false;
        while let Ok(event) = rx.try_recv() {
            if let SDKEvent::MessageSent { client_id, message_id, .. } = event {
                assert_eq!(client_id, local.client_id);
                assert_eq!(message_id, "m1");
                saw_sent = true;
            }
        }
        assert!(saw_sent);
        assert_eq!(h.pipeline.metrics().send_success_total, 1);
    }

    #[tokio::test]
    async fn test_offline_send_delivered_after_reconnect() {
        let h = harness().await;
        h.go_online().await;

        h.server.reject_handshakes(LinkchatSDKError::Network("offline".into()));
        h.server.drop_connections();
        let channel = &h.channel;
        eventually("进入 ConnectionError", || async move {
            channel.status() == ConnectionStatus::ConnectionError
        })
        .await;

        let local = h.pipeline.send("bob", MessageContent::text("offline")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let parked = h.storage.get_message(&local.client_id).await.unwrap().unwrap();
        assert_eq!(parked.status, MessageStatus::Sending);
        assert_eq!(parked.send_attempts, 0);
        assert!(h.server.pushes(events::MESSAGE_SEND).is_empty());

        h.server.accept_handshakes();
        h.channel.reconnect().await.unwrap();

        let sent = h.wait_status(&local.client_id, MessageStatus::Sent).await;
        let conversation = h
            .storage
            .get_conversation(ConversationRef::Id(sent.conversation_id.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.last_message_id, sent.id);
    }

    #[tokio::test]
    async fn test_lost_ack_retry_does_not_duplicate() {
        let h = harness().await;
        h.go_online().await;
        h.server.drop_next_acks(1);

        let local = h.pipeline.send("bob", MessageContent::text("once")).await.unwrap();
        let sent = h.wait_status(&local.client_id, MessageStatus::Sent).await;

        assert_eq!(sent.send_attempts, 1);
        assert_eq!(h.server.stored_messages().len(), 1);
        assert_eq!(h.server.pushes(events::MESSAGE_SEND).len(), 2);
        let listed = h
            .storage
            .list_messages(&sent.conversation_id, MessagePage::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_send_is_not_auto_retried() {
        let h = harness().await;
        h.go_online().await;
        h.server.reject_event(events::MESSAGE_SEND);
        let mut rx = h.events.subscribe();

        let local = h.pipeline.send("bob", MessageContent::text("nope")).await.unwrap();
        let storage = &h.storage;
        let client_id = local.client_id.as_str();
        eventually("记录失败", || async move {
            storage
                .get_message(client_id)
                .await
                .unwrap()
                .map_or(false, |m| m.send_attempts == 1)
        })
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let failed = h.storage.get_message(client_id).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Sending);
        assert_eq!(failed.send_attempts, 1);
        assert!(failed.last_error.is_some());
        assert_eq!(h.server.pushes(events::MESSAGE_SEND).len(), 1);

        let mut will_retry = None;
        while let Ok(event) = rx.try_recv() {
            if let SDKEvent::MessageSendFailed { will_retry: retry, .. } = event {
                will_retry = Some(retry);
            }
        }
        assert_eq!(will_retry, Some(false));

        h.server.accept_event(events::MESSAGE_SEND);
        h.pipeline.retry(client_id).await.unwrap();
        h.wait_status(client_id, MessageStatus::Sent).await;
    }

    #[tokio::test]
    async fn test_dispatch_order_follows_issue_order() {
        let h = harness().await;
        let mut sent = Vec::new();
        for text in ["one", "two", "three"] {
            sent.push(h.pipeline.send("bob", MessageContent::text(text)).await.unwrap());
        }
        assert!(sent.windows(2).all(|w| w[0].order_seq < w[1].order_seq));

        h.go_online().await;
        for message in &sent {
            h.wait_status(&message.client_id, MessageStatus::Sent).await;
        }

        let server_texts: Vec<String> = h
            .server
            .stored_messages()
            .iter()
            .map(|m| m.content.preview())
            .collect();
        assert_eq!(server_texts, vec!["one", "two", "three"]);

        let listed = h
            .storage
            .list_messages(&sent[0].conversation_id, MessagePage::default())
            .await
            .unwrap();
        let local_texts: Vec<String> = listed.iter().map(|m| m.content.preview()).collect();
        assert_eq!(local_texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_cancel_skips_queued_message() {
        let h = harness().await;
        let first = h.pipeline.send("bob", MessageContent::text("drop me")).await.unwrap();
        let second = h.pipeline.send("bob", MessageContent::text("keep me")).await.unwrap();

        let cancelled = h.pipeline.cancel(&first.client_id).await.unwrap();
        assert_eq!(cancelled.status, MessageStatus::Deleted);

        h.go_online().await;
        h.wait_status(&second.client_id, MessageStatus::Sent).await;
        assert_eq!(h.server.pushes(events::MESSAGE_SEND).len(), 1);
        assert!(matches!(
            h.pipeline.cancel(&second.client_id).await,
            Err(LinkchatSDKError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_withdraw_sent_message() {
        let h = harness().await;
        h.go_online().await;
        let local = h.pipeline.send("bob", MessageContent::text("oops")).await.unwrap();
        let sent = h.wait_status(&local.client_id, MessageStatus::Sent).await;

        let withdrawn = h.pipeline.withdraw(sent.id.as_deref().unwrap()).await.unwrap();
        assert_eq!(withdrawn.status, MessageStatus::Withdrawn);
        assert_eq!(
            h.server.stored_messages()[0].status,
            Some(MessageStatus::Withdrawn)
        );
    }

    #[tokio::test]
    async fn test_send_validation() {
        let h = harness().await;
        assert!(matches!(
            h.pipeline.send("", MessageContent::text("x")).await,
            Err(LinkchatSDKError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.pipeline.send("alice", MessageContent::text("x")).await,
            Err(LinkchatSDKError::InvalidArgument(_))
        ));
    }
}
