//! 数据库 Actor - 单线程写入模型
//!
//! - 写连接只存在于一个专用线程中，所有写操作通过 channel 发送命令
//! - 每条命令都携带 uid，只能作用于该用户已打开的库
//! - 每条写命令在一个事务内完成，提交成功后广播 [`StoreChange`]

use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::thread;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use crate::error::{LinkchatSDKError, Result};
use crate::storage::dao::{ConversationDao, MessageDao};
use crate::storage::entities::{Message, ReconcileOutcome, RemoteMessage, SendAck};
use crate::storage::migrate;
use crate::storage::reconcile::{self, ReadChange};

/// 一次已提交写入影响到的会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub conversation_ids: Vec<String>,
}

impl StoreChange {
    pub fn touches(&self, conversation_id: &str) -> bool {
        self.conversation_ids.iter().any(|id| id == conversation_id)
    }
}

type Respond<T> = oneshot::Sender<Result<T>>;

/// 数据库命令
pub enum DbCommand {
    /// 打开（并迁移）用户数据库
    InitUser {
        uid: String,
        db_path: PathBuf,
        respond_to: Respond<()>,
    },
    CloseUser {
        uid: String,
        respond_to: Respond<()>,
    },
    /// 写入本地发送的消息（client_id 幂等）
    InsertOutgoing {
        uid: String,
        draft: Message,
        now: i64,
        respond_to: Respond<(ReconcileOutcome, Message)>,
    },
    ApplyAck {
        uid: String,
        ack: SendAck,
        respond_to: Respond<Option<(ReconcileOutcome, Message)>>,
    },
    RecordSendFailure {
        uid: String,
        client_id: String,
        error: String,
        respond_to: Respond<Option<Message>>,
    },
    /// 合并一批服务端消息：整批一个事务
    ApplyRemoteBatch {
        uid: String,
        messages: Vec<RemoteMessage>,
        now: i64,
        respond_to: Respond<Vec<(ReconcileOutcome, Message)>>,
    },
    MarkRead {
        uid: String,
        ids: Vec<String>,
        respond_to: Respond<ReadChange>,
    },
    MarkConversationRead {
        uid: String,
        conversation_id: String,
        respond_to: Respond<ReadChange>,
    },
    MarkAllRead {
        uid: String,
        respond_to: Respond<ReadChange>,
    },
    Withdraw {
        uid: String,
        id: String,
        updated_at: i64,
        respond_to: Respond<Option<Message>>,
    },
    CancelSend {
        uid: String,
        client_id: String,
        respond_to: Respond<Option<Message>>,
    },
    DeleteConversation {
        uid: String,
        conversation_id: String,
        respond_to: Respond<bool>,
    },
    Shutdown,
}

struct DbActor {
    /// 已打开的用户库（uid -> 写连接）
    connections: HashMap<String, Connection>,
    receiver: Receiver<DbCommand>,
    changes: broadcast::Sender<StoreChange>,
    thread_id: thread::ThreadId,
}

impl DbActor {
    fn new(receiver: Receiver<DbCommand>, changes: broadcast::Sender<StoreChange>) -> Self {
        let thread_id = thread::current().id();
        info!("🚀 [Thread {:?}] DbActor 已启动", thread_id);
        Self {
            connections: HashMap::new(),
            receiver,
            changes,
            thread_id,
        }
    }

    fn run(mut self) {
        while let Ok(command) = self.receiver.recv() {
            match command {
                DbCommand::Shutdown => {
                    info!("🛑 [Thread {:?}] DbActor 收到停止信号", self.thread_id);
                    break;
                }
                DbCommand::InitUser {
                    uid,
                    db_path,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_init_user(&uid, &db_path));
                }
                DbCommand::CloseUser { uid, respond_to } => {
                    let _ = respond_to.send(self.handle_close_user(&uid));
                }
                DbCommand::InsertOutgoing {
                    uid,
                    draft,
                    now,
                    respond_to,
                } => {
                    let result = self.write(&uid, |conn| {
                        reconcile::insert_outgoing(conn, &uid, &draft, now)
                    });
                    if let Ok((ReconcileOutcome::Inserted, message)) = &result {
                        self.notify(vec![message.conversation_id.clone()]);
                    }
                    let _ = respond_to.send(result);
                }
                DbCommand::ApplyAck {
                    uid,
                    ack,
                    respond_to,
                } => {
                    let result = self.write(&uid, |conn| reconcile::apply_ack(conn, &uid, &ack));
                    if let Ok(Some((ReconcileOutcome::Updated, message))) = &result {
                        self.notify(vec![message.conversation_id.clone()]);
                    }
                    let _ = respond_to.send(result);
                }
                DbCommand::RecordSendFailure {
                    uid,
                    client_id,
                    error,
                    respond_to,
                } => {
                    let result = self.write(&uid, |conn| {
                        let messages = MessageDao::new(conn);
                        messages.record_send_failure(&client_id, &error)?;
                        messages.get_by_client_id(&client_id)
                    });
                    if let Ok(Some(message)) = &result {
                        self.notify(vec![message.conversation_id.clone()]);
                    }
                    let _ = respond_to.send(result);
                }
                DbCommand::ApplyRemoteBatch {
                    uid,
                    messages,
                    now,
                    respond_to,
                } => {
                    let result = self.write(&uid, |conn| {
                        let mut applied = Vec::with_capacity(messages.len());
                        for remote in &messages {
                            if let Some(item) = reconcile::apply_remote(conn, &uid, remote, now)? {
                                applied.push(item);
                            }
                        }
                        Ok(applied)
                    });
                    if let Ok(applied) = &result {
                        let mut touched: Vec<String> = Vec::new();
                        for (outcome, message) in applied {
                            if *outcome != ReconcileOutcome::Unchanged
                                && !touched.contains(&message.conversation_id)
                            {
                                touched.push(message.conversation_id.clone());
                            }
                        }
                        self.notify(touched);
                    }
                    let _ = respond_to.send(result);
                }
                DbCommand::MarkRead {
                    uid,
                    ids,
                    respond_to,
                } => {
                    let result = self.write(&uid, |conn| reconcile::mark_read(conn, &uid, &ids));
                    self.notify_read(&result);
                    let _ = respond_to.send(result);
                }
                DbCommand::MarkConversationRead {
                    uid,
                    conversation_id,
                    respond_to,
                } => {
                    let result = self.write(&uid, |conn| {
                        reconcile::mark_conversation_read(conn, &uid, &conversation_id)
                    });
                    self.notify_read(&result);
                    let _ = respond_to.send(result);
                }
                DbCommand::MarkAllRead { uid, respond_to } => {
                    let result = self.write(&uid, |conn| reconcile::mark_all_read(conn, &uid));
                    self.notify_read(&result);
                    let _ = respond_to.send(result);
                }
                DbCommand::Withdraw {
                    uid,
                    id,
                    updated_at,
                    respond_to,
                } => {
                    let result =
                        self.write(&uid, |conn| reconcile::withdraw(conn, &uid, &id, updated_at));
                    if let Ok(Some(message)) = &result {
                        self.notify(vec![message.conversation_id.clone()]);
                    }
                    let _ = respond_to.send(result);
                }
                DbCommand::CancelSend {
                    uid,
                    client_id,
                    respond_to,
                } => {
                    let result =
                        self.write(&uid, |conn| reconcile::cancel_send(conn, &uid, &client_id));
                    if let Ok(Some(message)) = &result {
                        self.notify(vec![message.conversation_id.clone()]);
                    }
                    let _ = respond_to.send(result);
                }
                DbCommand::DeleteConversation {
                    uid,
                    conversation_id,
                    respond_to,
                } => {
                    let result = self.write(&uid, |conn| {
                        Ok(ConversationDao::new(conn).delete(&conversation_id)? > 0)
                    });
                    if let Ok(true) = result {
                        self.notify(vec![conversation_id]);
                    }
                    let _ = respond_to.send(result);
                }
            }
        }

        self.connections.clear();
        info!("✅ [Thread {:?}] DbActor 已停止", self.thread_id);
    }

    fn connection_mut(&mut self, uid: &str) -> Result<&mut Connection> {
        if !self.connections.contains_key(uid) {
            return Err(match self.connections.keys().next() {
                Some(expected) => LinkchatSDKError::SessionMismatch {
                    expected: expected.clone(),
                    actual: uid.to_string(),
                },
                None => LinkchatSDKError::NoSession,
            });
        }
        self.connections
            .get_mut(uid)
            .ok_or(LinkchatSDKError::NoSession)
    }

    /// 在用户库上开启事务执行 `f`，成功才提交
    fn write<T>(&mut self, uid: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection_mut(uid)?;
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                error!("❌ [DbActor] 事务回滚: uid={}, error={}", uid, e);
                Err(e)
            }
        }
    }

    fn notify(&self, conversation_ids: Vec<String>) {
        if conversation_ids.is_empty() {
            return;
        }
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.changes.send(StoreChange { conversation_ids });
    }

    fn notify_read(&self, result: &Result<ReadChange>) {
        if let Ok(change) = result {
            self.notify(change.conversations.iter().map(|c| c.id.clone()).collect());
        }
    }

    fn handle_init_user(&mut self, uid: &str, db_path: &PathBuf) -> Result<()> {
        if self.connections.contains_key(uid) {
            debug!("[DbActor] 用户库已打开，跳过: uid={}", uid);
            return Ok(());
        }
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(db_path)?;
        migrate::init_db(&mut conn)?;
        info!(
            "✅ [Thread {:?}] 用户库已打开: uid={}, path={}",
            self.thread_id,
            uid,
            db_path.display()
        );
        self.connections.insert(uid.to_string(), conn);
        Ok(())
    }

    fn handle_close_user(&mut self, uid: &str) -> Result<()> {
        if self.connections.remove(uid).is_some() {
            info!("✅ [Thread {:?}] 已关闭用户库: uid={}", self.thread_id, uid);
        }
        Ok(())
    }
}

/// 数据库 Actor 句柄（用于异步调用）
#[derive(Clone)]
pub struct DbActorHandle {
    sender: Sender<DbCommand>,
}

impl std::fmt::Debug for DbActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbActorHandle")
            .field("sender", &"<channel>")
            .finish()
    }
}

impl DbActorHandle {
    /// 启动 DB Actor 线程
    pub fn spawn(changes: broadcast::Sender<StoreChange>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        thread::Builder::new()
            .name("db-actor".to_string())
            .spawn(move || DbActor::new(receiver, changes).run())
            .map_err(|e| LinkchatSDKError::IO(format!("无法启动 DB Actor 线程: {}", e)))?;
        Ok(Self { sender })
    }

    async fn request<T>(&self, build: impl FnOnce(Respond<T>) -> DbCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| LinkchatSDKError::ShuttingDown("DB Actor 已停止".to_string()))?;
        rx.await
            .map_err(|_| LinkchatSDKError::ShuttingDown("DB Actor 响应失败".to_string()))?
    }

    pub async fn init_user(&self, uid: String, db_path: PathBuf) -> Result<()> {
        self.request(|respond_to| DbCommand::InitUser {
            uid,
            db_path,
            respond_to,
        })
        .await
    }

    pub async fn close_user(&self, uid: String) -> Result<()> {
        self.request(|respond_to| DbCommand::CloseUser { uid, respond_to })
            .await
    }

    pub async fn insert_outgoing(
        &self,
        uid: String,
        draft: Message,
        now: i64,
    ) -> Result<(ReconcileOutcome, Message)> {
        self.request(|respond_to| DbCommand::InsertOutgoing {
            uid,
            draft,
            now,
            respond_to,
        })
        .await
    }

    pub async fn apply_ack(
        &self,
        uid: String,
        ack: SendAck,
    ) -> Result<Option<(ReconcileOutcome, Message)>> {
        self.request(|respond_to| DbCommand::ApplyAck {
            uid,
            ack,
            respond_to,
        })
        .await
    }

    pub async fn record_send_failure(
        &self,
        uid: String,
        client_id: String,
        error: String,
    ) -> Result<Option<Message>> {
        self.request(|respond_to| DbCommand::RecordSendFailure {
            uid,
            client_id,
            error,
            respond_to,
        })
        .await
    }

    pub async fn apply_remote_batch(
        &self,
        uid: String,
        messages: Vec<RemoteMessage>,
        now: i64,
    ) -> Result<Vec<(ReconcileOutcome, Message)>> {
        self.request(|respond_to| DbCommand::ApplyRemoteBatch {
            uid,
            messages,
            now,
            respond_to,
        })
        .await
    }

    pub async fn mark_read(&self, uid: String, ids: Vec<String>) -> Result<ReadChange> {
        self.request(|respond_to| DbCommand::MarkRead {
            uid,
            ids,
            respond_to,
        })
        .await
    }

    pub async fn mark_conversation_read(
        &self,
        uid: String,
        conversation_id: String,
    ) -> Result<ReadChange> {
        self.request(|respond_to| DbCommand::MarkConversationRead {
            uid,
            conversation_id,
            respond_to,
        })
        .await
    }

    pub async fn mark_all_read(&self, uid: String) -> Result<ReadChange> {
        self.request(|respond_to| DbCommand::MarkAllRead { uid, respond_to })
            .await
    }

    pub async fn withdraw(&self, uid: String, id: String, updated_at: i64) -> Result<Option<Message>> {
        self.request(|respond_to| DbCommand::Withdraw {
            uid,
            id,
            updated_at,
            respond_to,
        })
        .await
    }

    pub async fn cancel_send(&self, uid: String, client_id: String) -> Result<Option<Message>> {
        self.request(|respond_to| DbCommand::CancelSend {
            uid,
            client_id,
            respond_to,
        })
        .await
    }

    pub async fn delete_conversation(&self, uid: String, conversation_id: String) -> Result<bool> {
        self.request(|respond_to| DbCommand::DeleteConversation {
            uid,
            conversation_id,
            respond_to,
        })
        .await
    }

    /// 停止 Actor 线程；之后的命令都会返回 ShuttingDown
    pub fn shutdown(&self) {
        let _ = self.sender.send(DbCommand::Shutdown);
    }
}
