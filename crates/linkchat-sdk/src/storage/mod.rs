//! 本地存储
//!
//! 每个用户一个目录 `{data_dir}/users/{uid}/`：
//! - `messages.db`：SQLite，消息与会话（单写线程 [`DbActorHandle`] + 一个只读连接）
//! - `kv/`：sled，同步游标等少量状态
//!
//! 存储实例绑定到打开它的用户，命令携带的 uid 不一致时直接拒绝。

pub mod dao;
pub mod db_actor;
pub mod entities;
pub mod kv;
pub mod migrate;
pub mod reconcile;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{LinkchatSDKError, Result};
use dao::{ConversationDao, MessageDao};
pub use db_actor::{DbActorHandle, StoreChange};
use entities::{
    Conversation, ConversationRef, Message, MessagePage, ReconcileOutcome, RemoteMessage, SendAck,
};
pub use kv::KvStore;
pub use reconcile::ReadChange;

const DB_FILE: &str = "messages.db";
const CHANGE_CHANNEL_CAPACITY: usize = 256;

pub struct StorageManager {
    uid: String,
    user_dir: PathBuf,
    actor: DbActorHandle,
    reader: Arc<Mutex<Connection>>,
    kv: KvStore,
    changes: broadcast::Sender<StoreChange>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("uid", &self.uid)
            .field("user_dir", &self.user_dir)
            .finish()
    }
}

impl StorageManager {
    /// 打开（必要时创建并迁移）用户的本地库
    pub async fn open(data_dir: &Path, uid: &str) -> Result<Self> {
        if uid.is_empty() {
            return Err(LinkchatSDKError::InvalidArgument("uid 不能为空".to_string()));
        }
        let user_dir = data_dir.join("users").join(uid);
        tokio::fs::create_dir_all(&user_dir).await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let actor = DbActorHandle::spawn(changes.clone())?;
        let db_path = user_dir.join(DB_FILE);
        if let Err(e) = actor.init_user(uid.to_string(), db_path.clone()).await {
            actor.shutdown();
            return Err(e);
        }

        let reader = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(Duration::from_secs(5))?;

        let kv = match KvStore::open(&user_dir, uid).await {
            Ok(kv) => kv,
            Err(e) => {
                actor.shutdown();
                return Err(e);
            }
        };

        info!("📂 [Storage] 用户存储已打开: uid={}, dir={}", uid, user_dir.display());
        Ok(Self {
            uid: uid.to_string(),
            user_dir,
            actor,
            reader: Arc::new(Mutex::new(reader)),
            kv,
            changes,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// 订阅已提交的写入
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// 在只读连接上执行查询（阻塞线程池）
    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || {
            let conn = reader.lock();
            f(&conn)
        })
        .await
        .map_err(|e| LinkchatSDKError::Database(format!("读任务异常: {}", e)))?
    }

    // ========== 查询 ==========

    /// 按服务端 ID 或 client_id 查找消息
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        self.read(move |conn| MessageDao::new(conn).get_by_any_id(&id))
            .await
    }

    pub async fn list_messages(&self, conversation_id: &str, page: MessagePage) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.read(move |conn| MessageDao::new(conn).list_page(&conversation_id, page))
            .await
    }

    /// 所有仍在发送中的消息，按发送顺序
    pub async fn list_sending(&self) -> Result<Vec<Message>> {
        self.read(|conn| MessageDao::new(conn).list_sending()).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.read(|conn| ConversationDao::new(conn).list()).await
    }

    pub async fn get_conversation(&self, by: ConversationRef) -> Result<Option<Conversation>> {
        self.read(move |conn| {
            let dao = ConversationDao::new(conn);
            match by {
                ConversationRef::Id(id) => dao.get(&id),
                ConversationRef::Participant(user_id) => dao.get_by_participant(&user_id),
            }
        })
        .await
    }

    pub async fn total_unread(&self) -> Result<u32> {
        self.read(|conn| ConversationDao::new(conn).total_unread()).await
    }

    // ========== 写入（经由 DbActor） ==========

    pub async fn insert_outgoing(&self, draft: Message, now: i64) -> Result<(ReconcileOutcome, Message)> {
        self.actor.insert_outgoing(self.uid.clone(), draft, now).await
    }

    pub async fn apply_ack(&self, ack: SendAck) -> Result<Option<(ReconcileOutcome, Message)>> {
        self.actor.apply_ack(self.uid.clone(), ack).await
    }

    pub async fn record_send_failure(&self, client_id: &str, error: &str) -> Result<Option<Message>> {
        self.actor
            .record_send_failure(self.uid.clone(), client_id.to_string(), error.to_string())
            .await
    }

    /// 合并一批服务端消息；整批在一个事务内提交
    pub async fn apply_remote_batch(
        &self,
        messages: Vec<RemoteMessage>,
        now: i64,
    ) -> Result<Vec<(ReconcileOutcome, Message)>> {
        self.actor
            .apply_remote_batch(self.uid.clone(), messages, now)
            .await
    }

    pub async fn mark_read(&self, ids: Vec<String>) -> Result<ReadChange> {
        self.actor.mark_read(self.uid.clone(), ids).await
    }

    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<ReadChange> {
        self.actor
            .mark_conversation_read(self.uid.clone(), conversation_id.to_string())
            .await
    }

    pub async fn mark_all_read(&self) -> Result<ReadChange> {
        self.actor.mark_all_read(self.uid.clone()).await
    }

    pub async fn withdraw(&self, id: &str, updated_at: i64) -> Result<Option<Message>> {
        self.actor
            .withdraw(self.uid.clone(), id.to_string(), updated_at)
            .await
    }

    pub async fn cancel_send(&self, client_id: &str) -> Result<Option<Message>> {
        self.actor
            .cancel_send(self.uid.clone(), client_id.to_string())
            .await
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        self.actor
            .delete_conversation(self.uid.clone(), conversation_id.to_string())
            .await
    }

    /// 关闭用户库：刷新 KV，关闭写连接并停止 Actor 线程
    pub async fn close(&self) -> Result<()> {
        self.kv.flush().await?;
        let result = self.actor.close_user(self.uid.clone()).await;
        self.actor.shutdown();
        info!("📁 [Storage] 用户存储已关闭: uid={}", self.uid);
        result
    }
}
