//! 同步游标存储
//!
//! 游标存放在用户 KV 中，键为 `sync_cursor:{uid}`，只前进不后退。
//! 游标是 `(updated_at, id)` 二元组：同一毫秒内更新的多条消息按 id 排序，
//! 分页边界落在同一时间戳中间时也不会漏拉。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::entities::RemoteMessage;
use crate::storage::KvStore;

const CURSOR_KEY_PREFIX: &str = "sync_cursor:";

/// 已合并的最后一条记录的位置，按 `(updated_at, id)` 全序比较
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncCursor {
    pub updated_at: i64,
    pub id: String,
}

impl SyncCursor {
    pub fn new(updated_at: i64, id: impl Into<String>) -> Self {
        Self {
            updated_at,
            id: id.into(),
        }
    }

    pub fn of(message: &RemoteMessage) -> Self {
        Self::new(message.updated_at, message.id.clone())
    }
}

#[derive(Clone)]
pub struct CursorStore {
    kv: KvStore,
    key: String,
    /// 内存缓存；外层 None 表示尚未从 KV 读取
    cache: Arc<RwLock<Option<Option<SyncCursor>>>>,
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore").field("key", &self.key).finish()
    }
}

impl CursorStore {
    pub fn new(kv: KvStore) -> Self {
        let key = format!("{}{}", CURSOR_KEY_PREFIX, kv.uid());
        Self {
            kv,
            key,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// 当前游标；从未同步过返回 None
    pub async fn load(&self) -> Result<Option<SyncCursor>> {
        if let Some(cursor) = self.cache.read().await.clone() {
            return Ok(cursor);
        }
        let cursor: Option<SyncCursor> = self.kv.get(&self.key).await?;
        *self.cache.write().await = Some(cursor.clone());
        Ok(cursor)
    }

    /// 推进游标；不大于当前值的游标被忽略，返回实际生效的游标
    pub async fn advance(&self, cursor: SyncCursor) -> Result<SyncCursor> {
        let current = self.load().await?;
        if let Some(current) = current.as_ref() {
            if cursor <= *current {
                if cursor < *current {
                    warn!("[Sync] 忽略回退的游标: current={:?}, new={:?}", current, cursor);
                }
                return Ok(current.clone());
            }
        }
        self.kv.set(&self.key, &cursor).await?;
        *self.cache.write().await = Some(Some(cursor.clone()));
        debug!("[Sync] 游标已推进: {:?} -> {:?}", current, cursor);
        Ok(cursor)
    }

    /// 清除游标，下次同步从头开始
    pub async fn reset(&self) -> Result<()> {
        self.kv.delete(&self.key).await?;
        *self.cache.write().await = Some(None);
        Ok(())
    }
}
