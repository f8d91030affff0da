//! KV 存储 - 基于 sled 的用户级键值存储
//!
//! 保存同步游标等少量状态，值统一以 JSON 编码。凭证不落在这里，由宿主的
//! `CredentialProvider` 负责保管。
//! 每个用户一个 Tree（`user_{uid}`），不会读到其他用户的数据。

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::time::Duration;

use crate::error::{LinkchatSDKError, Result};

/// 切换账号后旧实例可能刚释放文件锁，打开时带退避重试
const MAX_OPEN_RETRIES: u32 = 6;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct KvStore {
    db: Db,
    tree: Tree,
    uid: String,
}

impl KvStore {
    pub async fn open(base_path: &Path, uid: &str) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| LinkchatSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        let mut last_err: Option<sled::Error> = None;
        let mut db = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(opened) => {
                    db = Some(opened);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock") || msg.contains("WouldBlock");
                    if !is_lock || attempt + 1 == MAX_OPEN_RETRIES {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS << attempt)).await;
                }
            }
        }
        let db = db.ok_or_else(|| {
            LinkchatSDKError::KvStore(match last_err {
                Some(e) => format!("打开 sled 数据库失败: {}", e),
                None => "打开 sled 数据库失败".to_string(),
            })
        })?;

        let tree = db
            .open_tree(format!("user_{}", uid))
            .map_err(|e| LinkchatSDKError::KvStore(format!("打开用户 Tree 失败: {}", e)))?;
        tracing::debug!("用户 KV Tree 已打开: {}", uid);

        Ok(Self {
            db,
            tree,
            uid: uid.to_string(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| LinkchatSDKError::Serialization(format!("序列化值失败: {}", e)))?;
        self.tree
            .insert(key, bytes)
            .map_err(|e| LinkchatSDKError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let found = self
            .tree
            .get(key)
            .map_err(|e| LinkchatSDKError::KvStore(format!("获取键值对失败: {}", e)))?;
        match found {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    LinkchatSDKError::Serialization(format!("反序列化值失败: {}", e))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete<K: AsRef<[u8]>>(&self, key: K) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|e| LinkchatSDKError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(())
    }

    /// 落盘，关闭会话前调用
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| LinkchatSDKError::KvStore(format!("刷新 KV 存储失败: {}", e)))?;
        Ok(())
    }

    /// 测试用：导出当前用户 Tree 的全部原始值
    #[cfg(test)]
    pub(crate) fn raw_values(&self) -> Vec<String> {
        self.tree
            .iter()
            .filter_map(|entry| entry.ok())
            .map(|(_, value)| String::from_utf8_lossy(&value).into_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path(), "alice").await.unwrap();

        kv.set("auth:last_token", &"t-1".to_string()).await.unwrap();
        let token: Option<String> = kv.get("auth:last_token").await.unwrap();
        assert_eq!(token.as_deref(), Some("t-1"));

        kv.delete("auth:last_token").await.unwrap();
        let token: Option<String> = kv.get("auth:last_token").await.unwrap();
        assert_eq!(token, None);
    }

    #[tokio::test]
    async fn test_reopen_after_drop_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = KvStore::open(dir.path(), "alice").await.unwrap();
            kv.set("cursor", &42i64).await.unwrap();
            kv.flush().await.unwrap();
        }
        let kv = KvStore::open(dir.path(), "alice").await.unwrap();
        let cursor: Option<i64> = kv.get("cursor").await.unwrap();
        assert_eq!(cursor, Some(42));
    }
}
