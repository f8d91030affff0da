//! 同步引擎
//!
//! 职责：
//! - 以 `(updated_at, id)` 游标分页拉取（`sync {since, since_id, limit}`）直到 `has_more == false`
//! - 全部结果在一个事务内合并进本地库（与实时推送共用同一套对账逻辑）
//! - 提交成功后才推进游标；任何一页或提交失败，游标保持不变
//! - 同一时刻只有一个同步在执行，重叠的调用排队

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::cursor_store::{CursorStore, SyncCursor};
use super::SyncState;
use crate::channel::ChannelClient;
use crate::error::{LinkchatSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::read_state::publish_unread;
use crate::storage::entities::{ReconcileOutcome, RemoteMessage};
use crate::storage::StorageManager;
use crate::transport::frame::{events, user_topic};
use crate::utils::now_millis;

/// 一次同步的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// 同步后的游标
    pub cursor: Option<SyncCursor>,
    /// 拉取到的消息条数
    pub fetched: usize,
    /// 实际写入（新增或更新）的条数
    pub applied: usize,
    pub pages: u32,
}

#[derive(Debug, Deserialize)]
struct SyncPage {
    #[serde(default)]
    messages: Vec<RemoteMessage>,
    #[serde(default)]
    has_more: bool,
}

pub struct SyncEngine {
    self_id: String,
    storage: Arc<StorageManager>,
    channel: ChannelClient,
    cursors: CursorStore,
    events: Arc<EventManager>,
    page_size: u32,
    /// 同步锁，防止并发同步
    lock: Mutex<()>,
    state: parking_lot::RwLock<SyncState>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("self_id", &self.self_id)
            .field("page_size", &self.page_size)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        self_id: String,
        storage: Arc<StorageManager>,
        channel: ChannelClient,
        events: Arc<EventManager>,
        page_size: u32,
    ) -> Self {
        let cursors = CursorStore::new(storage.kv().clone());
        Self {
            self_id,
            storage,
            channel,
            cursors,
            events,
            page_size: page_size.max(1),
            lock: Mutex::new(()),
            state: parking_lot::RwLock::new(SyncState::Idle),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.read().clone()
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// 从已保存的游标开始同步
    pub async fn sync(&self) -> Result<SyncReport> {
        let _guard = self.lock.lock().await;
        let since = self.cursors.load().await?;
        self.run_locked(since).await
    }

    /// 从指定游标开始同步（None 表示全量）
    pub async fn sync_since(&self, since: Option<SyncCursor>) -> Result<SyncReport> {
        let _guard = self.lock.lock().await;
        self.run_locked(since).await
    }

    async fn run_locked(&self, since: Option<SyncCursor>) -> Result<SyncReport> {
        *self.state.write() = SyncState::Syncing;
        info!("[Sync] 🔄 开始同步: since={:?}", since);

        match self.fetch_and_apply(since).await {
            Ok(report) => {
                *self.state.write() = SyncState::Synced {
                    last_sync_at: now_millis(),
                };
                info!(
                    "[Sync] ✅ 同步完成: pages={}, fetched={}, applied={}, cursor={:?}",
                    report.pages, report.fetched, report.applied, report.cursor
                );
                self.events
                    .emit(SDKEvent::SyncCompleted {
                        cursor: report.cursor.as_ref().map(|c| c.updated_at),
                        applied: report.applied,
                        pages: report.pages,
                        timestamp: now_millis(),
                    })
                    .await;
                Ok(report)
            }
            Err(e) => {
                error!("[Sync] ❌ 同步失败，游标保持不变: {}", e);
                *self.state.write() = SyncState::Failed {
                    error: e.to_string(),
                };
                self.events
                    .emit(SDKEvent::SyncFailed {
                        error: e.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn fetch_and_apply(&self, since: Option<SyncCursor>) -> Result<SyncReport> {
        let topic = user_topic(&self.self_id);
        let mut fetched: Vec<RemoteMessage> = Vec::new();
        let mut page_since = since.clone();
        let mut pages = 0u32;

        loop {
            let reply = self
                .channel
                .push(
                    &topic,
                    events::SYNC,
                    json!({
                        "since": page_since.as_ref().map(|c| c.updated_at),
                        "since_id": page_since.as_ref().map(|c| c.id.as_str()),
                        "limit": self.page_size,
                    }),
                )
                .await?;
            let page: SyncPage = serde_json::from_value(reply)
                .map_err(|e| LinkchatSDKError::Protocol(format!("无法解析同步结果: {}", e)))?;
            pages += 1;
            debug!(
                "[Sync] 第 {} 页: {} 条, has_more={}",
                pages,
                page.messages.len(),
                page.has_more
            );

            let page_max = page.messages.iter().map(SyncCursor::of).max();
            fetched.extend(page.messages);
            if !page.has_more {
                break;
            }
            match page_max {
                Some(max) if page_since.as_ref().map_or(true, |since| max > *since) => {
                    page_since = Some(max)
                }
                _ => {
                    return Err(LinkchatSDKError::Protocol(
                        "同步分页没有推进游标".to_string(),
                    ))
                }
            }
        }

        let total = fetched.len();
        let new_cursor = fetched.iter().map(SyncCursor::of).max();
        if fetched.is_empty() {
            return Ok(SyncReport {
                cursor: since,
                fetched: 0,
                applied: 0,
                pages,
            });
        }

        let results = self
            .storage
            .apply_remote_batch(fetched, now_millis())
            .await?;
        let mut touched: Vec<String> = Vec::new();
        let mut applied = 0;
        for (outcome, message) in &results {
            if *outcome == ReconcileOutcome::Unchanged {
                continue;
            }
            applied += 1;
            if !touched.contains(&message.conversation_id) {
                touched.push(message.conversation_id.clone());
            }
        }

        // 已提交，推进游标
        let cursor = match new_cursor {
            Some(cursor) => Some(self.cursors.advance(cursor).await?),
            None => since,
        };

        publish_unread(&self.storage, &self.events, touched).await;

        Ok(SyncReport {
            cursor,
            fetched: total,
            applied,
            pages,
        })
    }
}
