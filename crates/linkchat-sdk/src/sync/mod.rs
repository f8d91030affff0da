//! 游标同步
//!
//! 职责：
//! - 持久化同步游标（已合并的最后一条记录的 `(updated_at, id)`）
//! - 分页拉取游标之后的消息，整批合并进本地库后再推进游标

pub mod cursor_store;
pub mod sync_engine;

pub use cursor_store::{CursorStore, SyncCursor};
pub use sync_engine::{SyncEngine, SyncReport};

/// 同步状态
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncState {
    /// 从未同步过
    Idle,
    /// 正在同步
    Syncing,
    /// 已同步
    Synced {
        /// 完成时间（毫秒）
        last_sync_at: i64,
    },
    /// 同步失败，游标保持不变
    Failed {
        /// 错误消息
        error: String,
    },
}
