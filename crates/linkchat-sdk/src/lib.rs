//! Linkchat SDK - 交易平台私聊的实时消息核心
//!
//! 本 SDK 提供：
//! - 📡 基于 topic 的实时通道：加入、推送/回复、心跳、指数退避重连
//! - 💾 本地优先存储：SQLite（单写线程）+ sled KV，按用户隔离
//! - 📤 发送队列：乐观写入、client_id 幂等、失败重试、按发出顺序投递
//! - 🔄 游标同步：分页拉取、幂等合并、提交后才推进游标
//! - 👁️ 已读状态与未读数对账
//! - ⚙️ 事件系统与可观察查询
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use linkchat_sdk::{ChatRepository, Credentials, LinkchatConfig, MessageContent, StaticCredentials};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     linkchat_sdk::init_logging(false);
//!
//!     let config = LinkchatConfig::builder()
//!         .data_dir("/path/to/data")
//!         .server_url("wss://chat.example.com/socket")
//!         .build()?;
//!     let repo = ChatRepository::with_websocket(config)?;
//!
//!     let credentials = Credentials::new("user123", "token");
//!     repo.login(Arc::new(StaticCredentials::new(credentials))).await?;
//!     repo.connect().await?;
//!
//!     let mut conversations = repo.observe_conversations().await?;
//!     repo.send("seller42", MessageContent::text("还在吗？")).await?;
//!     while let Some(list) = conversations.next().await {
//!         println!("会话数: {}", list.len());
//!     }
//!
//!     repo.logout().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod connection_state;
pub mod credentials;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod message_type;
pub mod notification;
pub mod queue;
pub mod read_state;
pub mod repository;
pub mod session;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod utils;
pub mod version;

#[cfg(test)]
mod testing;

// 重新导出核心类型，方便使用
pub use channel::{ChannelBroadcast, ChannelClient, ChannelConfig, ReconnectPolicy};
pub use config::{LinkchatConfig, LinkchatConfigBuilder};
pub use connection_state::{ConnectionState, ConnectionStatus};
pub use credentials::{CredentialProvider, Credentials, StaticCredentials};
pub use error::{LinkchatSDKError, Result};
pub use events::{EventFilter, EventManager, SDKEvent};
pub use lifecycle::{AppState, LifecycleHook, LifecycleManager};
pub use logging::init_logging;
pub use message_type::MessageContent;
pub use notification::{NoopNotificationDispatcher, NotificationDispatcher};
pub use queue::{RetryPolicy, SendFailureReason, SendMetrics, SendPipeline};
pub use read_state::ReadStateReconciler;
pub use repository::{ChatRepository, Observation};
pub use session::Session;
pub use storage::entities::{
    conversation_id, Conversation, ConversationRef, Message, MessagePage, MessageStatus,
    ParticipantSnapshot,
};
pub use storage::{ReadChange, StorageManager};
pub use sync::{SyncCursor, SyncEngine, SyncReport, SyncState};
pub use transport::Transport;
pub use version::{SDK_DB_VERSION, SDK_VERSION};
