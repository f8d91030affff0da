//! 数据访问层（DAO）
//!
//! 所有 DAO 都借用一个 `&Connection`，因此既可以直接在连接上调用，
//! 也可以在 `Transaction`（解引用为 `Connection`）里组合成一个事务。

pub mod conversation;
pub mod message;

pub use conversation::ConversationDao;
pub use message::MessageDao;
