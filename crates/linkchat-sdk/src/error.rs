use std::fmt;

/// SDK 统一错误类型
///
/// 网络相关错误（`Network`/`Timeout`）属于瞬时错误，可以退避重试；
/// `Auth` 需要重新认证，永远不会被静默重试。
#[derive(Debug, Clone)]
pub enum LinkchatSDKError {
    /// 网络不可达、连接被断开
    Network(String),
    /// token 无效或已过期
    Auth(String),
    /// 帧格式错误、回复无法解析
    Protocol(String),
    /// 在限定时间内没有收到回复
    Timeout(String),
    /// 同一个 client_id 对应了内容不同的两条消息
    Conflict(String),
    /// 加入 topic 失败（连接本身仍然可用）
    Join { topic: String, reason: String },
    /// 服务端返回 error 状态的 reply
    Rejected(String),
    SqliteError(String),
    Database(String),
    Migration(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    NotConnected,
    /// 当前没有登录的会话
    NoSession,
    /// 命令携带的用户与已打开的用户库不一致
    SessionMismatch { expected: String, actual: String },
    InvalidArgument(String),
    InvalidOperation(String),
    NotFound(String),
    Config(String),
    ShuttingDown(String),
}

impl fmt::Display for LinkchatSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkchatSDKError::Network(e) => write!(f, "Network error: {}", e),
            LinkchatSDKError::Auth(e) => write!(f, "Authentication error: {}", e),
            LinkchatSDKError::Protocol(e) => write!(f, "Protocol error: {}", e),
            LinkchatSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            LinkchatSDKError::Conflict(e) => write!(f, "Conflict: {}", e),
            LinkchatSDKError::Join { topic, reason } => {
                write!(f, "Join error [{}]: {}", topic, reason)
            }
            LinkchatSDKError::Rejected(e) => write!(f, "Rejected by server: {}", e),
            LinkchatSDKError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            LinkchatSDKError::Database(e) => write!(f, "Database error: {}", e),
            LinkchatSDKError::Migration(e) => write!(f, "Migration error: {}", e),
            LinkchatSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            LinkchatSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            LinkchatSDKError::IO(e) => write!(f, "IO error: {}", e),
            LinkchatSDKError::NotConnected => write!(f, "Not connected"),
            LinkchatSDKError::NoSession => write!(f, "No active session"),
            LinkchatSDKError::SessionMismatch { expected, actual } => write!(
                f,
                "Session mismatch: store belongs to {}, command issued for {}",
                expected, actual
            ),
            LinkchatSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            LinkchatSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            LinkchatSDKError::NotFound(e) => write!(f, "Not found: {}", e),
            LinkchatSDKError::Config(e) => write!(f, "Config error: {}", e),
            LinkchatSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
        }
    }
}

impl std::error::Error for LinkchatSDKError {}

impl From<rusqlite::Error> for LinkchatSDKError {
    fn from(error: rusqlite::Error) -> Self {
        LinkchatSDKError::SqliteError(error.to_string())
    }
}

impl From<serde_json::Error> for LinkchatSDKError {
    fn from(error: serde_json::Error) -> Self {
        LinkchatSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for LinkchatSDKError {
    fn from(error: std::io::Error) -> Self {
        LinkchatSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for LinkchatSDKError {
    fn from(error: sled::Error) -> Self {
        LinkchatSDKError::KvStore(error.to_string())
    }
}

impl LinkchatSDKError {
    /// 瞬时错误：可以按退避策略自动重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkchatSDKError::Network(_) | LinkchatSDKError::Timeout(_) | LinkchatSDKError::NotConnected
        )
    }

    /// 认证类错误：必须由上层重新提供凭证
    pub fn is_auth(&self) -> bool {
        matches!(self, LinkchatSDKError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, LinkchatSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LinkchatSDKError::Network("reset".into()).is_transient());
        assert!(LinkchatSDKError::Timeout("push".into()).is_transient());
        assert!(LinkchatSDKError::NotConnected.is_transient());
        assert!(!LinkchatSDKError::Auth("expired".into()).is_transient());
        assert!(!LinkchatSDKError::Rejected("forbidden".into()).is_transient());
        assert!(LinkchatSDKError::Auth("expired".into()).is_auth());
    }

    #[test]
    fn test_join_error_display() {
        let err = LinkchatSDKError::Join {
            topic: "user:42".into(),
            reason: "unauthorized".into(),
        };
        assert_eq!(err.to_string(), "Join error [user:42]: unauthorized");
    }
}
