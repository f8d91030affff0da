//! 连接状态管理
//!
//! 状态机：
//!
//! ```text
//! Disconnected → Connecting → Connected → Joined
//! Connected/Joined ⇄ Reconnecting
//! 任意状态 → Disconnected（主动断开）
//! ConnectionError 为终态，只能由调用方重新 connect/reconnect 离开
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::utils::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// 已加入用户主 topic，可以收发业务消息
    Joined,
    Reconnecting,
    ConnectionError,
}

impl ConnectionStatus {
    /// 是否允许从 self 迁移到 next
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        if next == Disconnected || self == next {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (ConnectionError, Connecting)
                | (ConnectionError, Reconnecting)
                | (Connecting, Connected)
                | (Connecting, ConnectionError)
                | (Connected, Joined)
                | (Connected, Reconnecting)
                | (Joined, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, ConnectionError)
        )
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Joined => write!(f, "已加入"),
            ConnectionStatus::Reconnecting => write!(f, "重连中"),
            ConnectionStatus::ConnectionError => write!(f, "连接失败"),
        }
    }
}

/// 连接统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub reconnect_count: u64,
    pub last_activity_time: Option<i64>,
}

/// 连接状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub server_url: String,
    pub user_id: Option<String>,
    /// 按加入顺序
    pub joined_topics: Vec<String>,
    pub connected_at: Option<i64>,
    /// 最近一次导致 ConnectionError 的原因
    pub last_error: Option<String>,
    pub stats: ConnectionStats,
    pub sdk_version: String,
}

impl ConnectionState {
    pub fn new(server_url: String) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            server_url,
            user_id: None,
            joined_topics: Vec::new(),
            connected_at: None,
            last_error: None,
            stats: ConnectionStats::default(),
            sdk_version: crate::version::SDK_VERSION.to_string(),
        }
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        format!(
            "【连接状态】状态: {}, 服务器: {}, 用户: {}, topics: [{}], 发送{}帧/接收{}帧, 重连{}次",
            self.status,
            self.server_url,
            self.user_id.as_deref().unwrap_or("-"),
            self.joined_topics.join(", "),
            self.stats.frames_sent,
            self.stats.frames_received,
            self.stats.reconnect_count
        )
    }
}

/// 连接状态管理器
///
/// 基于 `watch` channel：任意时刻可取快照，也可以订阅变化。
#[derive(Debug, Clone)]
pub struct ConnectionStateManager {
    state: watch::Sender<ConnectionState>,
}

impl ConnectionStateManager {
    pub fn new(server_url: String) -> Self {
        let (state, _) = watch::channel(ConnectionState::new(server_url));
        Self { state }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn get_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// 订阅状态变化（只在状态值变化时唤醒）
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 状态迁移；非法迁移被拒绝并返回 false
    pub fn transition(&self, next: ConnectionStatus) -> bool {
        let mut accepted = false;
        self.state.send_if_modified(|state| {
            if state.status == next {
                accepted = true;
                return false;
            }
            if !state.status.can_transition_to(next) {
                tracing::warn!("[ConnectionState] 忽略非法迁移: {:?} -> {:?}", state.status, next);
                return false;
            }
            match next {
                ConnectionStatus::Connected => {
                    state.connected_at = Some(now_millis());
                    state.last_error = None;
                }
                ConnectionStatus::Disconnected => {
                    state.connected_at = None;
                    state.joined_topics.clear();
                }
                ConnectionStatus::Reconnecting => state.stats.reconnect_count += 1,
                _ => {}
            }
            state.status = next;
            accepted = true;
            true
        });
        accepted
    }

    /// 进入 ConnectionError 并记录原因
    pub fn fail(&self, error: String) -> bool {
        let accepted = self.transition(ConnectionStatus::ConnectionError);
        if accepted {
            self.state.send_modify(|state| {
                state.connected_at = None;
                state.last_error = Some(error);
            });
        }
        accepted
    }

    pub fn set_user(&self, user_id: String) {
        self.state.send_modify(|state| state.user_id = Some(user_id));
    }

    pub fn set_joined_topics(&self, topics: Vec<String>) {
        self.state.send_if_modified(|state| {
            if state.joined_topics == topics {
                return false;
            }
            state.joined_topics = topics;
            true
        });
    }

    // 统计不唤醒订阅者
    pub fn record_sent(&self) {
        self.state.send_if_modified(|state| {
            state.stats.frames_sent += 1;
            state.stats.last_activity_time = Some(now_millis());
            false
        });
    }

    pub fn record_received(&self) {
        self.state.send_if_modified(|state| {
            state.stats.frames_received += 1;
            state.stats.last_activity_time = Some(now_millis());
            false
        });
    }

    pub fn log_state(&self) {
        tracing::info!("{}", self.state.borrow().summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn test_transitions() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Joined.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(ConnectionError.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Joined));
        assert!(!ConnectionError.can_transition_to(Joined));
        assert!(!Reconnecting.can_transition_to(Joined));
    }

    #[tokio::test]
    async fn test_manager_notifies_on_change_only() {
        let manager = ConnectionStateManager::new("ws://localhost".into());
        let mut rx = manager.subscribe();

        assert!(manager.transition(Connecting));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().status, Connecting);

        manager.record_sent();
        assert!(!rx.has_changed().unwrap());

        assert!(manager.fail("refused".into()));
        let state = manager.get_state();
        assert_eq!(state.status, ConnectionError);
        assert_eq!(state.last_error.as_deref(), Some("refused"));

        // 终态不能直接跳到 Joined
        assert!(!manager.transition(Joined));
        assert!(manager.transition(Disconnected));
    }
}
