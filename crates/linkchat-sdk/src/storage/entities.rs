//! 数据实体定义 - 对应数据库表结构
//!
//! 所有时间字段均为 UTC 毫秒时间戳。

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::message_type::MessageContent;

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// 本地已写入，等待服务端 ACK
    Sending = 0,
    /// 服务端已确认
    Sent = 1,
    /// 收到但未读
    Unread = 2,
    /// 已读
    Read = 3,
    /// 已撤回
    Withdrawn = 4,
    /// 已删除（包括用户取消发送）
    Deleted = 5,
}

impl MessageStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(MessageStatus::Sending),
            1 => Some(MessageStatus::Sent),
            2 => Some(MessageStatus::Unread),
            3 => Some(MessageStatus::Read),
            4 => Some(MessageStatus::Withdrawn),
            5 => Some(MessageStatus::Deleted),
            _ => None,
        }
    }

    /// 终态：撤回/删除之后不再被普通状态更新覆盖
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Withdrawn | MessageStatus::Deleted)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Unread => "unread",
            MessageStatus::Read => "read",
            MessageStatus::Withdrawn => "withdrawn",
            MessageStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// 私聊会话 ID：两个参与者 ID 规范排序后拼接，双方计算结果一致
///
/// 前缀为较小 ID 的字节长度，ID 本身含分隔符时也不会产生歧义。
pub fn conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}_{}_{}", lo.len(), lo, hi)
}

/// 消息实体 - 对应 message 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 服务端消息 ID（ACK 之前为 None）
    pub id: Option<String>,
    /// 客户端生成的幂等键，sending → sent 前后保持不变
    pub client_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: MessageContent,
    pub status: MessageStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub send_attempts: u32,
    pub last_error: Option<String>,
    /// 本地排序键：本地插入时分配，之后不随 ACK 改变
    #[serde(default)]
    pub order_seq: i64,
}

impl Message {
    /// 会话里“最后一条消息”引用的 ID：已确认用服务端 ID，否则用 client_id
    pub fn reference_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.client_id)
    }

    pub fn is_sending(&self) -> bool {
        self.status == MessageStatus::Sending
    }
}

/// 会话参与者快照（头像、昵称等由业务层提供，SDK 只透传）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// 会话实体 - 对应 conversation 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant: ParticipantSnapshot,
    pub last_message_id: Option<String>,
    pub unread_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 服务端下发的消息（推送、同步、ACK 回放共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: MessageContent,
    /// 服务端状态，缺省或无法识别时视为未读
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: Option<MessageStatus>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub sender: Option<ParticipantSnapshot>,
}

/// 服务端新增的状态值不能让整页同步解析失败，无法识别时降级为 None
fn lenient_status<'de, D>(deserializer: D) -> std::result::Result<Option<MessageStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match serde_json::from_value::<MessageStatus>(value.clone()) {
            Ok(status) => Ok(Some(status)),
            Err(_) => {
                warn!("[Storage] 无法识别的消息状态，按缺省处理: {}", value);
                Ok(None)
            }
        },
    }
}

impl RemoteMessage {
    /// 没有 client_id 的历史消息用服务端 ID 派生一个稳定的幂等键
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("srv-{}", self.id))
    }
}

/// 消息发送 ACK
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendAck {
    pub id: String,
    pub client_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 消息分页：`number` 从 0 开始，0 为最新一页；页内按时间正序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub number: u32,
    pub size: u32,
}

impl MessagePage {
    pub fn latest(size: u32) -> Self {
        Self { number: 0, size }
    }

    pub fn offset(&self) -> u64 {
        self.number as u64 * self.size as u64
    }
}

impl Default for MessagePage {
    fn default() -> Self {
        Self::latest(20)
    }
}

/// 会话查询方式：按会话 ID 或按对方用户 ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRef {
    Id(String),
    Participant(String),
}

/// 一次对账写入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_remote_status_degrades_to_none() {
        let raw = json!({
            "id": "m1",
            "sender_id": "bob",
            "receiver_id": "alice",
            "content": { "kind": "text", "payload": { "text": "hi" } },
            "status": "archived",
            "created_at": 1,
            "updated_at": 2
        });
        let message: RemoteMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.status, None);

        let known: RemoteMessage = serde_json::from_value(json!({
            "id": "m2",
            "sender_id": "bob",
            "receiver_id": "alice",
            "content": { "kind": "text", "payload": { "text": "hi" } },
            "status": "read",
            "created_at": 1,
            "updated_at": 2
        }))
        .unwrap();
        assert_eq!(known.status, Some(MessageStatus::Read));
    }

    #[test]
    fn test_conversation_id_is_symmetric() {
        let pairs = [("alice", "bob"), ("42", "7"), ("u_1", "u_10"), ("same", "same")];
        for (a, b) in pairs {
            assert_eq!(conversation_id(a, b), conversation_id(b, a));
        }
        assert_eq!(conversation_id("bob", "alice"), "5_alice_bob");
        // ID 含分隔符时不能撞车
        assert_ne!(conversation_id("a_b", "c"), conversation_id("a", "b_c"));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Unread,
            MessageStatus::Read,
            MessageStatus::Withdrawn,
            MessageStatus::Deleted,
        ] {
            assert_eq!(MessageStatus::from_i32(status.as_i32()), Some(status));
        }
        assert_eq!(MessageStatus::from_i32(99), None);
    }

    #[test]
    fn test_effective_client_id() {
        let remote = RemoteMessage {
            id: "m1".into(),
            client_id: None,
            sender_id: "a".into(),
            receiver_id: "b".into(),
            content: MessageContent::text("hi"),
            status: None,
            created_at: 1,
            updated_at: 1,
            sender: None,
        };
        assert_eq!(remote.effective_client_id(), "srv-m1");
    }
}
