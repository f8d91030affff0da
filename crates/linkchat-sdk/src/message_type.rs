//! 消息内容类型
//!
//! 消息内容是一个带 `kind` 标签的可辨识联合：
//!
//! ```json
//! { "kind": "text", "payload": { "text": "hi" } }
//! ```
//!
//! 反序列化按 `kind` 分派；无法识别的 `kind`（新版本服务端下发的类型）
//! 降级为 [`MessageContent::Raw`]，原样保留 payload，不会失败。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const KIND_TEXT: &str = "text";
pub const KIND_IMAGE: &str = "image";
pub const KIND_PRODUCT: &str = "product";
pub const KIND_ORDER: &str = "order";
pub const KIND_SYSTEM: &str = "system";
pub const KIND_INTERACTION: &str = "interaction";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// 商品卡片
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductContent {
    pub product_id: String,
    pub title: String,
    /// 价格（字符串，避免浮点误差，由展示层格式化）
    pub price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
}

/// 订单卡片
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderContent {
    pub order_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemContent {
    pub text: String,
}

/// 互动通知（点赞、关注、评论提醒等）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionContent {
    pub action: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// 消息内容
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(TextContent),
    Image(ImageContent),
    Product(ProductContent),
    Order(OrderContent),
    System(SystemContent),
    Interaction(InteractionContent),
    /// 未识别的类型，保留原始 payload
    Raw { kind: String, payload: Value },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    /// 类型标签（同时作为 message_type 落库）
    pub fn kind(&self) -> &str {
        match self {
            MessageContent::Text(_) => KIND_TEXT,
            MessageContent::Image(_) => KIND_IMAGE,
            MessageContent::Product(_) => KIND_PRODUCT,
            MessageContent::Order(_) => KIND_ORDER,
            MessageContent::System(_) => KIND_SYSTEM,
            MessageContent::Interaction(_) => KIND_INTERACTION,
            MessageContent::Raw { kind, .. } => kind,
        }
    }

    /// 会话列表里展示的一行摘要
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text(c) => c.text.clone(),
            MessageContent::Image(_) => "[图片]".to_string(),
            MessageContent::Product(c) => format!("[商品] {}", c.title),
            MessageContent::Order(c) => format!("[订单] {}", c.order_id),
            MessageContent::System(c) => c.text.clone(),
            MessageContent::Interaction(c) => c.summary.clone().unwrap_or_else(|| c.action.clone()),
            MessageContent::Raw { kind, .. } => format!("[{}]", kind),
        }
    }

    fn payload(&self) -> serde_json::Result<Value> {
        match self {
            MessageContent::Text(c) => serde_json::to_value(c),
            MessageContent::Image(c) => serde_json::to_value(c),
            MessageContent::Product(c) => serde_json::to_value(c),
            MessageContent::Order(c) => serde_json::to_value(c),
            MessageContent::System(c) => serde_json::to_value(c),
            MessageContent::Interaction(c) => serde_json::to_value(c),
            MessageContent::Raw { payload, .. } => Ok(payload.clone()),
        }
    }

    /// 按 kind 分派解析 payload
    ///
    /// 未知 kind，或已知 kind 但 payload 结构不符（服务端升级了字段），
    /// 都降级为 Raw，保证消息本身不会因为内容解析失败而丢失。
    pub fn from_parts(kind: &str, payload: Value) -> Self {
        let parsed = match kind {
            KIND_TEXT => serde_json::from_value(payload.clone()).map(MessageContent::Text),
            KIND_IMAGE => serde_json::from_value(payload.clone()).map(MessageContent::Image),
            KIND_PRODUCT => serde_json::from_value(payload.clone()).map(MessageContent::Product),
            KIND_ORDER => serde_json::from_value(payload.clone()).map(MessageContent::Order),
            KIND_SYSTEM => serde_json::from_value(payload.clone()).map(MessageContent::System),
            KIND_INTERACTION => {
                serde_json::from_value(payload.clone()).map(MessageContent::Interaction)
            }
            _ => {
                return MessageContent::Raw {
                    kind: kind.to_string(),
                    payload,
                }
            }
        };

        match parsed {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("消息内容解析失败，降级为 Raw: kind={}, error={}", kind, e);
                MessageContent::Raw {
                    kind: kind.to_string(),
                    payload,
                }
            }
        }
    }

    /// 落库用的 JSON 字符串
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Serialize, Deserialize)]
struct TaggedContent {
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Serialize for MessageContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let payload = self.payload().map_err(serde::ser::Error::custom)?;
        TaggedContent {
            kind: self.kind().to_string(),
            payload,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tagged = TaggedContent::deserialize(deserializer)?;
        Ok(MessageContent::from_parts(&tagged.kind, tagged.payload))
    }
}
