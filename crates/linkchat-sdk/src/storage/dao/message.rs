//! 消息数据访问层
//!
//! 功能包括：
//! - 按服务端 ID / client_id 查找（去重的两把钥匙）
//! - 本地发送记录的写入、ACK、失败记录
//! - 状态更新与已读标记
//! - 会话内分页

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::message_type::MessageContent;
use crate::storage::entities::{Message, MessagePage, MessageStatus};

const SELECT_COLUMNS: &str = "id, client_id, conversation_id, sender_id, receiver_id, content, \
     status, created_at, updated_at, order_seq, send_attempts, error_message";

/// 消息数据访问对象
pub struct MessageDao<'a> {
    conn: &'a Connection,
}

impl<'a> MessageDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 插入新消息，返回本地行 ID
    ///
    /// client_id 或服务端 ID 重复时由唯一约束拒绝，调用方应先查重。
    pub fn insert(&self, message: &Message) -> Result<i64> {
        let content = message.content.to_json()?;
        self.conn.execute(
            "INSERT INTO message (
                id, client_id, conversation_id, sender_id, receiver_id, content, message_type,
                status, created_at, updated_at, order_seq, is_sending, send_attempts, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                message.id,
                message.client_id,
                message.conversation_id,
                message.sender_id,
                message.receiver_id,
                content,
                message.content.kind(),
                message.status.as_i32(),
                message.created_at,
                message.updated_at,
                message.order_seq,
                message.is_sending(),
                message.send_attempts,
                message.last_error,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_by_client_id(&self, client_id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM message WHERE client_id = ?1", SELECT_COLUMNS);
        let message = self
            .conn
            .query_row(&sql, [client_id], Self::row_to_message)
            .optional()?;
        Ok(message)
    }

    /// 根据服务端消息 ID 获取消息
    pub fn get_by_server_id(&self, id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM message WHERE id = ?1", SELECT_COLUMNS);
        let message = self.conn.query_row(&sql, [id], Self::row_to_message).optional()?;
        Ok(message)
    }

    /// 服务端 ID 优先，其次 client_id
    pub fn get_by_any_id(&self, id: &str) -> Result<Option<Message>> {
        match self.get_by_server_id(id)? {
            Some(message) => Ok(Some(message)),
            None => self.get_by_client_id(id),
        }
    }

    /// 整行覆盖（按 client_id 定位），用于对账合并后的写回
    pub fn update(&self, message: &Message) -> Result<usize> {
        let content = message.content.to_json()?;
        let rows = self.conn.execute(
            "UPDATE message SET
                id = ?2, content = ?3, message_type = ?4, status = ?5, created_at = ?6,
                updated_at = ?7, is_sending = ?8, send_attempts = ?9, error_message = ?10
             WHERE client_id = ?1",
            params![
                message.client_id,
                message.id,
                content,
                message.content.kind(),
                message.status.as_i32(),
                message.created_at,
                message.updated_at,
                message.is_sending(),
                message.send_attempts,
                message.last_error,
            ],
        )?;
        Ok(rows)
    }

    /// 记录一次发送失败：尝试次数 +1，保留错误信息，状态仍为 Sending
    pub fn record_send_failure(&self, client_id: &str, error: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE message SET send_attempts = send_attempts + 1, error_message = ?2
             WHERE client_id = ?1 AND status = ?3",
            params![client_id, error, MessageStatus::Sending.as_i32()],
        )?;
        Ok(rows)
    }

    pub fn update_status(&self, client_id: &str, status: MessageStatus) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE message SET status = ?2, is_sending = ?3 WHERE client_id = ?1",
            params![client_id, status.as_i32(), status == MessageStatus::Sending],
        )?;
        Ok(rows)
    }

    pub fn delete_by_client_id(&self, client_id: &str) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM message WHERE client_id = ?1", [client_id])?;
        Ok(rows)
    }

    /// 把一条收到的未读消息标记为已读；返回是否发生了变化
    pub fn mark_read(&self, client_id: &str, self_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE message SET status = ?3
             WHERE client_id = ?1 AND receiver_id = ?2 AND status = ?4",
            params![
                client_id,
                self_id,
                MessageStatus::Read.as_i32(),
                MessageStatus::Unread.as_i32()
            ],
        )?;
        Ok(rows > 0)
    }

    /// 会话内所有收到的未读消息标记为已读，返回标记条数
    pub fn mark_conversation_read(&self, conversation_id: &str, self_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE message SET status = ?3
             WHERE conversation_id = ?1 AND receiver_id = ?2 AND status = ?4",
            params![
                conversation_id,
                self_id,
                MessageStatus::Read.as_i32(),
                MessageStatus::Unread.as_i32()
            ],
        )?;
        Ok(rows)
    }

    /// 会话内收到的未读消息数
    pub fn count_unread(&self, conversation_id: &str, self_id: &str) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM message
             WHERE conversation_id = ?1 AND receiver_id = ?2 AND status = ?3",
            params![conversation_id, self_id, MessageStatus::Unread.as_i32()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// 有未读消息的会话 ID
    pub fn conversations_with_unread(&self, self_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT conversation_id FROM message WHERE receiver_id = ?1 AND status = ?2",
        )?;
        let ids = stmt
            .query_map(params![self_id, MessageStatus::Unread.as_i32()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// 会话内排序最靠后的可见消息（已删除的不算）
    pub fn latest_in_conversation(&self, conversation_id: &str) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {} FROM message WHERE conversation_id = ?1 AND status != ?2
             ORDER BY order_seq DESC, local_id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        let message = self
            .conn
            .query_row(
                &sql,
                params![conversation_id, MessageStatus::Deleted.as_i32()],
                Self::row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn max_order_seq(&self) -> Result<i64> {
        let max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(order_seq) FROM message", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    /// 分页查询：第 0 页为最新的一页，页内按 order_seq 正序
    pub fn list_page(&self, conversation_id: &str, page: MessagePage) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM message WHERE conversation_id = ?1 AND status != ?2
             ORDER BY order_seq DESC, local_id DESC LIMIT ?3 OFFSET ?4",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut messages = stmt
            .query_map(
                params![
                    conversation_id,
                    MessageStatus::Deleted.as_i32(),
                    page.size as i64,
                    page.offset() as i64
                ],
                Self::row_to_message,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// 所有待发送的消息，按本地排序键升序（即发送顺序）
    pub fn list_sending(&self) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM message WHERE is_sending = 1 ORDER BY order_seq ASC, local_id ASC",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let messages = stmt
            .query_map([], Self::row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let content_json: String = row.get(5)?;
        let content = MessageContent::from_json(&content_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
        let status_raw: i32 = row.get(6)?;
        let status = MessageStatus::from_i32(status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                Type::Integer,
                format!("未知的消息状态: {}", status_raw).into(),
            )
        })?;

        Ok(Message {
            id: row.get(0)?,
            client_id: row.get(1)?,
            conversation_id: row.get(2)?,
            sender_id: row.get(3)?,
            receiver_id: row.get(4)?,
            content,
            status,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            order_seq: row.get(9)?,
            send_attempts: row.get(10)?,
            last_error: row.get(11)?,
        })
    }
}
