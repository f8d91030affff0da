//! 会话数据访问层

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::storage::dao::MessageDao;
use crate::storage::entities::{Conversation, ParticipantSnapshot};

const SELECT_COLUMNS: &str =
    "id, participant_id, participant_snapshot, last_message_id, unread_count, created_at, updated_at";

pub struct ConversationDao<'a> {
    conn: &'a Connection,
}

impl<'a> ConversationDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let sql = format!("SELECT {} FROM conversation WHERE id = ?1", SELECT_COLUMNS);
        let conversation = self
            .conn
            .query_row(&sql, [id], Self::row_to_conversation)
            .optional()?;
        Ok(conversation)
    }

    pub fn get_by_participant(&self, participant_id: &str) -> Result<Option<Conversation>> {
        let sql = format!(
            "SELECT {} FROM conversation WHERE participant_id = ?1 LIMIT 1",
            SELECT_COLUMNS
        );
        let conversation = self
            .conn
            .query_row(&sql, [participant_id], Self::row_to_conversation)
            .optional()?;
        Ok(conversation)
    }

    /// 确保会话存在（首条消息时惰性创建）
    ///
    /// 已存在时只在快照带来新资料（昵称/头像）时更新快照，其余字段不动。
    pub fn ensure(&self, id: &str, participant: &ParticipantSnapshot, now: i64) -> Result<bool> {
        let snapshot = serde_json::to_string(participant)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO conversation
                (id, participant_id, participant_snapshot, last_message_id, unread_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, 0, ?4, ?4)",
            params![id, participant.user_id, snapshot, now],
        )?;

        if inserted == 0 && (participant.nickname.is_some() || participant.avatar_url.is_some()) {
            self.conn.execute(
                "UPDATE conversation SET participant_snapshot = ?2 WHERE id = ?1",
                params![id, snapshot],
            )?;
        }
        Ok(inserted > 0)
    }

    /// 按 updated_at 倒序列出所有会话
    pub fn list(&self) -> Result<Vec<Conversation>> {
        let sql = format!(
            "SELECT {} FROM conversation ORDER BY updated_at DESC, id ASC",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let conversations = stmt
            .query_map([], Self::row_to_conversation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conversations)
    }

    pub fn total_unread(&self) -> Result<u32> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(unread_count), 0) FROM conversation",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u32)
    }

    pub fn delete(&self, id: &str) -> Result<usize> {
        // 外键级联会删除消息；显式删除一遍，不依赖连接上的 PRAGMA
        self.conn
            .execute("DELETE FROM message WHERE conversation_id = ?1", [id])?;
        let rows = self.conn.execute("DELETE FROM conversation WHERE id = ?1", [id])?;
        Ok(rows)
    }

    /// 由消息表重新推导会话的派生字段：未读数、最后一条消息、更新时间
    ///
    /// 必须与引起变化的消息写入处于同一事务，未读数才不会与消息状态脱节。
    pub fn refresh(&self, id: &str, self_id: &str) -> Result<Option<Conversation>> {
        let messages = MessageDao::new(self.conn);
        let unread = messages.count_unread(id, self_id)?;
        let latest = messages.latest_in_conversation(id)?;

        match latest {
            Some(latest) => {
                self.conn.execute(
                    "UPDATE conversation
                     SET unread_count = ?2, last_message_id = ?3, updated_at = MAX(updated_at, ?4)
                     WHERE id = ?1",
                    params![id, unread, latest.reference_id(), latest.updated_at],
                )?;
            }
            None => {
                self.conn.execute(
                    "UPDATE conversation SET unread_count = ?2, last_message_id = NULL WHERE id = ?1",
                    params![id, unread],
                )?;
            }
        }
        self.get(id)
    }

    fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
        let participant_id: String = row.get(1)?;
        let snapshot_json: String = row.get(2)?;
        // 快照损坏时退化为只有 user_id 的快照
        let mut participant: ParticipantSnapshot =
            serde_json::from_str(&snapshot_json).unwrap_or_default();
        participant.user_id = participant_id;

        Ok(Conversation {
            id: row.get(0)?,
            participant,
            last_message_id: row.get(3)?,
            unread_count: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}
