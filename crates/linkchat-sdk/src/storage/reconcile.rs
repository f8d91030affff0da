//! 本地与服务端消息的对账
//!
//! 所有函数都只接受 `&Connection`，由 DbActor 包在事务里调用：
//! 消息写入与会话派生字段（未读数、最后一条消息）要么一起提交，要么一起回滚。
//!
//! 合并规则：
//! - 先按服务端 ID 去重，再按 client_id 去重
//! - 内容按 updated_at 后写者胜
//! - 本地已读不会被回退为未读
//! - 撤回/删除一旦发生，不会被普通状态覆盖
//! - 本地 Sending 记录遇到服务端回显时采用服务端 ID，状态变为 Sent

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{LinkchatSDKError, Result};
use crate::storage::dao::{ConversationDao, MessageDao};
use crate::storage::entities::{
    conversation_id, Conversation, Message, MessageStatus, ParticipantSnapshot, ReconcileOutcome,
    RemoteMessage, SendAck,
};

/// 一次已读标记的结果
#[derive(Debug, Clone, Default)]
pub struct ReadChange {
    /// 本次真正由未读变为已读的消息的服务端 ID（需要同步给服务端）
    pub message_ids: Vec<String>,
    /// 未读数发生变化的会话（已刷新）
    pub conversations: Vec<Conversation>,
    /// 标记条数
    pub marked: usize,
}

/// 写入一条本地发送的消息
///
/// client_id 已存在时直接返回已有记录，不会产生第二条。
pub fn insert_outgoing(conn: &Connection, self_id: &str, draft: &Message, now: i64) -> Result<(ReconcileOutcome, Message)> {
    if draft.sender_id != self_id {
        return Err(LinkchatSDKError::SessionMismatch {
            expected: self_id.to_string(),
            actual: draft.sender_id.clone(),
        });
    }

    let messages = MessageDao::new(conn);
    if let Some(existing) = messages.get_by_client_id(&draft.client_id)? {
        debug!("[Reconcile] client_id 已存在，复用已有记录: {}", draft.client_id);
        return Ok((ReconcileOutcome::Unchanged, existing));
    }

    let conversations = ConversationDao::new(conn);
    conversations.ensure(
        &draft.conversation_id,
        &ParticipantSnapshot {
            user_id: draft.receiver_id.clone(),
            ..Default::default()
        },
        now,
    )?;

    // 本地排序键单调递增，且不早于当前时间
    let order_seq = now.max(messages.max_order_seq()? + 1);
    let message = Message {
        status: MessageStatus::Sending,
        order_seq,
        send_attempts: 0,
        last_error: None,
        ..draft.clone()
    };
    messages.insert(&message)?;
    conversations.refresh(&message.conversation_id, self_id)?;
    Ok((ReconcileOutcome::Inserted, message))
}

/// 服务端状态在本端的含义
fn incoming_status(self_id: &str, remote: &RemoteMessage) -> MessageStatus {
    match remote.status {
        Some(status) if status.is_terminal() => status,
        _ if remote.sender_id == self_id => MessageStatus::Sent,
        Some(MessageStatus::Read) => MessageStatus::Read,
        _ => MessageStatus::Unread,
    }
}

fn merge_status(local: MessageStatus, incoming: MessageStatus, remote_newer: bool) -> MessageStatus {
    if local.is_terminal() {
        return local;
    }
    if incoming.is_terminal() || local == MessageStatus::Sending {
        return incoming;
    }
    if local == MessageStatus::Read && incoming == MessageStatus::Unread {
        return local;
    }
    if remote_newer {
        incoming
    } else {
        local
    }
}

/// 合并一条服务端消息（推送或同步）
///
/// 与本用户无关的消息被跳过并返回 None，不让一条脏数据拖垮整批同步。
pub fn apply_remote(
    conn: &Connection,
    self_id: &str,
    remote: &RemoteMessage,
    now: i64,
) -> Result<Option<(ReconcileOutcome, Message)>> {
    if remote.sender_id != self_id && remote.receiver_id != self_id {
        warn!(
            "[Reconcile] 忽略与当前用户无关的消息: id={}, {} -> {}",
            remote.id, remote.sender_id, remote.receiver_id
        );
        return Ok(None);
    }

    let conv_id = conversation_id(&remote.sender_id, &remote.receiver_id);
    let (peer, snapshot) = if remote.sender_id == self_id {
        (remote.receiver_id.clone(), None)
    } else {
        (remote.sender_id.clone(), remote.sender.clone())
    };
    let snapshot = snapshot.unwrap_or(ParticipantSnapshot {
        user_id: peer.clone(),
        ..Default::default()
    });

    let conversations = ConversationDao::new(conn);
    conversations.ensure(&conv_id, &snapshot, remote.created_at.min(now))?;

    let messages = MessageDao::new(conn);
    let client_id = remote.effective_client_id();
    let existing = match messages.get_by_server_id(&remote.id)? {
        Some(found) => Some(found),
        None => messages.get_by_client_id(&client_id)?,
    };
    let status = incoming_status(self_id, remote);

    let (outcome, stored) = match existing {
        None => {
            let message = Message {
                id: Some(remote.id.clone()),
                client_id,
                conversation_id: conv_id.clone(),
                sender_id: remote.sender_id.clone(),
                receiver_id: remote.receiver_id.clone(),
                content: remote.content.clone(),
                status,
                created_at: remote.created_at,
                updated_at: remote.updated_at,
                send_attempts: 0,
                last_error: None,
                order_seq: remote.created_at,
            };
            messages.insert(&message)?;
            (ReconcileOutcome::Inserted, message)
        }
        Some(local) => {
            let adopting = local.status == MessageStatus::Sending;
            let remote_newer = remote.updated_at >= local.updated_at;
            let mut merged = local.clone();

            if local.content != remote.content && !adopting {
                warn!(
                    "[Reconcile] 消息内容冲突，按 updated_at 取较新版本: client_id={}, local={}, remote={}",
                    local.client_id, local.updated_at, remote.updated_at
                );
            }
            if let Some(local_id) = local.id.as_deref() {
                if local_id != remote.id {
                    warn!(
                        "[Reconcile] 同一 client_id 出现两个服务端 ID: {} / {}",
                        local_id, remote.id
                    );
                }
            }

            if adopting || remote_newer {
                merged.id = Some(remote.id.clone());
                merged.content = remote.content.clone();
                merged.updated_at = remote.updated_at;
            }
            if adopting {
                merged.created_at = remote.created_at;
                merged.last_error = None;
            }
            merged.status = merge_status(local.status, status, remote_newer);

            if merged == local {
                (ReconcileOutcome::Unchanged, local)
            } else {
                messages.update(&merged)?;
                (ReconcileOutcome::Updated, merged)
            }
        }
    };

    if outcome != ReconcileOutcome::Unchanged {
        conversations.refresh(&conv_id, self_id)?;
    }
    Ok(Some((outcome, stored)))
}

/// 处理发送 ACK：采用服务端 ID，Sending → Sent
///
/// 重复 ACK 不产生变化；本地记录不存在（已被删除会话）时返回 None。
pub fn apply_ack(conn: &Connection, self_id: &str, ack: &SendAck) -> Result<Option<(ReconcileOutcome, Message)>> {
    let messages = MessageDao::new(conn);
    let Some(local) = messages.get_by_client_id(&ack.client_id)? else {
        debug!("[Reconcile] ACK 对应的本地消息不存在: {}", ack.client_id);
        return Ok(None);
    };

    if local.id.as_deref() == Some(ack.id.as_str()) && local.status != MessageStatus::Sending {
        return Ok(Some((ReconcileOutcome::Unchanged, local)));
    }

    // 同步先于 ACK 到达且服务端未回传 client_id 时，会留下一条以服务端 ID 派生的记录
    if let Some(duplicate) = messages.get_by_server_id(&ack.id)? {
        if duplicate.client_id != local.client_id {
            debug!(
                "[Reconcile] 合并同步产生的重复记录: {} -> {}",
                duplicate.client_id, local.client_id
            );
            messages.delete_by_client_id(&duplicate.client_id)?;
        }
    }

    let mut merged = local.clone();
    merged.id = Some(ack.id.clone());
    merged.created_at = ack.created_at;
    merged.updated_at = ack.updated_at.max(local.updated_at);
    merged.last_error = None;
    if merged.status == MessageStatus::Sending {
        merged.status = MessageStatus::Sent;
    }

    messages.update(&merged)?;
    ConversationDao::new(conn).refresh(&merged.conversation_id, self_id)?;
    Ok(Some((ReconcileOutcome::Updated, merged)))
}

/// 按 ID（服务端 ID 或 client_id）标记已读
pub fn mark_read(conn: &Connection, self_id: &str, ids: &[String]) -> Result<ReadChange> {
    let messages = MessageDao::new(conn);
    let mut change = ReadChange::default();
    let mut touched: Vec<String> = Vec::new();

    for id in ids {
        let Some(message) = messages.get_by_any_id(id)? else {
            continue;
        };
        if messages.mark_read(&message.client_id, self_id)? {
            change.marked += 1;
            if let Some(server_id) = message.id {
                change.message_ids.push(server_id);
            }
            if !touched.contains(&message.conversation_id) {
                touched.push(message.conversation_id);
            }
        }
    }

    let conversations = ConversationDao::new(conn);
    for conv_id in touched {
        if let Some(conversation) = conversations.refresh(&conv_id, self_id)? {
            change.conversations.push(conversation);
        }
    }
    Ok(change)
}

pub fn mark_conversation_read(conn: &Connection, self_id: &str, conv_id: &str) -> Result<ReadChange> {
    let marked = MessageDao::new(conn).mark_conversation_read(conv_id, self_id)?;
    let mut change = ReadChange {
        marked,
        ..Default::default()
    };
    if marked > 0 {
        if let Some(conversation) = ConversationDao::new(conn).refresh(conv_id, self_id)? {
            change.conversations.push(conversation);
        }
    }
    Ok(change)
}

pub fn mark_all_read(conn: &Connection, self_id: &str) -> Result<ReadChange> {
    let mut change = ReadChange::default();
    for conv_id in MessageDao::new(conn).conversations_with_unread(self_id)? {
        let one = mark_conversation_read(conn, self_id, &conv_id)?;
        change.marked += one.marked;
        change.conversations.extend(one.conversations);
    }
    Ok(change)
}

/// 撤回（本地发起或服务端广播），终态，不会再被覆盖
pub fn withdraw(conn: &Connection, self_id: &str, id: &str, updated_at: i64) -> Result<Option<Message>> {
    let messages = MessageDao::new(conn);
    let Some(mut message) = messages.get_by_any_id(id)? else {
        return Ok(None);
    };
    if message.status == MessageStatus::Withdrawn {
        return Ok(Some(message));
    }
    message.status = MessageStatus::Withdrawn;
    message.updated_at = message.updated_at.max(updated_at);
    messages.update(&message)?;
    ConversationDao::new(conn).refresh(&message.conversation_id, self_id)?;
    Ok(Some(message))
}

/// 取消一条仍在发送中的消息；已发送的消息不可取消
pub fn cancel_send(conn: &Connection, self_id: &str, client_id: &str) -> Result<Option<Message>> {
    let messages = MessageDao::new(conn);
    let Some(mut message) = messages.get_by_client_id(client_id)? else {
        return Ok(None);
    };
    if message.status != MessageStatus::Sending {
        return Err(LinkchatSDKError::InvalidOperation(format!(
            "消息 {} 当前状态为 {}，无法取消",
            client_id, message.status
        )));
    }
    messages.update_status(client_id, MessageStatus::Deleted)?;
    message.status = MessageStatus::Deleted;
    ConversationDao::new(conn).refresh(&message.conversation_id, self_id)?;
    Ok(Some(message))
}
