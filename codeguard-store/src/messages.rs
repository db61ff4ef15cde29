//! Chat message storage

use rusqlite::{params, Connection, Row};

use crate::error::StoreError;
use crate::models::{ChatMessageRow, MessageStatus, NewChatMessage};
use crate::time::{column_ts, format_ts};

impl ChatMessageRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            content: row.get("content")?,
            fingerprint: row.get("fingerprint")?,
            ip: row.get("ip")?,
            country: row.get("country")?,
            is_vpn: row.get("is_vpn")?,
            status: row.get("status")?,
            created_at: column_ts(row, "created_at")?,
        })
    }
}

pub fn insert_message(conn: &Connection, msg: &NewChatMessage) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO chat_messages (
            id, user_id, content, fingerprint, ip, country, is_vpn, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            msg.id,
            msg.user_id,
            msg.content,
            msg.fingerprint,
            msg.ip,
            msg.country,
            msg.is_vpn,
            MessageStatus::Visible,
            format_ts(&msg.created_at),
        ],
    )
    .map_err(|e| StoreError::Internal(format!("Insert message failed: {}", e)))?;
    Ok(())
}

/// Distinct user ids that have ever posted from `fingerprint`
pub fn distinct_posters_for_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT user_id FROM chat_messages WHERE fingerprint = ? ORDER BY user_id",
    )?;
    let rows = stmt
        .query_map(params![fingerprint], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Visible messages, newest first
pub fn recent_visible(conn: &Connection, limit: u32) -> Result<Vec<ChatMessageRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM chat_messages WHERE status = 'visible' ORDER BY created_at DESC, id LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![limit], ChatMessageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_for_user(conn: &Connection, user_id: &str) -> Result<Vec<ChatMessageRow>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT * FROM chat_messages WHERE user_id = ? ORDER BY created_at, id")?;
    let rows = stmt
        .query_map(params![user_id], ChatMessageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Hide every visible message by the user. Returns how many changed.
pub fn hide_for_user(conn: &Connection, user_id: &str) -> Result<usize, StoreError> {
    let changed = conn.execute(
        "UPDATE chat_messages SET status = 'hidden' WHERE user_id = ? AND status = 'visible'",
        params![user_id],
    )?;
    Ok(changed)
}
