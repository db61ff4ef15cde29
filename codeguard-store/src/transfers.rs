//! Animal-power transfers

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::StoreError;
use crate::models::{AnimalTransferRow, NewAnimalTransfer, TransferStatus};
use crate::time::{column_opt_ts, column_ts, format_ts};

impl AnimalTransferRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            from_user: row.get("from_user")?,
            to_user: row.get("to_user")?,
            from_fingerprint: row.get("from_fingerprint")?,
            to_fingerprint: row.get("to_fingerprint")?,
            status: row.get("status")?,
            rejection_reason: row.get("rejection_reason")?,
            created_at: column_ts(row, "created_at")?,
            processed_at: column_opt_ts(row, "processed_at")?,
        })
    }
}

pub fn insert_transfer(conn: &Connection, transfer: &NewAnimalTransfer) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO animal_transfers (
            id, from_user, to_user, from_fingerprint, to_fingerprint, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            transfer.id,
            transfer.from_user,
            transfer.to_user,
            transfer.from_fingerprint,
            transfer.to_fingerprint,
            TransferStatus::Completed,
            format_ts(&transfer.created_at),
        ],
    )
    .map_err(|e| StoreError::Internal(format!("Insert transfer failed: {}", e)))?;
    Ok(())
}

/// All transfers, newest first
pub fn list_transfers(conn: &Connection) -> Result<Vec<AnimalTransferRow>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM animal_transfers ORDER BY created_at DESC, id")?;
    let rows = stmt
        .query_map([], AnimalTransferRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_sent_since(
    conn: &Connection,
    user_id: &str,
    since: &DateTime<Utc>,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(DISTINCT id) FROM animal_transfers WHERE from_user = ? AND created_at >= ?",
        params![user_id, format_ts(since)],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_received_since(
    conn: &Connection,
    user_id: &str,
    since: &DateTime<Utc>,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(DISTINCT id) FROM animal_transfers WHERE to_user = ? AND created_at >= ?",
        params![user_id, format_ts(since)],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Mark a transfer rejected. Returns `false` if it already was.
pub fn reject_transfer(
    conn: &Connection,
    id: &str,
    reason: &str,
    at: &DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        r#"
        UPDATE animal_transfers
        SET status = 'rejected', rejection_reason = ?, processed_at = ?
        WHERE id = ? AND status != 'rejected'
        "#,
        params![reason, format_ts(at), id],
    )?;
    Ok(changed == 1)
}
