//! Trade CRUD operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::StoreError;
use crate::models::{column_json, NewTrade, Resolution, TradeRow, TradeStatus};
use crate::time::{column_opt_ts, column_ts, format_ts};

impl TradeRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            code: row.get("code")?,
            from_user: row.get("from_user")?,
            to_user: row.get("to_user")?,
            from_fingerprint: row.get("from_fingerprint")?,
            to_fingerprint: row.get("to_fingerprint")?,
            from_ip: row.get("from_ip")?,
            to_ip: row.get("to_ip")?,
            status: row.get("status")?,
            findings: column_json(row, "findings_json")?,
            resolution_notes: row.get("resolution_notes")?,
            created_at: column_ts(row, "created_at")?,
            resolved_at: column_opt_ts(row, "resolved_at")?,
        })
    }
}

pub fn insert_trade(conn: &Connection, trade: &NewTrade) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO trades (
            id, code, from_user, to_user, from_fingerprint, to_fingerprint,
            from_ip, to_ip, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            trade.id,
            trade.code,
            trade.from_user,
            trade.to_user,
            trade.from_fingerprint,
            trade.to_fingerprint,
            trade.from_ip,
            trade.to_ip,
            trade.status,
            format_ts(&trade.created_at),
        ],
    )
    .map_err(|e| StoreError::Internal(format!("Insert trade failed: {}", e)))?;

    debug!(trade_id = %trade.id, code = %trade.code, status = %trade.status, "trade stored");
    Ok(())
}

pub fn get_trade(conn: &Connection, id: &str) -> Result<Option<TradeRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM trades WHERE id = ?",
            params![id],
            TradeRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Trades where the user is either party, newest first
pub fn list_trades_for_user(conn: &Connection, user_id: &str) -> Result<Vec<TradeRow>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM trades
        WHERE from_user = ?1 OR to_user = ?1
        ORDER BY created_at DESC, id DESC
        "#,
    )?;
    let rows = stmt
        .query_map(params![user_id], TradeRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Trades in `status`, oldest first
pub fn list_trades_by_status(
    conn: &Connection,
    status: TradeStatus,
) -> Result<Vec<TradeRow>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM trades WHERE status = ? ORDER BY created_at, id")?;
    let rows = stmt
        .query_map(params![status], TradeRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Distinct trades sent by `user_id` at or after `since`
pub fn count_sent_since(
    conn: &Connection,
    user_id: &str,
    since: &DateTime<Utc>,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(DISTINCT id) FROM trades WHERE from_user = ? AND created_at >= ?",
        params![user_id, format_ts(since)],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Distinct trades received by `user_id` at or after `since`
pub fn count_received_since(
    conn: &Connection,
    user_id: &str,
    since: &DateTime<Utc>,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(DISTINCT id) FROM trades WHERE to_user = ? AND created_at >= ?",
        params![user_id, format_ts(since)],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Move a trade out of `expected`. Returns `false` if it was not in that status.
pub fn resolve_trade(
    conn: &Connection,
    id: &str,
    expected: TradeStatus,
    resolution: &Resolution<TradeStatus>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        r#"
        UPDATE trades SET
            status = ?,
            findings_json = ?,
            resolution_notes = ?,
            resolved_at = ?
        WHERE id = ? AND status = ?
        "#,
        params![
            resolution.status,
            serde_json::to_string(&resolution.findings)?,
            resolution.notes,
            format_ts(&resolution.at),
            id,
            expected,
        ],
    )?;
    Ok(changed == 1)
}

/// Cancel every pending trade where the user is either party
pub fn cancel_pending_for_user(
    conn: &Connection,
    user_id: &str,
    notes: &str,
    at: &DateTime<Utc>,
) -> Result<usize, StoreError> {
    let changed = conn.execute(
        r#"
        UPDATE trades SET status = 'cancelled', resolution_notes = ?, resolved_at = ?
        WHERE (from_user = ?3 OR to_user = ?3) AND status = 'pending'
        "#,
        params![notes, format_ts(at), user_id],
    )?;
    Ok(changed)
}

/// Cancel every pending offer on `code`. Used once the code has changed hands.
pub fn cancel_pending_for_code(
    conn: &Connection,
    code: &str,
    notes: &str,
    at: &DateTime<Utc>,
) -> Result<usize, StoreError> {
    let changed = conn.execute(
        r#"
        UPDATE trades SET status = 'cancelled', resolution_notes = ?, resolved_at = ?
        WHERE code = ? AND status = 'pending'
        "#,
        params![notes, format_ts(at), code],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::GuardDb;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn trade(id: &str, from: &str, to: &str, status: TradeStatus, minutes: i64) -> NewTrade {
        NewTrade {
            id: id.to_string(),
            code: format!("code-{id}"),
            from_user: from.to_string(),
            to_user: to.to_string(),
            from_fingerprint: Some("fp-from".to_string()),
            to_fingerprint: Some("fp-to".to_string()),
            from_ip: Some("10.0.0.1".to_string()),
            to_ip: Some("10.0.0.2".to_string()),
            status,
            created_at: t(minutes),
        }
    }

    #[test]
    fn test_history_is_newest_first_either_role() {
        let db = GuardDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_trade(conn, &trade("t1", "alice", "bob", TradeStatus::Completed, 0))?;
            insert_trade(conn, &trade("t2", "bob", "carol", TradeStatus::Completed, 5))?;
            insert_trade(conn, &trade("t3", "carol", "dave", TradeStatus::Completed, 9))?;

            let ids: Vec<_> = list_trades_for_user(conn, "bob")?
                .into_iter()
                .map(|t| t.id)
                .collect();
            assert_eq!(ids, vec!["t2", "t1"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_window_counts() {
        let db = GuardDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_trade(conn, &trade("old", "alice", "bob", TradeStatus::Completed, 0))?;
            insert_trade(conn, &trade("new1", "alice", "bob", TradeStatus::Completed, 60))?;
            insert_trade(conn, &trade("new2", "alice", "carol", TradeStatus::Flagged, 61))?;

            assert_eq!(count_sent_since(conn, "alice", &t(30))?, 2);
            assert_eq!(count_sent_since(conn, "alice", &t(0))?, 3);
            assert_eq!(count_received_since(conn, "bob", &t(30))?, 1);
            assert_eq!(count_received_since(conn, "alice", &t(0))?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_resolve_and_cancel_are_guarded() {
        let db = GuardDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_trade(conn, &trade("t1", "alice", "bob", TradeStatus::Completed, 0))?;
            insert_trade(conn, &trade("p1", "alice", "bob", TradeStatus::Pending, 1))?;
            insert_trade(conn, &trade("p2", "carol", "alice", TradeStatus::Pending, 2))?;

            let flag = Resolution {
                status: TradeStatus::Flagged,
                findings: json!([{"kind": "same_ip"}]),
                notes: "same IP".to_string(),
                resolved_by: None,
                at: t(10),
            };
            assert!(resolve_trade(conn, "t1", TradeStatus::Completed, &flag)?);
            assert!(!resolve_trade(conn, "t1", TradeStatus::Completed, &flag)?);
            assert_eq!(get_trade(conn, "t1")?.unwrap().status, TradeStatus::Flagged);

            assert_eq!(cancel_pending_for_user(conn, "alice", "banned", &t(11))?, 2);
            assert_eq!(cancel_pending_for_user(conn, "alice", "banned", &t(12))?, 0);
            assert_eq!(
                list_trades_by_status(conn, TradeStatus::Cancelled)?.len(),
                2
            );
            Ok(())
        })
        .unwrap();
    }
}
