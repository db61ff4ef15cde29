//! Identity signal and region lock storage

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::StoreError;
use crate::models::IdentitySignalRow;
use crate::time::{column_ts, format_ts};

impl IdentitySignalRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            user_id: row.get("user_id")?,
            fingerprint: row.get("fingerprint")?,
            ip: row.get("ip")?,
            country: row.get("country")?,
            isp: row.get("isp")?,
            is_vpn: row.get("is_vpn")?,
            region_locked_to: row.get("region_locked_to")?,
            updated_at: column_ts(row, "updated_at")?,
        })
    }
}

/// Replace the user's current signal (latest write wins)
pub fn upsert_signal(conn: &Connection, signal: &IdentitySignalRow) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO identity_signals (
            user_id, fingerprint, ip, country, isp, is_vpn, region_locked_to, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(user_id) DO UPDATE SET
            fingerprint = excluded.fingerprint,
            ip = excluded.ip,
            country = excluded.country,
            isp = excluded.isp,
            is_vpn = excluded.is_vpn,
            region_locked_to = excluded.region_locked_to,
            updated_at = excluded.updated_at
        "#,
        params![
            signal.user_id,
            signal.fingerprint,
            signal.ip,
            signal.country,
            signal.isp,
            signal.is_vpn,
            signal.region_locked_to,
            format_ts(&signal.updated_at),
        ],
    )
    .map_err(|e| StoreError::Internal(format!("Upsert identity signal failed: {}", e)))?;

    debug!(user_id = %signal.user_id, fingerprint = %signal.fingerprint, "identity signal stored");
    Ok(())
}

/// Current signal for a user, if one has ever been captured
pub fn get_signal(conn: &Connection, user_id: &str) -> Result<Option<IdentitySignalRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM identity_signals WHERE user_id = ?",
            params![user_id],
            IdentitySignalRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Record `country` as the fingerprint's region lock if none exists.
///
/// Returns the locked country, which is the first one ever recorded.
pub fn lock_region(
    conn: &Connection,
    fingerprint: &str,
    country: &str,
    at: &DateTime<Utc>,
) -> Result<String, StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO region_locks (fingerprint, country, first_seen_at) VALUES (?, ?, ?)",
        params![fingerprint, country, format_ts(at)],
    )?;

    let locked: String = conn.query_row(
        "SELECT country FROM region_locks WHERE fingerprint = ?",
        params![fingerprint],
        |row| row.get(0),
    )?;
    Ok(locked)
}

pub fn get_region_lock(conn: &Connection, fingerprint: &str) -> Result<Option<String>, StoreError> {
    let locked = conn
        .query_row(
            "SELECT country FROM region_locks WHERE fingerprint = ?",
            params![fingerprint],
            |row| row.get(0),
        )
        .optional()?;
    Ok(locked)
}
