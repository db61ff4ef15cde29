//! User status: animal mode and bans
//!
//! Animal mode and bans are one-way. Every write here is guarded so that
//! re-applying it leaves the row untouched and reports `false`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{AnimalDevice, UserStatusRow};
use crate::time::{column_opt_ts, column_ts, format_ts};

impl UserStatusRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            user_id: row.get("user_id")?,
            is_animal: row.get("is_animal")?,
            animal_since: column_opt_ts(row, "animal_since")?,
            animal_level: row.get("animal_level")?,
            banned: row.get("banned")?,
            ban_reason: row.get("ban_reason")?,
            banned_at: column_opt_ts(row, "banned_at")?,
            created_at: column_ts(row, "created_at")?,
        })
    }
}

/// Create a status row if missing. Returns whether one was created.
pub fn ensure_user(conn: &Connection, user_id: &str, at: &DateTime<Utc>) -> Result<bool, StoreError> {
    let created = conn.execute(
        "INSERT OR IGNORE INTO user_status (user_id, created_at) VALUES (?, ?)",
        params![user_id, format_ts(at)],
    )?;
    Ok(created == 1)
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<UserStatusRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM user_status WHERE user_id = ?",
            params![user_id],
            UserStatusRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Switch a user into animal mode. Never reverts.
pub fn enter_animal_mode(
    conn: &Connection,
    user_id: &str,
    level: &str,
    at: &DateTime<Utc>,
) -> Result<bool, StoreError> {
    ensure_user(conn, user_id, at)?;
    let changed = conn.execute(
        r#"
        UPDATE user_status
        SET is_animal = 1, animal_since = ?, animal_level = ?
        WHERE user_id = ? AND is_animal = 0
        "#,
        params![format_ts(at), level, user_id],
    )?;
    Ok(changed == 1)
}

/// Animal-mode users with their current fingerprint.
///
/// Ordered by account creation time, then user id.
pub fn list_animal_devices(conn: &Connection) -> Result<Vec<AnimalDevice>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT u.user_id, s.fingerprint, u.banned, u.created_at
        FROM user_status u
        LEFT JOIN identity_signals s ON s.user_id = u.user_id
        WHERE u.is_animal = 1
        ORDER BY u.created_at, u.user_id
        "#,
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AnimalDevice {
                user_id: row.get("user_id")?,
                fingerprint: row.get("fingerprint")?,
                banned: row.get("banned")?,
                created_at: column_ts(row, "created_at")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Animal-mode users missing their animal-since timestamp
pub fn list_animal_without_since(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM user_status WHERE is_animal = 1 AND animal_since IS NULL ORDER BY user_id",
    )?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Fill in animal-since and level for one user if still missing
pub fn backfill_animal_since(
    conn: &Connection,
    user_id: &str,
    level: &str,
    at: &DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        r#"
        UPDATE user_status
        SET animal_since = ?, animal_level = COALESCE(animal_level, ?)
        WHERE user_id = ? AND is_animal = 1 AND animal_since IS NULL
        "#,
        params![format_ts(at), level, user_id],
    )?;
    Ok(changed == 1)
}

pub fn count_animal_users(conn: &Connection) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM user_status WHERE is_animal = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn list_banned_users(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM user_status WHERE banned = 1 ORDER BY user_id")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

pub fn is_banned(conn: &Connection, user_id: &str) -> Result<bool, StoreError> {
    let banned = conn
        .query_row(
            "SELECT banned FROM user_status WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(banned.unwrap_or(false))
}

/// Ban a user. Returns `false` if they were already banned.
pub fn ban_user(
    conn: &Connection,
    user_id: &str,
    reason: &str,
    at: &DateTime<Utc>,
) -> Result<bool, StoreError> {
    ensure_user(conn, user_id, at)?;
    let changed = conn.execute(
        r#"
        UPDATE user_status
        SET banned = 1, ban_reason = ?, banned_at = ?
        WHERE user_id = ? AND banned = 0
        "#,
        params![reason, format_ts(at), user_id],
    )?;
    if changed == 1 {
        info!(user_id = %user_id, reason = %reason, "user banned");
    } else {
        debug!(user_id = %user_id, "already banned");
    }
    Ok(changed == 1)
}
