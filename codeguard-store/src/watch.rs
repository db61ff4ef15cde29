//! Watch-time sessions

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::models::WatchSessionRow;
use crate::time::{column_ts, format_ts};

impl WatchSessionRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            user_id: row.get("user_id")?,
            video_id: row.get("video_id")?,
            watch_minutes: row.get("watch_minutes")?,
            fingerprint: row.get("fingerprint")?,
            ip: row.get("ip")?,
            country: row.get("country")?,
            is_headless: row.get("is_headless")?,
            last_interaction: column_ts(row, "last_interaction")?,
            updated_at: column_ts(row, "updated_at")?,
        })
    }
}

/// Write the full session state
pub fn upsert_session(conn: &Connection, session: &WatchSessionRow) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO watch_sessions (
            user_id, video_id, watch_minutes, fingerprint, ip, country,
            is_headless, last_interaction, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(user_id, video_id) DO UPDATE SET
            watch_minutes = excluded.watch_minutes,
            fingerprint = excluded.fingerprint,
            ip = excluded.ip,
            country = excluded.country,
            is_headless = excluded.is_headless,
            last_interaction = excluded.last_interaction,
            updated_at = excluded.updated_at
        "#,
        params![
            session.user_id,
            session.video_id,
            session.watch_minutes,
            session.fingerprint,
            session.ip,
            session.country,
            session.is_headless,
            format_ts(&session.last_interaction),
            format_ts(&session.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_session(
    conn: &Connection,
    user_id: &str,
    video_id: &str,
) -> Result<Option<WatchSessionRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM watch_sessions WHERE user_id = ? AND video_id = ?",
            params![user_id, video_id],
            WatchSessionRow::from_row,
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::GuardDb;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn row(minutes: i64, at: DateTime<Utc>) -> WatchSessionRow {
        WatchSessionRow {
            user_id: "viewer".to_string(),
            video_id: "intro".to_string(),
            watch_minutes: minutes,
            fingerprint: Some("fp-v".to_string()),
            ip: None,
            country: None,
            is_headless: false,
            last_interaction: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_upsert_overwrites_state() {
        let db = GuardDb::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        db.with_conn(|conn| upsert_session(conn, &row(1, t0))).unwrap();
        db.with_conn(|conn| upsert_session(conn, &row(2, t0 + Duration::minutes(1))))
            .unwrap();

        let stored = db
            .with_conn(|conn| get_session(conn, "viewer", "intro"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.watch_minutes, 2);
        assert_eq!(stored.updated_at, t0 + Duration::minutes(1));
        assert!(db
            .with_conn(|conn| get_session(conn, "viewer", "other"))
            .unwrap()
            .is_none());
    }
}
