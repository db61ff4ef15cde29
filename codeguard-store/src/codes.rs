//! Code CRUD operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::StoreError;
use crate::models::{CodeRow, CodeStatus, CodeTransition, NewCode};
use crate::time::{column_opt_ts, column_ts, format_ts};

/// GLOB form of the default gold pattern `^1[A-Z0-9]{3}GO$`
pub const GOLD_GLOB: &str = "1[A-Z0-9][A-Z0-9][A-Z0-9]GO";

impl CodeRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            code: row.get("code")?,
            owner_id: row.get("owner_id")?,
            holder_id: row.get("holder_id")?,
            fingerprint: row.get("fingerprint")?,
            ip: row.get("ip")?,
            country: row.get("country")?,
            status: row.get("status")?,
            value: row.get("value")?,
            created_at: column_ts(row, "created_at")?,
            updated_at: column_ts(row, "updated_at")?,
            used_at: column_opt_ts(row, "used_at")?,
        })
    }
}

/// Insert a freshly issued code held by its owner.
///
/// Returns `false` when the identifier already exists.
pub fn insert_code(conn: &Connection, input: &NewCode) -> Result<bool, StoreError> {
    let now = format_ts(&input.created_at);
    let inserted = conn
        .execute(
            r#"
            INSERT OR IGNORE INTO codes (
                code, owner_id, holder_id, fingerprint, ip, country,
                status, value, created_at, updated_at
            ) VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
            params![
                input.code,
                input.owner_id,
                input.fingerprint,
                input.ip,
                input.country,
                CodeStatus::Unused,
                input.value,
                now,
            ],
        )
        .map_err(|e| StoreError::Internal(format!("Insert code failed: {}", e)))?;

    debug!(code = %input.code, inserted = inserted == 1, "insert_code");
    Ok(inserted == 1)
}

/// Get a code by identifier
pub fn get_code(conn: &Connection, code: &str) -> Result<Option<CodeRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM codes WHERE code = ?",
            params![code],
            CodeRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Codes issued to `owner_id` whose identifier matches a GLOB `pattern`,
/// oldest first
pub fn list_codes_for_owner_matching(
    conn: &Connection,
    owner_id: &str,
    pattern: &str,
) -> Result<Vec<CodeRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM codes WHERE owner_id = ? AND code GLOB ? ORDER BY created_at, code",
    )?;
    let rows = stmt
        .query_map(params![owner_id, pattern], CodeRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Codes currently held by `holder_id`, newest first
pub fn list_codes_held_by(conn: &Connection, holder_id: &str) -> Result<Vec<CodeRow>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT * FROM codes WHERE holder_id = ? ORDER BY created_at DESC, code")?;
    let rows = stmt
        .query_map(params![holder_id], CodeRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Atomically move a code to a new status (and optionally a new holder).
///
/// The update only applies when the row is still in one of
/// `from_statuses` and, if given, still held by `expected_holder`.
/// Returns whether exactly one row changed.
pub fn transition(conn: &Connection, t: &CodeTransition<'_>) -> Result<bool, StoreError> {
    if t.from_statuses.is_empty() {
        return Ok(false);
    }

    let placeholders = vec!["?"; t.from_statuses.len()].join(", ");
    let sql = format!(
        r#"
        UPDATE codes SET
            status = ?,
            holder_id = COALESCE(?, holder_id),
            updated_at = ?,
            used_at = CASE WHEN ? = 'used' THEN ? ELSE used_at END
        WHERE code = ?
          AND (? IS NULL OR holder_id = ?)
          AND status IN ({placeholders})
        "#
    );

    let at = format_ts(&t.at);
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![
        &t.to_status,
        &t.new_holder,
        &at,
        &t.to_status,
        &at,
        &t.code,
        &t.expected_holder,
        &t.expected_holder,
    ];
    for status in t.from_statuses {
        values.push(status);
    }

    let changed = conn.execute(&sql, values.as_slice())?;
    debug!(code = %t.code, to = %t.to_status, changed, "code transition");
    Ok(changed == 1)
}
