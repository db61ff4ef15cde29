//! Claim CRUD operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::StoreError;
use crate::models::{column_json, ClaimRow, ClaimStatus, NewClaim, Resolution};
use crate::time::{column_opt_ts, column_ts, format_ts};

impl ClaimRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            code: row.get("code")?,
            claimant_id: row.get("claimant_id")?,
            reason: row.get("reason")?,
            status: row.get("status")?,
            findings: column_json(row, "findings_json")?,
            resolution_notes: row.get("resolution_notes")?,
            resolved_by: row.get("resolved_by")?,
            created_at: column_ts(row, "created_at")?,
            resolved_at: column_opt_ts(row, "resolved_at")?,
        })
    }
}

pub fn insert_claim(conn: &Connection, claim: &NewClaim) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO claims (
            id, code, claimant_id, reason, status, findings_json,
            resolution_notes, resolved_by, created_at, resolved_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            claim.id,
            claim.code,
            claim.claimant_id,
            claim.reason,
            claim.status,
            serde_json::to_string(&claim.findings)?,
            claim.resolution_notes,
            claim.resolved_by,
            format_ts(&claim.created_at),
            claim.resolved_at.as_ref().map(format_ts),
        ],
    )
    .map_err(|e| StoreError::Internal(format!("Insert claim failed: {}", e)))?;

    debug!(claim_id = %claim.id, code = %claim.code, status = %claim.status, "claim stored");
    Ok(())
}

pub fn get_claim(conn: &Connection, id: &str) -> Result<Option<ClaimRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM claims WHERE id = ?",
            params![id],
            ClaimRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// The claim for a `(code, claimant)` pair, whatever its status.
///
/// The pair is unique in the table, so there is at most one.
pub fn find_claim(
    conn: &Connection,
    code: &str,
    claimant_id: &str,
) -> Result<Option<ClaimRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM claims WHERE code = ? AND claimant_id = ?",
            params![code, claimant_id],
            ClaimRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Pending claims in submission order
pub fn list_pending_claims(conn: &Connection) -> Result<Vec<ClaimRow>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT * FROM claims WHERE status = 'pending' ORDER BY created_at, id")?;
    let rows = stmt
        .query_map([], ClaimRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A user's claims, newest first
pub fn list_claims_for_user(conn: &Connection, claimant_id: &str) -> Result<Vec<ClaimRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM claims WHERE claimant_id = ? ORDER BY created_at DESC, id",
    )?;
    let rows = stmt
        .query_map(params![claimant_id], ClaimRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Resolve a pending claim. Returns `false` if it was no longer pending.
pub fn resolve_claim(
    conn: &Connection,
    id: &str,
    resolution: &Resolution<ClaimStatus>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        r#"
        UPDATE claims SET
            status = ?,
            findings_json = ?,
            resolution_notes = ?,
            resolved_by = ?,
            resolved_at = ?
        WHERE id = ? AND status = 'pending'
        "#,
        params![
            resolution.status,
            serde_json::to_string(&resolution.findings)?,
            resolution.notes,
            resolution.resolved_by,
            format_ts(&resolution.at),
            id,
        ],
    )?;
    Ok(changed == 1)
}
