//! Append-only audit trail: violations and arbiter decisions.
//!
//! Nothing in this module updates or deletes rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{column_json, ArbiterDecisionRow, ViolationKind, ViolationRow};
use crate::time::{column_ts, format_ts};

impl ViolationRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            subject_ids: column_json(row, "subject_ids_json")?,
            details: column_json(row, "details_json")?,
            created_at: column_ts(row, "created_at")?,
        })
    }
}

impl ArbiterDecisionRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            claim_id: row.get("claim_id")?,
            claimant_id: row.get("claimant_id")?,
            code: row.get("code")?,
            arbiter_id: row.get("arbiter_id")?,
            approved: row.get("approved")?,
            reason: row.get("reason")?,
            confidence: row.get("confidence")?,
            raw_output: row.get("raw_output")?,
            failure: row.get("failure")?,
            evidence_digest: row.get("evidence_digest")?,
            created_at: column_ts(row, "created_at")?,
        })
    }
}

/// Append a violation and return its row
pub fn record_violation(
    conn: &Connection,
    kind: ViolationKind,
    subject_ids: &[String],
    details: serde_json::Value,
    at: &DateTime<Utc>,
) -> Result<ViolationRow, StoreError> {
    let row = ViolationRow {
        id: Uuid::new_v4().to_string(),
        kind,
        subject_ids: subject_ids.to_vec(),
        details,
        created_at: *at,
    };

    conn.execute(
        r#"
        INSERT INTO violations (id, kind, subject_ids_json, details_json, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            row.id,
            row.kind,
            serde_json::to_string(&row.subject_ids)?,
            serde_json::to_string(&row.details)?,
            format_ts(&row.created_at),
        ],
    )
    .map_err(|e| StoreError::Internal(format!("Insert violation failed: {}", e)))?;

    info!(kind = %kind, subjects = ?row.subject_ids, "violation recorded");
    Ok(row)
}

/// Violations newest first, optionally filtered by kind
pub fn list_violations(
    conn: &Connection,
    kind: Option<ViolationKind>,
    limit: u32,
) -> Result<Vec<ViolationRow>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM violations
        WHERE (?1 IS NULL OR kind = ?1)
        ORDER BY created_at DESC, id
        LIMIT ?2
        "#,
    )?;
    let rows = stmt
        .query_map(params![kind, limit], ViolationRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_violations(conn: &Connection) -> Result<i64, StoreError> {
    let count = conn.query_row("SELECT COUNT(*) FROM violations", [], |row| row.get(0))?;
    Ok(count)
}

pub fn record_decision(conn: &Connection, decision: &ArbiterDecisionRow) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO arbiter_decisions (
            id, claim_id, claimant_id, code, arbiter_id, approved, reason,
            confidence, raw_output, failure, evidence_digest, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            decision.id,
            decision.claim_id,
            decision.claimant_id,
            decision.code,
            decision.arbiter_id,
            decision.approved,
            decision.reason,
            decision.confidence,
            decision.raw_output,
            decision.failure,
            decision.evidence_digest,
            format_ts(&decision.created_at),
        ],
    )
    .map_err(|e| StoreError::Internal(format!("Insert arbiter decision failed: {}", e)))?;
    Ok(())
}

/// Arbiter decisions for a claimant, newest first
pub fn decisions_for_claimant(
    conn: &Connection,
    claimant_id: &str,
) -> Result<Vec<ArbiterDecisionRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM arbiter_decisions WHERE claimant_id = ? ORDER BY created_at DESC, id",
    )?;
    let rows = stmt
        .query_map(params![claimant_id], ArbiterDecisionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn decision_for_claim(
    conn: &Connection,
    claim_id: &str,
) -> Result<Option<ArbiterDecisionRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM arbiter_decisions WHERE claim_id = ? ORDER BY created_at DESC LIMIT 1",
            params![claim_id],
            ArbiterDecisionRow::from_row,
        )
        .optional()?;
    Ok(row)
}
