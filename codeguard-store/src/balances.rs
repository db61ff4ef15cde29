//! Balances and the atomic redemption procedures.
//!
//! `redeem_code` and `convert_codes` are the only paths that change a
//! balance. Each marks codes used, credits the holder and appends a ledger
//! row in one transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::codes;
use crate::error::StoreError;
use crate::models::{BalanceTransactionRow, BalanceTxKind, CodeStatus, CodeTransition};
use crate::time::{column_ts, format_ts};

/// Result of a successful redemption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub code: String,
    pub amount: i64,
    pub new_balance: i64,
}

/// Result of converting a batch of unused codes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub codes: Vec<String>,
    pub amount: i64,
    pub new_balance: i64,
}

impl BalanceTransactionRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            kind: row.get("kind")?,
            amount: row.get("amount")?,
            balance_after: row.get("balance_after")?,
            code: row.get("code")?,
            created_at: column_ts(row, "created_at")?,
        })
    }
}

/// Current balance; zero for users with no ledger entries
pub fn get_balance(conn: &Connection, user_id: &str) -> Result<i64, StoreError> {
    let balance = conn
        .query_row(
            "SELECT balance FROM balances WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0))
}

/// Ledger entries for a user, newest first
pub fn list_transactions(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<BalanceTransactionRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM balance_transactions WHERE user_id = ? ORDER BY created_at DESC, id",
    )?;
    let rows = stmt
        .query_map(params![user_id], BalanceTransactionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Redeem `code` for `user_id`.
///
/// The user must be the current holder and the code must not be terminal.
/// Either every row changes or none does.
pub fn redeem_code(
    conn: &mut Connection,
    code: &str,
    user_id: &str,
    at: &DateTime<Utc>,
) -> Result<Redemption, StoreError> {
    let tx = conn.transaction()?;

    let row = codes::get_code(&tx, code)?
        .ok_or_else(|| StoreError::NotFound(format!("code {}", code)))?;

    let moved = codes::transition(
        &tx,
        &CodeTransition {
            code,
            from_statuses: &[CodeStatus::Unused, CodeStatus::Claimed],
            expected_holder: Some(user_id),
            to_status: CodeStatus::Used,
            new_holder: None,
            at: *at,
        },
    )?;
    if !moved {
        return Err(StoreError::Conflict(format!(
            "code {} is {} and held by {}",
            code, row.status, row.holder_id
        )));
    }

    let ts = format_ts(at);
    tx.execute(
        r#"
        INSERT INTO balances (user_id, balance, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(user_id) DO UPDATE SET
            balance = balance + excluded.balance,
            updated_at = excluded.updated_at
        "#,
        params![user_id, row.value, ts],
    )?;
    let new_balance = get_balance(&tx, user_id)?;

    tx.execute(
        r#"
        INSERT INTO balance_transactions (id, user_id, kind, amount, balance_after, code, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            Uuid::new_v4().to_string(),
            user_id,
            BalanceTxKind::Redeem,
            row.value,
            new_balance,
            code,
            ts,
        ],
    )?;

    tx.commit()?;

    info!(code = %code, user_id = %user_id, amount = row.value, new_balance, "code redeemed");
    Ok(Redemption {
        code: code.to_string(),
        amount: row.value,
        new_balance,
    })
}

/// Unused codes currently held by `user_id`
pub fn unused_code_count(conn: &Connection, user_id: &str) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM codes WHERE holder_id = ? AND status = 'unused'",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Convert `count` of the user's unused codes to credits, oldest first.
///
/// Every selected code moves to `used`, the balance grows by the sum of
/// their values and a single `code_conversion` ledger row is written. If
/// fewer than `count` codes are available nothing changes.
pub fn convert_codes(
    conn: &mut Connection,
    user_id: &str,
    count: usize,
    at: &DateTime<Utc>,
) -> Result<Conversion, StoreError> {
    if count == 0 {
        return Err(StoreError::Internal("conversion needs at least one code".to_string()));
    }
    let tx = conn.transaction()?;

    let selected: Vec<(String, i64)> = {
        let mut stmt = tx.prepare(
            r#"
            SELECT code, value FROM codes
            WHERE holder_id = ? AND status = 'unused'
            ORDER BY created_at, code
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id, count as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    if selected.len() < count {
        return Err(StoreError::Conflict(format!(
            "{} holds {} unused codes, {} needed",
            user_id,
            selected.len(),
            count
        )));
    }

    for (code, _) in &selected {
        let moved = codes::transition(
            &tx,
            &CodeTransition {
                code,
                from_statuses: &[CodeStatus::Unused],
                expected_holder: Some(user_id),
                to_status: CodeStatus::Used,
                new_holder: None,
                at: *at,
            },
        )?;
        if !moved {
            return Err(StoreError::Conflict(format!("code {} changed during conversion", code)));
        }
    }

    let amount: i64 = selected.iter().map(|(_, value)| value).sum();
    let ts = format_ts(at);
    tx.execute(
        r#"
        INSERT INTO balances (user_id, balance, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(user_id) DO UPDATE SET
            balance = balance + excluded.balance,
            updated_at = excluded.updated_at
        "#,
        params![user_id, amount, ts],
    )?;
    let new_balance = get_balance(&tx, user_id)?;

    tx.execute(
        r#"
        INSERT INTO balance_transactions (id, user_id, kind, amount, balance_after, code, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
        "#,
        params![
            Uuid::new_v4().to_string(),
            user_id,
            BalanceTxKind::CodeConversion,
            amount,
            new_balance,
            ts,
        ],
    )?;

    tx.commit()?;

    info!(user_id = %user_id, codes = selected.len(), amount, new_balance, "codes converted");
    Ok(Conversion {
        codes: selected.into_iter().map(|(code, _)| code).collect(),
        amount,
        new_balance,
    })
}
