//! Row types and status enums.
//!
//! Status enums are stored as their snake_case text form. Findings and
//! violation details are opaque JSON to the store; the engine owns their
//! shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::InvalidValue {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum! {
    /// Lifecycle of a redemption code. `used` and `flagged` are terminal.
    CodeStatus, "code_status" {
        Unused => "unused",
        Claimed => "claimed",
        Used => "used",
        Flagged => "flagged",
    }
}

impl CodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CodeStatus::Used | CodeStatus::Flagged)
    }

    /// Statuses from which the holder may hand the code to someone else
    pub fn is_transferable(&self) -> bool {
        matches!(self, CodeStatus::Unused | CodeStatus::Claimed)
    }
}

text_enum! {
    ClaimStatus, "claim_status" {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

text_enum! {
    /// `approved` is set only by the re-audit sweep on a clean trade.
    TradeStatus, "trade_status" {
        Pending => "pending",
        Completed => "completed",
        Flagged => "flagged",
        Rejected => "rejected",
        Cancelled => "cancelled",
        Approved => "approved",
    }
}

text_enum! {
    TransferStatus, "transfer_status" {
        Pending => "pending",
        Completed => "completed",
        Rejected => "rejected",
    }
}

text_enum! {
    MessageStatus, "message_status" {
        Visible => "visible",
        Hidden => "hidden",
    }
}

text_enum! {
    ViolationKind, "violation_kind" {
        GoldFarming => "gold_farming",
        RegionChange => "region_change",
        MultipleAnimalAccounts => "multiple_animal_accounts",
        SelfTransfer => "self_transfer",
        RapidTransfer => "rapid_transfer",
    }
}

text_enum! {
    BalanceTxKind, "balance_tx_kind" {
        Redeem => "redeem",
        CodeConversion => "code_conversion",
    }
}

// ============================================================================
// Codes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRow {
    pub code: String,
    pub owner_id: String,
    pub holder_id: String,
    pub fingerprint: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub status: CodeStatus,
    pub value: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewCode {
    pub code: String,
    pub owner_id: String,
    pub fingerprint: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub value: i64,
    pub created_at: DateTime<Utc>,
}

/// Compare-and-set on a code's status and holder.
#[derive(Debug, Clone)]
pub struct CodeTransition<'a> {
    pub code: &'a str,
    /// The row must currently be in one of these statuses
    pub from_statuses: &'a [CodeStatus],
    /// If set, the row must currently be held by this user
    pub expected_holder: Option<&'a str>,
    pub to_status: CodeStatus,
    /// If set, the holder is moved to this user
    pub new_holder: Option<&'a str>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySignalRow {
    pub user_id: String,
    pub fingerprint: String,
    pub ip: String,
    pub country: Option<String>,
    pub isp: Option<String>,
    pub is_vpn: bool,
    pub region_locked_to: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatusRow {
    pub user_id: String,
    pub is_animal: bool,
    pub animal_since: Option<DateTime<Utc>>,
    pub animal_level: Option<String>,
    pub banned: bool,
    pub ban_reason: Option<String>,
    pub banned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An animal-mode user joined with its current fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct AnimalDevice {
    pub user_id: String,
    pub fingerprint: Option<String>,
    pub banned: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Claims and trades
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRow {
    pub id: String,
    pub code: String,
    pub claimant_id: String,
    pub reason: String,
    pub status: ClaimStatus,
    pub findings: serde_json::Value,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewClaim {
    pub id: String,
    pub code: String,
    pub claimant_id: String,
    pub reason: String,
    pub status: ClaimStatus,
    pub findings: serde_json::Value,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Terminal outcome written onto a pending claim or trade
#[derive(Debug, Clone)]
pub struct Resolution<S> {
    pub status: S,
    pub findings: serde_json::Value,
    pub notes: String,
    pub resolved_by: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: String,
    pub code: String,
    pub from_user: String,
    pub to_user: String,
    pub from_fingerprint: Option<String>,
    pub to_fingerprint: Option<String>,
    pub from_ip: Option<String>,
    pub to_ip: Option<String>,
    pub status: TradeStatus,
    pub findings: serde_json::Value,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub id: String,
    pub code: String,
    pub from_user: String,
    pub to_user: String,
    pub from_fingerprint: Option<String>,
    pub to_fingerprint: Option<String>,
    pub from_ip: Option<String>,
    pub to_ip: Option<String>,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Animal mode, chat, watch time
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimalTransferRow {
    pub id: String,
    pub from_user: String,
    pub to_user: String,
    pub from_fingerprint: Option<String>,
    pub to_fingerprint: Option<String>,
    pub status: TransferStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAnimalTransfer {
    pub id: String,
    pub from_user: String,
    pub to_user: String,
    pub from_fingerprint: Option<String>,
    pub to_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageRow {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub fingerprint: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub is_vpn: bool,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub fingerprint: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub is_vpn: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSessionRow {
    pub user_id: String,
    pub video_id: String,
    pub watch_minutes: i64,
    pub fingerprint: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub is_headless: bool,
    pub last_interaction: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Audit and balances
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRow {
    pub id: String,
    pub kind: ViolationKind,
    pub subject_ids: Vec<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterDecisionRow {
    pub id: String,
    pub claim_id: String,
    pub claimant_id: String,
    pub code: String,
    pub arbiter_id: String,
    pub approved: bool,
    pub reason: String,
    pub confidence: f64,
    pub raw_output: Option<String>,
    pub failure: Option<String>,
    pub evidence_digest: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceTransactionRow {
    pub id: String,
    pub user_id: String,
    pub kind: BalanceTxKind,
    pub amount: i64,
    pub balance_after: i64,
    pub code: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn column_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    column: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_roundtrip() {
        for status in TradeStatus::ALL {
            assert_eq!(status.as_str().parse::<TradeStatus>().unwrap(), *status);
        }
        assert_eq!(ViolationKind::GoldFarming.to_string(), "gold_farming");
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = "lost".parse::<CodeStatus>().unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidValue { field: "code_status", .. }
        ));
    }

    #[test]
    fn test_code_status_classes() {
        assert!(CodeStatus::Unused.is_transferable());
        assert!(CodeStatus::Claimed.is_transferable());
        assert!(!CodeStatus::Used.is_transferable());
        assert!(CodeStatus::Flagged.is_terminal());
        assert!(!CodeStatus::Claimed.is_terminal());
    }

    #[test]
    fn test_serde_matches_sql_text() {
        let json = serde_json::to_string(&ClaimStatus::Approved).unwrap();
        assert_eq!(json, "\"approved\"");
    }
}
