//! Code Registry.
//!
//! Issues codes from the gold template, tracks holder and status, and
//! checks each owner's gold codes for farming after every issuance. Other
//! components move codes only through the transitions exposed here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use codeguard_store::balances::{self, Conversion, Redemption};
use codeguard_store::{
    audit, codes, BalanceTransactionRow, CodeRow, CodeStatus, CodeTransition, GuardDb, NewCode,
    ViolationKind,
};

use crate::config::RegistryConfig;
use crate::error::{GuardError, Refusal, Result};
use crate::identity::SessionContext;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Farming verdict over one owner's gold codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum FarmingAssessment {
    /// Threshold reached from a single device or a single address
    Suspicious {
        count: usize,
        distinct_fingerprints: usize,
        distinct_ips: usize,
    },
    LegitimateSet {
        count: usize,
    },
    ContinueCollecting {
        count: usize,
    },
}

impl FarmingAssessment {
    pub fn is_suspicious(&self) -> bool {
        matches!(self, FarmingAssessment::Suspicious { .. })
    }
}

/// A freshly issued code and the farming verdict it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCode {
    pub code: CodeRow,
    pub assessment: FarmingAssessment,
}

pub struct CodeRegistry {
    db: Arc<GuardDb>,
    config: RegistryConfig,
    gold: Regex,
    gold_glob: String,
}

impl CodeRegistry {
    pub fn new(db: Arc<GuardDb>, config: RegistryConfig) -> Result<Self> {
        let gold = Regex::new(&format!(
            "^{}[A-Z0-9]{{{}}}{}$",
            regex::escape(&config.gold_prefix),
            config.middle_length,
            regex::escape(&config.gold_suffix)
        ))
        .map_err(|e| GuardError::Config(format!("gold pattern: {}", e)))?;

        let gold_glob = format!(
            "{}{}{}",
            config.gold_prefix,
            "[A-Z0-9]".repeat(config.middle_length),
            config.gold_suffix
        );

        Ok(Self {
            db,
            config,
            gold,
            gold_glob,
        })
    }

    /// Whether `code` matches the gold template.
    pub fn is_gold_code(&self, code: &str) -> bool {
        self.gold.is_match(code)
    }

    /// Uppercase alphanumeric, at most the configured length.
    pub fn is_well_formed_code(&self, code: &str) -> bool {
        !code.is_empty()
            && code.len() <= self.config.max_code_length
            && code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    }

    fn random_code(&self) -> String {
        let mut rng = rand::thread_rng();
        let middle: String = (0..self.config.middle_length)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        format!("{}{}{}", self.config.gold_prefix, middle, self.config.gold_suffix)
    }

    /// Issue a new code to the session's user.
    ///
    /// Issuance never blocks on identity: an unavailable signal stores the
    /// code without fingerprint or address.
    pub fn generate_code(&self, ctx: &SessionContext) -> Result<IssuedCode> {
        let now = Utc::now();
        let signal = ctx.signal();

        for attempt in 1..=self.config.max_generation_attempts {
            let candidate = NewCode {
                code: self.random_code(),
                owner_id: ctx.user_id.clone(),
                fingerprint: signal.map(|s| s.fingerprint.clone()),
                ip: signal.map(|s| s.ip.clone()),
                country: signal.and_then(|s| s.country.clone()),
                value: self.config.code_value,
                created_at: now,
            };

            let inserted = self.db.with_conn(|conn| codes::insert_code(conn, &candidate))?;
            if !inserted {
                warn!(code = %candidate.code, attempt, "code collision, regenerating");
                continue;
            }

            info!(code = %candidate.code, owner_id = %ctx.user_id, "code issued");
            let assessment = self.assess_farming(&ctx.user_id, now)?;
            let code = self.get_code(&candidate.code)?;
            return Ok(IssuedCode { code, assessment });
        }

        Err(GuardError::Persistence(codeguard_store::StoreError::Conflict(format!(
            "no free code after {} attempts",
            self.config.max_generation_attempts
        ))))
    }

    /// Apply the farming rule to `owner_id`'s gold codes.
    ///
    /// Suspicious results are recorded as a `gold_farming` violation.
    pub fn assess_farming(&self, owner_id: &str, at: DateTime<Utc>) -> Result<FarmingAssessment> {
        let rows = self.db.with_conn(|conn| {
            codes::list_codes_for_owner_matching(conn, owner_id, &self.gold_glob)
        })?;
        let assessment = evaluate_farming(&rows, self.config.farming_threshold);

        if let FarmingAssessment::Suspicious {
            count,
            distinct_fingerprints,
            distinct_ips,
        } = &assessment
        {
            warn!(owner_id = %owner_id, count, distinct_fingerprints, distinct_ips, "gold farming suspected");
            self.db.with_conn(|conn| {
                audit::record_violation(
                    conn,
                    ViolationKind::GoldFarming,
                    &[owner_id.to_string()],
                    json!({
                        "count": count,
                        "distinct_fingerprints": distinct_fingerprints,
                        "distinct_ips": distinct_ips,
                        "codes": rows.iter().map(|r| r.code.as_str()).collect::<Vec<_>>(),
                    }),
                    &at,
                )
            })?;
        }
        Ok(assessment)
    }

    /// True iff the code exists and is not in a terminal status.
    pub fn validate_code(&self, code: &str) -> Result<bool> {
        let row = self.db.with_conn(|conn| codes::get_code(conn, code))?;
        Ok(row.map(|r| !r.status.is_terminal()).unwrap_or(false))
    }

    pub fn get_code(&self, code: &str) -> Result<CodeRow> {
        self.db
            .with_conn(|conn| codes::get_code(conn, code))?
            .ok_or_else(|| GuardError::not_found("code", code))
    }

    pub fn codes_held_by(&self, user_id: &str) -> Result<Vec<CodeRow>> {
        Ok(self.db.with_conn(|conn| codes::list_codes_held_by(conn, user_id))?)
    }

    /// Hand a code to a successful claimant.
    pub fn apply_claim(&self, code: &str, claimant_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.db
            .with_conn(|conn| apply_claim_in(conn, code, claimant_id, at))
            .map_err(GuardError::from)
            .and_then(|moved| require_moved(moved, "code", code))
    }

    /// Move a code between holders.
    pub fn transfer_holder(&self, code: &str, from: &str, to: &str, at: DateTime<Utc>) -> Result<()> {
        self.db
            .with_conn(|conn| transfer_holder_in(conn, code, from, to, at))
            .map_err(GuardError::from)
            .and_then(|moved| require_moved(moved, "code", code))
    }

    /// Redeem a held code for credits, atomically.
    pub fn redeem_code(&self, ctx: &SessionContext, code: &str) -> Result<Redemption> {
        let row = self.get_code(code)?;
        if row.holder_id != ctx.user_id {
            return Err(Refusal::NotHolder {
                code: code.to_string(),
                holder: row.holder_id,
            }
            .into());
        }
        if row.status.is_terminal() {
            return Err(Refusal::NotTransferable {
                code: code.to_string(),
                status: row.status.to_string(),
            }
            .into());
        }

        let now = Utc::now();
        self.db
            .with_conn_mut(|conn| balances::redeem_code(conn, code, &ctx.user_id, &now))
            .map_err(|e| match e {
                codeguard_store::StoreError::Conflict(_) => Refusal::RaceLost {
                    entity: "code",
                    id: code.to_string(),
                }
                .into(),
                other => GuardError::from(other),
            })
    }

    /// Unused codes the user currently holds.
    pub fn unused_code_count(&self, user_id: &str) -> Result<i64> {
        Ok(self
            .db
            .with_conn(|conn| balances::unused_code_count(conn, user_id))?)
    }

    /// Convert `count` of the session user's unused codes to credits in one
    /// ledger entry.
    pub fn convert_codes(&self, ctx: &SessionContext, count: usize) -> Result<Conversion> {
        if count == 0 {
            return Err(GuardError::InvalidInput("conversion needs at least one code".to_string()));
        }
        let available = self.unused_code_count(&ctx.user_id)?;
        if available < count as i64 {
            return Err(Refusal::InsufficientCodes {
                needed: count,
                available,
            }
            .into());
        }

        let now = Utc::now();
        self.db
            .with_conn_mut(|conn| balances::convert_codes(conn, &ctx.user_id, count, &now))
            .map_err(|e| match e {
                codeguard_store::StoreError::Conflict(_) => Refusal::RaceLost {
                    entity: "balance",
                    id: ctx.user_id.clone(),
                }
                .into(),
                other => GuardError::from(other),
            })
    }

    pub fn balance_of(&self, user_id: &str) -> Result<i64> {
        Ok(self.db.with_conn(|conn| balances::get_balance(conn, user_id))?)
    }

    pub fn transactions_of(&self, user_id: &str) -> Result<Vec<BalanceTransactionRow>> {
        Ok(self.db.with_conn(|conn| balances::list_transactions(conn, user_id))?)
    }
}

fn require_moved(moved: bool, entity: &'static str, id: &str) -> Result<()> {
    if moved {
        Ok(())
    } else {
        Err(Refusal::RaceLost {
            entity,
            id: id.to_string(),
        }
        .into())
    }
}

/// `unused|claimed -> claimed`, holder becomes the claimant.
pub(crate) fn apply_claim_in(
    conn: &Connection,
    code: &str,
    claimant_id: &str,
    at: DateTime<Utc>,
) -> std::result::Result<bool, codeguard_store::StoreError> {
    codes::transition(
        conn,
        &CodeTransition {
            code,
            from_statuses: &[CodeStatus::Unused, CodeStatus::Claimed],
            expected_holder: None,
            to_status: CodeStatus::Claimed,
            new_holder: Some(claimant_id),
            at,
        },
    )
}

/// Holder CAS: only moves if `from` still holds a transferable code.
pub(crate) fn transfer_holder_in(
    conn: &Connection,
    code: &str,
    from: &str,
    to: &str,
    at: DateTime<Utc>,
) -> std::result::Result<bool, codeguard_store::StoreError> {
    let row = codes::get_code(conn, code)?;
    let to_status = match row.map(|r| r.status) {
        Some(status) if status.is_transferable() => status,
        _ => return Ok(false),
    };
    codes::transition(
        conn,
        &CodeTransition {
            code,
            from_statuses: &[to_status],
            expected_holder: Some(from),
            to_status,
            new_holder: Some(to),
            at,
        },
    )
}

/// Pure farming rule over one owner's gold codes.
///
/// Only codes issued with both fingerprint and address known are counted.
/// Codes with missing identity neither fill the set nor narrow it, so the
/// verdict stays `ContinueCollecting` until enough fully identified codes
/// exist.
pub fn evaluate_farming(rows: &[CodeRow], threshold: usize) -> FarmingAssessment {
    let identified: Vec<(&str, &str)> = rows
        .iter()
        .filter_map(|r| Some((r.fingerprint.as_deref()?, r.ip.as_deref()?)))
        .collect();
    let count = identified.len();
    if count < threshold {
        return FarmingAssessment::ContinueCollecting { count };
    }

    let mut fingerprints: Vec<&str> = identified.iter().map(|(fp, _)| *fp).collect();
    fingerprints.sort_unstable();
    fingerprints.dedup();
    let mut ips: Vec<&str> = identified.iter().map(|(_, ip)| *ip).collect();
    ips.sort_unstable();
    ips.dedup();

    if fingerprints.len() == 1 || ips.len() == 1 {
        FarmingAssessment::Suspicious {
            count,
            distinct_fingerprints: fingerprints.len(),
            distinct_ips: ips.len(),
        }
    } else {
        FarmingAssessment::LegitimateSet { count }
    }
}
