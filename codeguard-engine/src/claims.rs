//! Claim Adjudicator.
//!
//! Single claims go to the configured arbiter under a timeout. The batch
//! sweep applies the deterministic rules to every pending claim and isolates
//! per-claim failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use codeguard_arbiter::{
    assess, render_findings, Arbiter, ClaimEvidence, ClaimFinding, Decision, RuleAssessment,
};
use codeguard_store::{
    audit, claims, codes, identity, ArbiterDecisionRow, ClaimRow, ClaimStatus, CodeRow, GuardDb,
    NewClaim, Resolution, StoreError,
};

use crate::error::{GuardError, Refusal, Result};
use crate::identity::{IdentitySignal, SessionContext};
use crate::registry::apply_claim_in;

const SWEEP_RESOLVER: &str = "claim-sweep";
const OWNER_RULE: &str = "original-owner";

/// The claim being judged: a stored pending row, or one about to be inserted.
struct PendingClaim {
    id: String,
    stored: bool,
    code: String,
    claimant_id: String,
    reason: String,
}

/// Answer to a claim submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub claim_id: String,
    pub status: ClaimStatus,
    pub decision: Decision,
    pub findings: Vec<ClaimFinding>,
    /// The pair was already resolved; nothing was re-evaluated
    pub resubmission: bool,
}

/// Per-claim result of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ClaimSweepResult {
    Approved { findings: Vec<ClaimFinding> },
    Rejected { findings: Vec<ClaimFinding> },
    /// Resolved by someone else between listing and writing
    Skipped,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSweepItem {
    pub claim_id: String,
    pub code: String,
    pub claimant_id: String,
    #[serde(flatten)]
    pub result: ClaimSweepResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimSweepReport {
    pub processed: usize,
    pub approved: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub errors: usize,
    pub results: Vec<ClaimSweepItem>,
}

pub struct ClaimAdjudicator {
    db: Arc<GuardDb>,
    arbiter: Arc<dyn Arbiter>,
    arbiter_timeout: Duration,
}

impl ClaimAdjudicator {
    pub fn new(db: Arc<GuardDb>, arbiter: Arc<dyn Arbiter>, arbiter_timeout: Duration) -> Self {
        Self {
            db,
            arbiter,
            arbiter_timeout,
        }
    }

    pub fn arbiter_id(&self) -> &str {
        self.arbiter.id()
    }

    /// Judge a claim on `code` by the session's user.
    ///
    /// A `(code, claimant)` pair has at most one claim. A resolved one is
    /// returned as is; a pending one (filed earlier) is resolved in place.
    pub async fn submit_claim(
        &self,
        ctx: &SessionContext,
        code: &str,
        reason: &str,
    ) -> Result<ClaimOutcome> {
        if reason.trim().is_empty() {
            return Err(GuardError::InvalidInput("claim reason is empty".to_string()));
        }
        let claimant = ctx.user_id.as_str();
        let code_row = self
            .db
            .with_conn(|conn| codes::get_code(conn, code))?
            .ok_or_else(|| GuardError::not_found("code", code))?;

        let existing = self
            .db
            .with_conn(|conn| claims::find_claim(conn, code, claimant))?;
        if let Some(previous) = existing.as_ref().filter(|c| c.status != ClaimStatus::Pending) {
            debug!(claim_id = %previous.id, code = %code, "claim already resolved");
            return self.stored_outcome(previous.clone());
        }

        if !code_row.status.is_transferable() {
            return Err(Refusal::NotTransferable {
                code: code.to_string(),
                status: code_row.status.to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let pending = PendingClaim {
            id: existing
                .as_ref()
                .map(|c| c.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            stored: existing.is_some(),
            code: code.to_string(),
            claimant_id: claimant.to_string(),
            reason: reason.to_string(),
        };

        if code_row.owner_id == claimant {
            return self.approve_owner(&pending, now);
        }

        let signal = match ctx.signal() {
            Some(signal) => Some(signal.clone()),
            None => self
                .db
                .with_conn(|conn| identity::get_signal(conn, claimant))?
                .map(IdentitySignal::from),
        };
        let Some(signal) = signal else {
            return self.queue_unidentified(&pending, now);
        };

        let evidence = build_evidence(&code_row, &signal, reason);
        let findings = assess(&evidence).findings;

        let (decision, raw_output, failure) =
            match timeout(self.arbiter_timeout, self.arbiter.evaluate(&evidence)).await {
                Ok(Ok(verdict)) => (verdict.decision, Some(verdict.raw), None),
                Ok(Err(e)) => {
                    warn!(claim_id = %pending.id, arbiter = %self.arbiter.id(), error = %e, "arbiter failed");
                    (
                        Decision::manual_review(),
                        e.raw_output().map(str::to_string),
                        Some(e.to_string()),
                    )
                }
                Err(_) => {
                    warn!(claim_id = %pending.id, arbiter = %self.arbiter.id(), "arbiter timed out");
                    (
                        Decision::manual_review(),
                        None,
                        Some(format!("timed out after {:?}", self.arbiter_timeout)),
                    )
                }
            };

        let audit_row = ArbiterDecisionRow {
            id: Uuid::new_v4().to_string(),
            claim_id: pending.id.clone(),
            claimant_id: claimant.to_string(),
            code: code.to_string(),
            arbiter_id: self.arbiter.id().to_string(),
            approved: decision.approved,
            reason: decision.reason.clone(),
            confidence: decision.confidence,
            raw_output,
            failure,
            evidence_digest: evidence.digest(),
            created_at: now,
        };
        self.db.with_conn(|conn| audit::record_decision(conn, &audit_row))?;

        let status = self.persist_decision(&pending, &decision, &findings, self.arbiter.id(), now)?;
        info!(
            claim_id = %pending.id,
            code = %code,
            claimant_id = %claimant,
            approved = decision.approved,
            confidence = decision.confidence,
            "claim adjudicated"
        );
        Ok(ClaimOutcome {
            claim_id: pending.id,
            status,
            decision,
            findings,
            resubmission: false,
        })
    }

    /// Store a claim for the batch sweep without judging it now.
    ///
    /// Filing again for the same code returns the existing claim.
    pub fn file_claim(&self, ctx: &SessionContext, code: &str, reason: &str) -> Result<ClaimRow> {
        if reason.trim().is_empty() {
            return Err(GuardError::InvalidInput("claim reason is empty".to_string()));
        }
        let claimant = ctx.user_id.as_str();
        self.db
            .with_conn(|conn| codes::get_code(conn, code))?
            .ok_or_else(|| GuardError::not_found("code", code))?;

        if let Some(previous) = self
            .db
            .with_conn(|conn| claims::find_claim(conn, code, claimant))?
        {
            debug!(claim_id = %previous.id, code = %code, status = %previous.status, "claim already filed");
            return Ok(previous);
        }

        let claim = NewClaim {
            id: Uuid::new_v4().to_string(),
            code: code.to_string(),
            claimant_id: claimant.to_string(),
            reason: reason.to_string(),
            status: ClaimStatus::Pending,
            findings: serde_json::Value::Array(Vec::new()),
            resolution_notes: None,
            resolved_by: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.db.with_conn(|conn| claims::insert_claim(conn, &claim))?;
        self.get_claim(&claim.id)
    }

    pub fn get_claim(&self, claim_id: &str) -> Result<ClaimRow> {
        self.db
            .with_conn(|conn| claims::get_claim(conn, claim_id))?
            .ok_or_else(|| GuardError::not_found("claim", claim_id))
    }

    /// A user's claims, newest first.
    pub fn claims_for_user(&self, user_id: &str) -> Result<Vec<ClaimRow>> {
        Ok(self.db.with_conn(|conn| claims::list_claims_for_user(conn, user_id))?)
    }

    /// Arbiter audit trail for a user, newest first.
    pub fn decisions_for_user(&self, user_id: &str) -> Result<Vec<ArbiterDecisionRow>> {
        Ok(self.db.with_conn(|conn| audit::decisions_for_claimant(conn, user_id))?)
    }

    /// Resolve every pending claim with the deterministic rules.
    pub fn sweep_pending_claims(&self, now: DateTime<Utc>) -> Result<ClaimSweepReport> {
        let pending = self.db.with_conn(claims::list_pending_claims)?;
        info!(count = pending.len(), "claim sweep started");

        let mut report = ClaimSweepReport::default();
        for claim in pending {
            let result = match self.sweep_one(&claim, now) {
                Ok(result) => result,
                Err(e) => {
                    warn!(claim_id = %claim.id, error = %e, "claim sweep item failed");
                    ClaimSweepResult::Error {
                        message: e.to_string(),
                    }
                }
            };

            report.processed += 1;
            match &result {
                ClaimSweepResult::Approved { .. } => report.approved += 1,
                ClaimSweepResult::Rejected { .. } => report.rejected += 1,
                ClaimSweepResult::Skipped => report.skipped += 1,
                ClaimSweepResult::Error { .. } => report.errors += 1,
            }
            report.results.push(ClaimSweepItem {
                claim_id: claim.id,
                code: claim.code,
                claimant_id: claim.claimant_id,
                result,
            });
        }

        info!(
            processed = report.processed,
            approved = report.approved,
            rejected = report.rejected,
            errors = report.errors,
            "claim sweep finished"
        );
        Ok(report)
    }

    fn sweep_one(&self, claim: &ClaimRow, now: DateTime<Utc>) -> Result<ClaimSweepResult> {
        let code_row = self
            .db
            .with_conn(|conn| codes::get_code(conn, &claim.code))?
            .ok_or_else(|| GuardError::not_found("code", &claim.code))?;
        let assessment = if code_row.owner_id == claim.claimant_id {
            RuleAssessment::original_owner()
        } else {
            let signal = self
                .db
                .with_conn(|conn| identity::get_signal(conn, &claim.claimant_id))?
                .map(IdentitySignal::from)
                .ok_or_else(|| {
                    GuardError::SignalUnavailable(format!(
                        "no identity signal recorded for {}",
                        claim.claimant_id
                    ))
                })?;
            assess(&build_evidence(&code_row, &signal, &claim.reason))
        };
        let approved = assessment.approved;
        if approved && !code_row.status.is_transferable() {
            return Err(Refusal::NotTransferable {
                code: code_row.code,
                status: code_row.status.to_string(),
            }
            .into());
        }

        let status = if approved {
            ClaimStatus::Approved
        } else {
            ClaimStatus::Rejected
        };
        let resolution = Resolution {
            status,
            findings: serde_json::to_value(&assessment.findings).map_err(StoreError::from)?,
            notes: format!("{} by claim sweep", status),
            resolved_by: Some(SWEEP_RESOLVER.to_string()),
            at: now,
        };

        let outcome = self.db.with_transaction(|tx| {
            if !claims::resolve_claim(tx, &claim.id, &resolution)? {
                return Ok(false);
            }
            if approved && !apply_claim_in(tx, &claim.code, &claim.claimant_id, now)? {
                return Err(StoreError::Conflict(format!("code {} moved during sweep", claim.code)));
            }
            Ok(true)
        });

        match outcome {
            Ok(false) => Ok(ClaimSweepResult::Skipped),
            Ok(true) if approved => Ok(ClaimSweepResult::Approved {
                findings: assessment.findings,
            }),
            Ok(true) => Ok(ClaimSweepResult::Rejected {
                findings: assessment.findings,
            }),
            Err(StoreError::Conflict(_)) => Err(Refusal::RaceLost {
                entity: "code",
                id: claim.code.clone(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// The original owner is approved without consulting identity or the
    /// arbiter.
    fn approve_owner(&self, pending: &PendingClaim, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let assessment = RuleAssessment::original_owner();
        let decision = assessment.to_decision();
        self.db.with_conn(|conn| {
            audit::record_decision(conn, &rule_decision_row(pending, OWNER_RULE, &decision, None, now))
        })?;
        let status = self.persist_decision(pending, &decision, &assessment.findings, OWNER_RULE, now)?;

        info!(claim_id = %pending.id, code = %pending.code, claimant_id = %pending.claimant_id, "original owner claim approved");
        Ok(ClaimOutcome {
            claim_id: pending.id.clone(),
            status,
            decision,
            findings: assessment.findings,
            resubmission: false,
        })
    }

    /// Identity unknown everywhere: keep the claim pending for the sweep.
    fn queue_unidentified(&self, pending: &PendingClaim, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let decision = Decision::reject("identity unavailable; queued for review", 0.0);

        if !pending.stored {
            let claim = NewClaim {
                id: pending.id.clone(),
                code: pending.code.clone(),
                claimant_id: pending.claimant_id.clone(),
                reason: pending.reason.clone(),
                status: ClaimStatus::Pending,
                findings: serde_json::Value::Array(Vec::new()),
                resolution_notes: None,
                resolved_by: None,
                created_at: now,
                resolved_at: None,
            };
            let audit_row = rule_decision_row(
                pending,
                "none",
                &decision,
                Some("claimant identity unavailable".to_string()),
                now,
            );
            self.db.with_transaction(|tx| {
                audit::record_decision(tx, &audit_row)?;
                claims::insert_claim(tx, &claim)
            })?;
        }

        info!(claim_id = %pending.id, code = %pending.code, "claim queued without identity");
        Ok(ClaimOutcome {
            claim_id: pending.id.clone(),
            status: ClaimStatus::Pending,
            decision,
            findings: Vec::new(),
            resubmission: false,
        })
    }

    /// Write the resolution: resolve the stored pending row, or insert a
    /// resolved one. Approval moves the code in the same transaction.
    fn persist_decision(
        &self,
        pending: &PendingClaim,
        decision: &Decision,
        findings: &[ClaimFinding],
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimStatus> {
        let status = if decision.approved {
            ClaimStatus::Approved
        } else {
            ClaimStatus::Rejected
        };
        let findings = serde_json::to_value(findings).map_err(StoreError::from)?;

        let written = self.db.with_transaction(|tx| {
            if pending.stored {
                let resolution = Resolution {
                    status,
                    findings: findings.clone(),
                    notes: decision.reason.clone(),
                    resolved_by: Some(resolved_by.to_string()),
                    at: now,
                };
                if !claims::resolve_claim(tx, &pending.id, &resolution)? {
                    return Err(StoreError::Conflict(format!("claim {} resolved meanwhile", pending.id)));
                }
            } else {
                claims::insert_claim(
                    tx,
                    &NewClaim {
                        id: pending.id.clone(),
                        code: pending.code.clone(),
                        claimant_id: pending.claimant_id.clone(),
                        reason: pending.reason.clone(),
                        status,
                        findings: findings.clone(),
                        resolution_notes: Some(decision.reason.clone()),
                        resolved_by: Some(resolved_by.to_string()),
                        created_at: now,
                        resolved_at: Some(now),
                    },
                )?;
            }
            if decision.approved && !apply_claim_in(tx, &pending.code, &pending.claimant_id, now)? {
                return Err(StoreError::Conflict(format!("code {} moved during claim", pending.code)));
            }
            Ok(())
        });

        match written {
            Ok(()) => Ok(status),
            Err(StoreError::Conflict(_)) => Err(Refusal::RaceLost {
                entity: "code",
                id: pending.code.clone(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    fn stored_outcome(&self, claim: ClaimRow) -> Result<ClaimOutcome> {
        let findings: Vec<ClaimFinding> =
            serde_json::from_value(claim.findings.clone()).map_err(StoreError::from)?;
        let decision = match self
            .db
            .with_conn(|conn| audit::decision_for_claim(conn, &claim.id))?
        {
            Some(row) => Decision {
                approved: row.approved,
                reason: row.reason,
                confidence: row.confidence,
            },
            None => Decision {
                approved: claim.status == ClaimStatus::Approved,
                reason: render_findings(&findings),
                confidence: 1.0,
            },
        };

        Ok(ClaimOutcome {
            claim_id: claim.id,
            status: claim.status,
            decision,
            findings,
            resubmission: true,
        })
    }
}

/// Human-readable notes for a stored claim.
pub fn describe_claim(claim: &ClaimRow) -> String {
    match serde_json::from_value::<Vec<ClaimFinding>>(claim.findings.clone()) {
        Ok(findings) if !findings.is_empty() => render_findings(&findings),
        _ => claim.resolution_notes.clone().unwrap_or_default(),
    }
}

fn build_evidence(code: &CodeRow, claimant: &IdentitySignal, reason: &str) -> ClaimEvidence {
    ClaimEvidence {
        claimant_id: claimant.user_id.clone(),
        code: code.code.clone(),
        code_owner_id: code.owner_id.clone(),
        code_fingerprint: code.fingerprint.clone(),
        code_ip: code.ip.clone(),
        claimant_fingerprint: claimant.fingerprint.clone(),
        claimant_ip: claimant.ip.clone(),
        reason: reason.to_string(),
    }
}

fn rule_decision_row(
    pending: &PendingClaim,
    arbiter_id: &str,
    decision: &Decision,
    failure: Option<String>,
    at: DateTime<Utc>,
) -> ArbiterDecisionRow {
    ArbiterDecisionRow {
        id: Uuid::new_v4().to_string(),
        claim_id: pending.id.clone(),
        claimant_id: pending.claimant_id.clone(),
        code: pending.code.clone(),
        arbiter_id: arbiter_id.to_string(),
        approved: decision.approved,
        reason: decision.reason.clone(),
        confidence: decision.confidence,
        raw_output: None,
        failure,
        evidence_digest: String::new(),
        created_at: at,
    }
}
