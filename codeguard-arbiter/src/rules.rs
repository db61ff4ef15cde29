//! Deterministic claim rules.
//!
//! The same [`assess`] function backs the [`RuleBasedArbiter`] and the
//! batch claim sweep, so both paths always agree.
//!
//! - the code's original owner is always approved
//! - anyone else needs both fingerprint and IP to match the values recorded
//!   when the code was issued
//! - an unrecorded issuance value counts as a mismatch

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::evidence::ClaimEvidence;
use crate::traits::{Arbiter, ArbiterError, ArbiterVerdict};

#[cfg(feature = "typescript")]
use ts_rs::TS;

/// Machine-checkable reason a claim was approved or rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimFinding {
    OriginalOwner,
    FingerprintMatch,
    FingerprintMismatch {
        recorded: Option<String>,
        presented: String,
    },
    IpMatch,
    IpMismatch {
        recorded: Option<String>,
        presented: String,
    },
}

impl ClaimFinding {
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            ClaimFinding::FingerprintMismatch { .. } | ClaimFinding::IpMismatch { .. }
        )
    }

    /// Human-readable line for this finding.
    pub fn describe(&self) -> String {
        match self {
            ClaimFinding::OriginalOwner => "claimant is the original owner".to_string(),
            ClaimFinding::FingerprintMatch => "fingerprint matches".to_string(),
            ClaimFinding::FingerprintMismatch { recorded, presented } => format!(
                "fingerprint mismatch (recorded {}, presented {})",
                recorded.as_deref().unwrap_or("none"),
                presented
            ),
            ClaimFinding::IpMatch => "IP matches".to_string(),
            ClaimFinding::IpMismatch { recorded, presented } => format!(
                "IP mismatch (recorded {}, presented {})",
                recorded.as_deref().unwrap_or("none"),
                presented
            ),
        }
    }
}

/// Render findings to notes. Only used at the presentation boundary.
pub fn render_findings(findings: &[ClaimFinding]) -> String {
    findings
        .iter()
        .map(ClaimFinding::describe)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of applying the deterministic rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAssessment {
    pub approved: bool,
    pub findings: Vec<ClaimFinding>,
}

impl RuleAssessment {
    /// Approval for the code's original owner. Needs no device evidence.
    pub fn original_owner() -> Self {
        Self {
            approved: true,
            findings: vec![ClaimFinding::OriginalOwner],
        }
    }

    pub fn to_decision(&self) -> Decision {
        let notes = render_findings(&self.findings);
        if self.approved {
            Decision::approve(notes, 1.0)
        } else {
            Decision::reject(notes, 1.0)
        }
    }
}

/// Apply the ownership and device rules to one claim.
pub fn assess(evidence: &ClaimEvidence) -> RuleAssessment {
    if evidence.is_original_owner() {
        return RuleAssessment::original_owner();
    }

    let mut findings = Vec::with_capacity(2);

    if evidence.fingerprint_matches() {
        findings.push(ClaimFinding::FingerprintMatch);
    } else {
        findings.push(ClaimFinding::FingerprintMismatch {
            recorded: evidence.code_fingerprint.clone(),
            presented: evidence.claimant_fingerprint.clone(),
        });
    }

    if evidence.ip_matches() {
        findings.push(ClaimFinding::IpMatch);
    } else {
        findings.push(ClaimFinding::IpMismatch {
            recorded: evidence.code_ip.clone(),
            presented: evidence.claimant_ip.clone(),
        });
    }

    let approved = !findings.iter().any(ClaimFinding::is_mismatch);
    RuleAssessment { approved, findings }
}

/// Arbiter backed by [`assess`]. Never fails.
#[derive(Debug, Default, Clone)]
pub struct RuleBasedArbiter;

impl RuleBasedArbiter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Arbiter for RuleBasedArbiter {
    fn id(&self) -> &str {
        "rule-based"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn evaluate(&self, evidence: &ClaimEvidence) -> Result<ArbiterVerdict, ArbiterError> {
        let assessment = assess(evidence);
        let raw = serde_json::to_string(&assessment).map_err(|e| ArbiterError::Unparsable {
            reason: e.to_string(),
            raw: String::new(),
        })?;
        Ok(ArbiterVerdict {
            decision: assessment.to_decision(),
            raw,
        })
    }
}
