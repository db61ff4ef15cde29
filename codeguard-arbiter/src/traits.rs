//! Core trait for claim arbiters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::evidence::ClaimEvidence;

/// Error types for arbiter calls.
#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    /// Arbiter is not available
    #[error("Arbiter unavailable: {0}")]
    Unavailable(String),

    /// Request failed
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Rate limited by the backend
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The arbiter answered but the answer is not a valid decision
    #[error("Unparsable decision: {reason}")]
    Unparsable { reason: String, raw: String },
}

impl ArbiterError {
    /// Raw arbiter output, when the arbiter got as far as answering
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            ArbiterError::Unparsable { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// A parsed decision together with the text it was parsed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterVerdict {
    pub decision: Decision,
    pub raw: String,
}

/// Decides whether a claimant may take over a disputed code.
///
/// Implementations must return an error rather than a default decision when
/// they cannot produce a well-formed answer.
#[async_trait]
pub trait Arbiter: Send + Sync {
    /// Arbiter identifier, recorded in the audit trail.
    fn id(&self) -> &str;

    /// Check if the arbiter is currently reachable.
    async fn is_available(&self) -> bool;

    /// Judge one claim.
    async fn evaluate(&self, evidence: &ClaimEvidence) -> Result<ArbiterVerdict, ArbiterError>;
}
