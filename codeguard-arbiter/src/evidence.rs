//! Evidence bundle handed to an arbiter.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[cfg(feature = "typescript")]
use ts_rs::TS;

/// Everything an arbiter is told about a claim.
///
/// Code-side values are optional: the issuing session may not have produced
/// an identity signal. Claimant-side values are always known by the time an
/// arbiter is consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ClaimEvidence {
    pub claimant_id: String,
    pub code: String,
    pub code_owner_id: String,
    pub code_fingerprint: Option<String>,
    pub code_ip: Option<String>,
    pub claimant_fingerprint: String,
    pub claimant_ip: String,
    pub reason: String,
}

impl ClaimEvidence {
    /// Whether the claimant is the code's original owner.
    pub fn is_original_owner(&self) -> bool {
        self.claimant_id == self.code_owner_id
    }

    pub fn fingerprint_matches(&self) -> bool {
        self.code_fingerprint.as_deref() == Some(self.claimant_fingerprint.as_str())
    }

    pub fn ip_matches(&self) -> bool {
        self.code_ip.as_deref() == Some(self.claimant_ip.as_str())
    }

    /// Hex SHA-256 of the JSON encoding, stored alongside each decision.
    pub fn digest(&self) -> String {
        // Struct field order is fixed, so the encoding is stable
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}
