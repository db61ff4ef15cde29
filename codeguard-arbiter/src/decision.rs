//! Arbiter decisions and parsing of raw arbiter output.

use serde::{Deserialize, Serialize};

use crate::traits::ArbiterError;

#[cfg(feature = "typescript")]
use ts_rs::TS;

/// Reason recorded when no trustworthy decision could be obtained.
pub const MANUAL_REVIEW_REASON: &str = "manual review required";

/// Outcome of judging one claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Decision {
    pub approved: bool,
    pub reason: String,
    /// 0.0 - 1.0
    pub confidence: f64,
}

impl Decision {
    pub fn approve(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
            confidence,
        }
    }

    pub fn reject(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            confidence,
        }
    }

    /// Deterministic rejection used whenever the arbiter could not decide.
    pub fn manual_review() -> Self {
        Self::reject(MANUAL_REVIEW_REASON, 0.0)
    }

    /// Check the decision is within bounds.
    pub fn validate(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if self.reason.trim().is_empty() {
            return Err("empty reason".to_string());
        }
        Ok(())
    }
}

/// Parse raw arbiter text into a validated [`Decision`].
///
/// Accepts a bare JSON object, or one wrapped in a markdown code fence or
/// surrounding prose. Anything else is [`ArbiterError::Unparsable`].
pub fn parse_decision(raw: &str) -> Result<Decision, ArbiterError> {
    let unparsable = |reason: String| ArbiterError::Unparsable {
        reason,
        raw: raw.to_string(),
    };

    let start = raw.find('{');
    let end = raw.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => return Err(unparsable("no JSON object in response".to_string())),
    };

    let decision: Decision =
        serde_json::from_str(body).map_err(|e| unparsable(e.to_string()))?;
    decision.validate().map_err(unparsable)?;
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_plain_json() {
        let d = parse_decision(r#"{"approved": true, "reason": "same device", "confidence": 0.8}"#)
            .unwrap();
        assert!(d.approved);
        assert_eq!(d.confidence, 0.8);
    }

    #[test]
    fn test_parses_fenced_json() {
        let raw = "Here is my ruling:\n```json\n{\"approved\": false, \"reason\": \"ip differs\", \"confidence\": 0.6}\n```";
        let d = parse_decision(raw).unwrap();
        assert!(!d.approved);
        assert_eq!(d.reason, "ip differs");
    }

    #[test]
    fn test_rejects_non_conforming() {
        for raw in [
            "approve it",
            r#"{"approved": "yes", "reason": "x", "confidence": 0.5}"#,
            r#"{"approved": true, "reason": "x"}"#,
            r#"{"approved": true, "reason": "x", "confidence": 1.5}"#,
            r#"{"approved": true, "reason": "x", "confidence": -0.1}"#,
            r#"{"approved": true, "reason": "  ", "confidence": 0.5}"#,
        ] {
            let err = parse_decision(raw).unwrap_err();
            assert_eq!(err.raw_output(), Some(raw), "raw kept for {raw}");
        }
    }

    #[test]
    fn test_manual_review_never_approves() {
        let d = Decision::manual_review();
        assert!(!d.approved);
        assert_eq!(d.confidence, 0.0);
        assert_eq!(d.reason, MANUAL_REVIEW_REASON);
    }
}
