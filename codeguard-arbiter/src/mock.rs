//! Mock arbiter for testing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::decision::{parse_decision, Decision};
use crate::evidence::ClaimEvidence;
use crate::traits::{Arbiter, ArbiterError, ArbiterVerdict};

/// Mock arbiter.
///
/// Returns a scripted raw answer (parsed like any real arbiter output), can
/// be switched off, and can stall to exercise caller timeouts.
pub struct MockArbiter {
    arbiter_id: String,
    available: AtomicBool,
    response: String,
    delay: Option<Duration>,
    call_count: AtomicU32,
}

impl MockArbiter {
    /// Create a new mock arbiter that approves everything.
    pub fn new(arbiter_id: impl Into<String>) -> Self {
        Self {
            arbiter_id: arbiter_id.into(),
            available: AtomicBool::new(true),
            response: r#"{"approved": true, "reason": "mock approval", "confidence": 0.9}"#
                .to_string(),
            delay: None,
            call_count: AtomicU32::new(0),
        }
    }

    /// Set the raw response text.
    pub fn with_response(mut self, raw: impl Into<String>) -> Self {
        self.response = raw.into();
        self
    }

    /// Respond with a well-formed decision.
    pub fn with_decision(self, decision: &Decision) -> Self {
        let raw = serde_json::to_string(decision).unwrap_or_default();
        self.with_response(raw)
    }

    /// Set availability.
    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Get the number of times evaluate was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl Default for MockArbiter {
    fn default() -> Self {
        Self::new("mock-arbiter")
    }
}

#[async_trait]
impl Arbiter for MockArbiter {
    fn id(&self) -> &str {
        &self.arbiter_id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn evaluate(&self, _evidence: &ClaimEvidence) -> Result<ArbiterVerdict, ArbiterError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(ArbiterError::Unavailable("Mock arbiter disabled".to_string()));
        }

        let decision = parse_decision(&self.response)?;
        Ok(ArbiterVerdict {
            decision,
            raw: self.response.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence() -> ClaimEvidence {
        ClaimEvidence {
            claimant_id: "bob".to_string(),
            code: "1ABCGO".to_string(),
            code_owner_id: "alice".to_string(),
            code_fingerprint: None,
            code_ip: None,
            claimant_fingerprint: "fp".to_string(),
            claimant_ip: "10.0.0.1".to_string(),
            reason: "mine".to_string(),
        }
    }

    #[tokio::test]
    async fn test_mock_arbiter() {
        let arbiter = MockArbiter::new("test").with_decision(&Decision::reject("nope", 0.7));

        assert!(arbiter.is_available().await);
        assert_eq!(arbiter.call_count(), 0);

        let verdict = arbiter.evaluate(&evidence()).await.unwrap();
        assert!(!verdict.decision.approved);
        assert_eq!(verdict.decision.reason, "nope");
        assert_eq!(arbiter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let arbiter = MockArbiter::default().with_available(false);
        assert!(!arbiter.is_available().await);
        let result = arbiter.evaluate(&evidence()).await;
        assert!(matches!(result, Err(ArbiterError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_mock_garbage_is_unparsable() {
        let arbiter = MockArbiter::default().with_response("sure, approve");
        let err = arbiter.evaluate(&evidence()).await.unwrap_err();
        assert_eq!(err.raw_output(), Some("sure, approve"));
    }
}
