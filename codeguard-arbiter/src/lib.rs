//! Codeguard Arbiter - pluggable judgement for disputed code claims
//!
//! A claim dispute is summarized as a [`ClaimEvidence`] bundle and handed to
//! an [`Arbiter`], which answers with a [`Decision`]. Callers depend only on
//! the trait:
//!
//! - [`RuleBasedArbiter`]: deterministic owner/fingerprint/IP rules
//! - [`OpenAiArbiter`]: externally scored through any OpenAI-compatible API
//! - [`MockArbiter`]: scripted answers and failures for tests
//!
//! Anything that does not parse into a valid decision is an
//! [`ArbiterError`], never an implicit approval.

pub mod decision;
pub mod evidence;
pub mod mock;
pub mod openai;
pub mod rules;
pub mod traits;

pub use decision::{parse_decision, Decision, MANUAL_REVIEW_REASON};
pub use evidence::ClaimEvidence;
pub use mock::MockArbiter;
pub use openai::OpenAiArbiter;
pub use rules::{assess, render_findings, ClaimFinding, RuleAssessment, RuleBasedArbiter};
pub use traits::{Arbiter, ArbiterError, ArbiterVerdict};
