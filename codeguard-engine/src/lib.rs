//! Codeguard Engine - fraud detection and integrity adjudication
//!
//! Guards a closed economy of redeemable codes against farming, collusive
//! trades, fraudulent ownership claims and multi-account abuse.
//!
//! - **Identity**: one immutable [`SessionContext`] per session, carrying the
//!   device fingerprint and network metadata or an explicit unknown marker
//! - **Registry**: code issuance, gold-code farming detection, ownership
//!   transitions and redemption
//! - **Claims**: arbiter-judged ownership claims plus a deterministic sweep
//! - **Trades**: same-device blocking, shared-IP flagging and a re-audit sweep
//! - **Policy sweep**: multi-account bans, transfer integrity, status
//!   normalization and ban propagation
//! - **Gatekeepers**: chat posting and watch-time accounting
//!
//! ## Architecture
//!
//! ```text
//! Session ──► IdentityCollector ──► SessionContext
//!                                        │
//!        ┌──────────────┬────────────────┼──────────────┬─────────────┐
//!        ▼              ▼                ▼              ▼             ▼
//!  CodeRegistry  ClaimAdjudicator  TradeValidator  MessageGate  WatchTracker
//!        │              │ (Arbiter)      │              │             │
//!        └──────────────┴───────┬────────┴──────────────┴─────────────┘
//!                               ▼
//!                     codeguard-store (SQLite)
//!                               ▲
//!                          PolicySweep
//! ```

pub mod claims;
pub mod config;
pub mod engine;
pub mod error;
pub mod gatekeeper;
pub mod identity;
pub mod registry;
pub mod sweep;
pub mod trades;
pub mod users;

pub use claims::{ClaimAdjudicator, ClaimOutcome, ClaimSweepReport, ClaimSweepResult};
pub use config::EngineConfig;
pub use engine::{build_arbiter, IntegrityEngine, SweepKind, SweepReport};
pub use error::{GuardError, Refusal, Result};
pub use gatekeeper::{ActivitySnapshot, Badge, ClientEnvironment, MessageGate, WatchTracker};
pub use identity::{
    IdentityCollector, IdentityProvider, IdentitySignal, IdentityState, Session, SessionContext,
};
pub use registry::{CodeRegistry, FarmingAssessment, IssuedCode};
pub use sweep::{Phase, PhaseFailurePolicy, PolicySweep, SweepSummary};
pub use trades::{TradeFinding, TradeReceipt, TradeSweepReport, TradeValidator};
pub use users::UserRegistry;
