//! Behavioral Gatekeepers.
//!
//! Chat posting and watch-time accounting, both gated on the session's
//! identity context.

pub mod messages;
pub mod watch;

pub use messages::{Badge, MessageGate};
pub use watch::{ActivitySnapshot, ClientEnvironment, TickOutcome, WatchTracker};
