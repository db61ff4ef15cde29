//! Codeguard Store - row storage for the code economy integrity engine
//!
//! SQLite-backed persistence for codes, identity signals, claims, trades,
//! animal-mode transfers, chat messages and the append-only audit trail.
//!
//! ## Architecture
//!
//! ```text
//! Engine services (registry, adjudicator, validator, sweeps)
//!     ↓
//! Table modules (codes.rs, claims.rs, trades.rs, ...)
//!     ↓
//! GuardDb (Mutex<Connection>, transactions)
//!     ↓
//! SQLite
//! ```
//!
//! Status writes are compare-and-set: every transition names the status it
//! expects to replace and reports whether exactly one row changed. Callers
//! never read a status and then write unconditionally.

pub mod audit;
pub mod balances;
pub mod claims;
pub mod codes;
pub mod db;
pub mod error;
pub mod identity;
pub mod messages;
pub mod models;
pub mod schema;
pub mod time;
pub mod trades;
pub mod transfers;
pub mod users;
pub mod watch;

pub use db::{DbStats, GuardDb};
pub use error::StoreError;
pub use models::*;
