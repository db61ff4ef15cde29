//! Engine error taxonomy.

use serde::Serialize;
use thiserror::Error;

use codeguard_store::StoreError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, GuardError>;

/// Why a request was refused before any state changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Refusal {
    /// The requester does not currently hold the code
    NotHolder { code: String, holder: String },
    /// The code's status does not allow the operation
    NotTransferable { code: String, status: String },
    /// Sender and receiver present the same device fingerprint
    SameDevice,
    Banned { user_id: String },
    AnimalMode { user_id: String },
    /// More than one account has posted from this device
    MultiAccountDevice { accounts: usize },
    /// The requester is not a party to the trade
    NotParty { trade_id: String },
    /// Fewer unused codes held than a conversion asks for
    InsufficientCodes { needed: usize, available: i64 },
    /// A concurrent request changed the row first
    RaceLost { entity: &'static str, id: String },
    AlreadyResolved { entity: &'static str, id: String },
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::NotHolder { code, holder } => {
                write!(f, "code {} is held by {}", code, holder)
            }
            Refusal::NotTransferable { code, status } => {
                write!(f, "code {} is {} and cannot be transferred", code, status)
            }
            Refusal::SameDevice => write!(f, "sender and receiver share a device"),
            Refusal::Banned { user_id } => write!(f, "user {} is banned", user_id),
            Refusal::AnimalMode { user_id } => write!(f, "user {} is in animal mode", user_id),
            Refusal::MultiAccountDevice { accounts } => {
                write!(f, "{} accounts have posted from this device", accounts)
            }
            Refusal::NotParty { trade_id } => write!(f, "not a party to trade {}", trade_id),
            Refusal::InsufficientCodes { needed, available } => {
                write!(f, "{} unused codes needed, {} available", needed, available)
            }
            Refusal::RaceLost { entity, id } => {
                write!(f, "{} {} was modified concurrently", entity, id)
            }
            Refusal::AlreadyResolved { entity, id } => {
                write!(f, "{} {} is already resolved", entity, id)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum GuardError {
    /// Identity lookup failed; callers degrade instead of blocking
    #[error("Identity signal unavailable: {0}")]
    SignalUnavailable(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(Refusal),

    #[error("Arbiter failure: {0}")]
    ArbiterFailure(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GuardError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        GuardError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// The structured refusal, if this is a precondition failure.
    pub fn refusal(&self) -> Option<&Refusal> {
        match self {
            GuardError::PreconditionFailed(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Refusal> for GuardError {
    fn from(refusal: Refusal) -> Self {
        GuardError::PreconditionFailed(refusal)
    }
}
