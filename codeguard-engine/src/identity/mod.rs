//! Identity Signal Collector.
//!
//! Turns a session into an immutable [`SessionContext`] holding the
//! device fingerprint and network metadata, or an explicit unavailable
//! marker. The context is built once per session and passed to every
//! operation that needs identity.

pub mod collector;
pub mod provider;

pub use collector::IdentityCollector;
pub use provider::{
    GeoInfo, HttpIdentityProvider, IdentityProvider, ProviderError, StaticIdentityProvider,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use codeguard_store::IdentitySignalRow;

/// What the caller knows about an incoming request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub client_ip: String,
    /// Client-reported device fingerprint
    pub visitor_id: Option<String>,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        client_ip: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            client_ip: client_ip.into(),
            visitor_id: None,
        }
    }

    pub fn with_visitor_id(mut self, visitor_id: impl Into<String>) -> Self {
        self.visitor_id = Some(visitor_id.into());
        self
    }
}

/// Device and network identity for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignal {
    pub user_id: String,
    pub fingerprint: String,
    pub ip: String,
    pub country: Option<String>,
    pub isp: Option<String>,
    pub is_vpn: bool,
    /// First country ever seen for this fingerprint
    pub region_locked_to: Option<String>,
}

impl IdentitySignal {
    /// Whether the current country differs from the region lock.
    pub fn region_changed(&self) -> bool {
        match (&self.country, &self.region_locked_to) {
            (Some(country), Some(locked)) => country != locked,
            _ => false,
        }
    }

    pub(crate) fn to_row(&self, at: DateTime<Utc>) -> IdentitySignalRow {
        IdentitySignalRow {
            user_id: self.user_id.clone(),
            fingerprint: self.fingerprint.clone(),
            ip: self.ip.clone(),
            country: self.country.clone(),
            isp: self.isp.clone(),
            is_vpn: self.is_vpn,
            region_locked_to: self.region_locked_to.clone(),
            updated_at: at,
        }
    }
}

impl From<IdentitySignalRow> for IdentitySignal {
    fn from(row: IdentitySignalRow) -> Self {
        Self {
            user_id: row.user_id,
            fingerprint: row.fingerprint,
            ip: row.ip,
            country: row.country,
            isp: row.isp,
            is_vpn: row.is_vpn,
            region_locked_to: row.region_locked_to,
        }
    }
}

/// Outcome of identity capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdentityState {
    Known(IdentitySignal),
    /// Lookup failed. A weaker signal, never grounds for rejection on its own.
    Unavailable { reason: String },
}

/// Immutable per-session identity context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: String,
    pub identity: IdentityState,
    pub captured_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn known(session_id: impl Into<String>, signal: IdentitySignal) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: signal.user_id.clone(),
            identity: IdentityState::Known(signal),
            captured_at: Utc::now(),
        }
    }

    pub fn unavailable(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            identity: IdentityState::Unavailable {
                reason: reason.into(),
            },
            captured_at: Utc::now(),
        }
    }

    pub fn signal(&self) -> Option<&IdentitySignal> {
        match &self.identity {
            IdentityState::Known(signal) => Some(signal),
            IdentityState::Unavailable { .. } => None,
        }
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.signal().map(|s| s.fingerprint.as_str())
    }

    pub fn ip(&self) -> Option<&str> {
        self.signal().map(|s| s.ip.as_str())
    }

    pub fn country(&self) -> Option<&str> {
        self.signal().and_then(|s| s.country.as_deref())
    }

    pub fn is_vpn(&self) -> bool {
        self.signal().map(|s| s.is_vpn).unwrap_or(false)
    }
}

/// VPN/proxy heuristic over the ISP name.
pub fn is_vpn_isp(isp: &str) -> bool {
    let isp = isp.to_ascii_lowercase();
    isp.contains("vpn") || isp.contains("proxy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpn_heuristic() {
        assert!(is_vpn_isp("NordVPN S.A."));
        assert!(is_vpn_isp("Acme PROXY Services"));
        assert!(!is_vpn_isp("Deutsche Telekom AG"));
    }

    #[test]
    fn test_unavailable_context_has_no_identity() {
        let ctx = SessionContext::unavailable("s1", "alice", "timeout");
        assert!(ctx.fingerprint().is_none());
        assert!(ctx.ip().is_none());
        assert!(!ctx.is_vpn());
    }

    #[test]
    fn test_region_changed() {
        let mut signal = IdentitySignal {
            user_id: "alice".to_string(),
            fingerprint: "fp".to_string(),
            ip: "10.0.0.1".to_string(),
            country: Some("DE".to_string()),
            isp: None,
            is_vpn: false,
            region_locked_to: Some("DE".to_string()),
        };
        assert!(!signal.region_changed());
        signal.country = Some("FR".to_string());
        assert!(signal.region_changed());
        signal.country = None;
        assert!(!signal.region_changed());
    }
}
