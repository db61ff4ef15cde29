//! Session-scoped identity capture.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use codeguard_store::{audit, identity, users, GuardDb, ViolationKind};

use super::{is_vpn_isp, IdentityProvider, IdentitySignal, IdentityState, Session, SessionContext};
use crate::error::{GuardError, Result};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3_600);

/// Captures identity once per session and caches the resulting context.
///
/// Cached contexts expire after the session TTL; expired entries are
/// dropped whenever a new context is captured.
pub struct IdentityCollector {
    provider: Arc<dyn IdentityProvider>,
    db: Arc<GuardDb>,
    lookup_timeout: Duration,
    session_ttl: Duration,
    sessions: DashMap<String, Arc<SessionContext>>,
}

impl IdentityCollector {
    pub fn new(provider: Arc<dyn IdentityProvider>, db: Arc<GuardDb>, lookup_timeout: Duration) -> Self {
        Self {
            provider,
            db,
            lookup_timeout,
            session_ttl: DEFAULT_SESSION_TTL,
            sessions: DashMap::new(),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Context for `session`, capturing it on first use.
    ///
    /// Lookup failures produce an unavailable context rather than an error.
    /// Only store failures are returned as errors.
    pub async fn capture(&self, session: &Session) -> Result<Arc<SessionContext>> {
        let now = Utc::now();
        if let Some(ctx) = self.cached_at(&session.session_id, now) {
            return Ok(ctx);
        }
        let pruned = self.prune_expired(now);
        if pruned > 0 {
            debug!(pruned, "expired session contexts dropped");
        }

        self.db
            .with_conn(|conn| users::ensure_user(conn, &session.user_id, &now))?;

        let ctx = match self.lookup(session).await {
            Ok(signal) => {
                let signal = self.persist(signal)?;
                SessionContext {
                    session_id: session.session_id.clone(),
                    user_id: session.user_id.clone(),
                    identity: IdentityState::Known(signal),
                    captured_at: now,
                }
            }
            Err(e) => {
                warn!(
                    session_id = %session.session_id,
                    user_id = %session.user_id,
                    error = %e,
                    "identity signal unavailable"
                );
                SessionContext::unavailable(&session.session_id, &session.user_id, e.to_string())
            }
        };

        let ctx = self
            .sessions
            .entry(session.session_id.clone())
            .or_insert_with(|| Arc::new(ctx))
            .value()
            .clone();
        Ok(ctx)
    }

    /// Cached context, if the session has been captured and has not expired.
    pub fn cached(&self, session_id: &str) -> Option<Arc<SessionContext>> {
        self.cached_at(session_id, Utc::now())
    }

    /// Drop every context older than the session TTL. Returns how many went.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, ctx| !self.is_expired(ctx, now));
        before.saturating_sub(self.sessions.len())
    }

    fn cached_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Arc<SessionContext>> {
        self.sessions
            .get(session_id)
            .filter(|ctx| !self.is_expired(ctx.value(), now))
            .map(|ctx| Arc::clone(ctx.value()))
    }

    fn is_expired(&self, ctx: &SessionContext, now: DateTime<Utc>) -> bool {
        // A capture stamped in the future counts as fresh
        (now - ctx.captured_at)
            .to_std()
            .map(|age| age >= self.session_ttl)
            .unwrap_or(false)
    }

    /// Drop the cached context at the end of a session.
    pub fn end_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Most recently stored signal for any user.
    pub fn stored_signal(&self, user_id: &str) -> Result<Option<IdentitySignal>> {
        let row = self.db.with_conn(|conn| identity::get_signal(conn, user_id))?;
        Ok(row.map(IdentitySignal::from))
    }

    async fn lookup(&self, session: &Session) -> std::result::Result<IdentitySignal, GuardError> {
        let fingerprint = timeout(self.lookup_timeout, self.provider.fingerprint(session))
            .await
            .map_err(|_| GuardError::SignalUnavailable("fingerprint lookup timed out".to_string()))?
            .map_err(|e| GuardError::SignalUnavailable(e.to_string()))?;

        let geo = timeout(self.lookup_timeout, self.provider.geolocate(&session.client_ip))
            .await
            .map_err(|_| GuardError::SignalUnavailable("geolocation timed out".to_string()))?
            .map_err(|e| GuardError::SignalUnavailable(e.to_string()))?;

        let is_vpn = geo.isp.as_deref().map(is_vpn_isp).unwrap_or(false);
        Ok(IdentitySignal {
            user_id: session.user_id.clone(),
            fingerprint,
            ip: session.client_ip.clone(),
            country: geo.country,
            isp: geo.isp,
            is_vpn,
            region_locked_to: None,
        })
    }

    /// Store the signal with its region lock; record a violation on region change.
    fn persist(&self, mut signal: IdentitySignal) -> Result<IdentitySignal> {
        let now = Utc::now();
        let signal = self.db.with_transaction(|tx| {
            signal.region_locked_to = match &signal.country {
                Some(country) => Some(identity::lock_region(tx, &signal.fingerprint, country, &now)?),
                None => identity::get_region_lock(tx, &signal.fingerprint)?,
            };
            identity::upsert_signal(tx, &signal.to_row(now))?;

            if signal.region_changed() {
                audit::record_violation(
                    tx,
                    ViolationKind::RegionChange,
                    &[signal.user_id.clone()],
                    json!({
                        "fingerprint": signal.fingerprint,
                        "region_locked_to": signal.region_locked_to,
                        "observed_country": signal.country,
                        "ip": signal.ip,
                    }),
                    &now,
                )?;
            }
            Ok(signal)
        })?;

        if signal.region_changed() {
            info!(
                user_id = %signal.user_id,
                locked = ?signal.region_locked_to,
                observed = ?signal.country,
                "region change"
            );
        }
        debug!(user_id = %signal.user_id, fingerprint = %signal.fingerprint, vpn = signal.is_vpn, "identity captured");
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentityProvider;

    fn collector(provider: StaticIdentityProvider) -> (IdentityCollector, Arc<GuardDb>, Arc<StaticIdentityProvider>) {
        let db = Arc::new(GuardDb::open_in_memory().unwrap());
        let provider = Arc::new(provider);
        let collector = IdentityCollector::new(provider.clone(), db.clone(), Duration::from_millis(200));
        (collector, db, provider)
    }

    #[tokio::test]
    async fn test_capture_is_cached_per_session() {
        let (collector, db, provider) =
            collector(StaticIdentityProvider::new().with_geo("10.0.0.1", "DE", "NordVPN"));
        let session = Session::new("s1", "alice", "10.0.0.1").with_visitor_id("fp-a");

        let first = collector.capture(&session).await.unwrap();
        let second = collector.capture(&session).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.call_count(), 2);

        assert_eq!(first.fingerprint(), Some("fp-a"));
        assert!(first.is_vpn());
        let stored = db
            .with_conn(|conn| identity::get_signal(conn, "alice"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.region_locked_to.as_deref(), Some("DE"));

        assert!(collector.end_session("s1"));
        assert!(collector.cached("s1").is_none());
    }

    #[tokio::test]
    async fn test_expired_contexts_are_recaptured_and_pruned() {
        let (collector, _, provider) = collector(StaticIdentityProvider::new());
        let collector = collector.with_session_ttl(Duration::ZERO);
        let first_session = Session::new("s1", "alice", "10.0.0.1").with_visitor_id("fp-a");
        let second_session = Session::new("s2", "bob", "10.0.0.2").with_visitor_id("fp-b");

        let first = collector.capture(&first_session).await.unwrap();
        let again = collector.capture(&first_session).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
        assert_eq!(provider.call_count(), 4);
        assert!(collector.cached("s1").is_none());

        // Capturing another session sweeps out the stale one
        collector.capture(&second_session).await.unwrap();
        assert_eq!(collector.active_sessions(), 1);
        assert_eq!(collector.prune_expired(Utc::now()), 1);
        assert_eq!(collector.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failure_degrades_to_unavailable() {
        let (collector, db, _) = collector(StaticIdentityProvider::new().failing_geolocate());
        let session = Session::new("s1", "alice", "10.0.0.1").with_visitor_id("fp-a");

        let ctx = collector.capture(&session).await.unwrap();
        assert!(ctx.signal().is_none());
        assert!(db
            .with_conn(|conn| identity::get_signal(conn, "alice"))
            .unwrap()
            .is_none());
        // The user still exists for sweeps
        assert!(db.with_conn(|conn| users::get_user(conn, "alice")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stalled_lookup_times_out() {
        let (collector, _, _) =
            collector(StaticIdentityProvider::new().with_delay(Duration::from_secs(5)));
        let session = Session::new("s1", "alice", "10.0.0.1").with_visitor_id("fp-a");

        let ctx = collector.capture(&session).await.unwrap();
        match &ctx.identity {
            IdentityState::Unavailable { reason } => {
                assert!(reason.contains("timed out"))
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_region_change_is_recorded_not_blocking() {
        let (collector, db, _) = collector(
            StaticIdentityProvider::new()
                .with_geo("10.0.0.1", "DE", "Telekom")
                .with_geo("10.0.0.2", "BR", "Claro"),
        );

        collector
            .capture(&Session::new("s1", "alice", "10.0.0.1").with_visitor_id("fp-a"))
            .await
            .unwrap();
        let moved = collector
            .capture(&Session::new("s2", "alice", "10.0.0.2").with_visitor_id("fp-a"))
            .await
            .unwrap();

        let signal = moved.signal().unwrap();
        assert_eq!(signal.region_locked_to.as_deref(), Some("DE"));
        assert_eq!(signal.country.as_deref(), Some("BR"));

        let violations = db
            .with_conn(|conn| audit::list_violations(conn, Some(ViolationKind::RegionChange), 10))
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].subject_ids, vec!["alice".to_string()]);
    }
}
