//! Watch-time tracking.
//!
//! A session earns one minute per tick while the viewer is active: the page
//! is focused, the last interaction is recent and the client does not look
//! headless. State is written on every tick so a crash loses at most one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use codeguard_store::{watch as store, GuardDb, WatchSessionRow};

use crate::config::GatekeeperConfig;
use crate::error::{GuardError, Result};
use crate::identity::SessionContext;

/// Automation markers reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvironment {
    /// `navigator.webdriver` or a similar automation flag
    pub webdriver: bool,
    pub plugin_count: u32,
    /// Document visibility
    pub visible: bool,
}

impl ClientEnvironment {
    pub fn is_headless(&self) -> bool {
        self.webdriver || self.plugin_count == 0 || !self.visible
    }
}

/// Client state observed at a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub focused: bool,
    pub environment: ClientEnvironment,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickOutcome {
    pub counted: bool,
    pub watch_minutes: i64,
    pub is_headless: bool,
}

type SessionKey = (String, String);

pub struct WatchTracker {
    db: Arc<GuardDb>,
    sessions: DashMap<SessionKey, WatchSessionRow>,
    inactivity_limit: chrono::Duration,
    tick_period: Duration,
}

impl WatchTracker {
    pub fn new(db: Arc<GuardDb>, config: &GatekeeperConfig) -> Self {
        Self {
            db,
            sessions: DashMap::new(),
            inactivity_limit: chrono::Duration::seconds(config.inactivity_limit_secs),
            tick_period: Duration::from_secs(config.tick_secs),
        }
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Open or resume a session for `video_id`.
    pub fn start(
        &self,
        ctx: &SessionContext,
        video_id: &str,
        environment: ClientEnvironment,
        at: DateTime<Utc>,
    ) -> Result<WatchSessionRow> {
        let user_id = ctx.user_id.as_str();
        let previous = self
            .db
            .with_conn(|conn| store::get_session(conn, user_id, video_id))?;

        let row = WatchSessionRow {
            user_id: user_id.to_string(),
            video_id: video_id.to_string(),
            watch_minutes: previous.map(|p| p.watch_minutes).unwrap_or(0),
            fingerprint: ctx.fingerprint().map(str::to_string),
            ip: ctx.ip().map(str::to_string),
            country: ctx.country().map(str::to_string),
            is_headless: environment.is_headless(),
            last_interaction: at,
            updated_at: at,
        };
        self.db.with_conn(|conn| store::upsert_session(conn, &row))?;
        self.sessions
            .insert((user_id.to_string(), video_id.to_string()), row.clone());

        info!(user_id = %user_id, video_id = %video_id, minutes = row.watch_minutes, "watch session started");
        Ok(row)
    }

    pub fn record_interaction(&self, user_id: &str, video_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&key(user_id, video_id))
            .ok_or_else(|| GuardError::not_found("watch session", session_id(user_id, video_id)))?;
        if at > session.last_interaction {
            session.last_interaction = at;
        }
        Ok(())
    }

    /// Account one tick and persist the session.
    pub fn tick(&self, user_id: &str, video_id: &str, snapshot: ActivitySnapshot) -> Result<TickOutcome> {
        let (row, counted) = {
            let mut session = self
                .sessions
                .get_mut(&key(user_id, video_id))
                .ok_or_else(|| GuardError::not_found("watch session", session_id(user_id, video_id)))?;

            let headless = snapshot.environment.is_headless();
            // Idle for the full limit no longer counts
            let recent = snapshot.at - session.last_interaction < self.inactivity_limit;
            let counted = snapshot.focused && recent && !headless;
            if counted {
                session.watch_minutes += 1;
            }
            session.is_headless = headless;
            session.updated_at = snapshot.at;
            (session.clone(), counted)
        };

        self.db.with_conn(|conn| store::upsert_session(conn, &row))?;
        debug!(user_id = %user_id, video_id = %video_id, counted, minutes = row.watch_minutes, "watch tick");
        Ok(TickOutcome {
            counted,
            watch_minutes: row.watch_minutes,
            is_headless: row.is_headless,
        })
    }

    /// Persist the final state and forget the session.
    pub fn stop(&self, user_id: &str, video_id: &str, at: DateTime<Utc>) -> Result<WatchSessionRow> {
        let (_, mut row) = self
            .sessions
            .remove(&key(user_id, video_id))
            .ok_or_else(|| GuardError::not_found("watch session", session_id(user_id, video_id)))?;
        row.updated_at = at;
        self.db.with_conn(|conn| store::upsert_session(conn, &row))?;
        info!(user_id = %user_id, video_id = %video_id, minutes = row.watch_minutes, "watch session stopped");
        Ok(row)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Tick on a fixed period until `shutdown` flips to true or closes.
    ///
    /// `snapshot` is polled once per tick for the client's current state.
    /// Returns the number of ticks taken.
    pub async fn run_ticker<F>(
        self: Arc<Self>,
        user_id: String,
        video_id: String,
        mut snapshot: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64>
    where
        F: FnMut() -> ActivitySnapshot + Send,
    {
        let mut interval = tokio::time::interval(self.tick_period);
        // First tick completes immediately
        interval.tick().await;
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(&user_id, &video_id, snapshot()) {
                        Ok(_) => ticks += 1,
                        Err(GuardError::NotFound { .. }) => break,
                        Err(e) => {
                            warn!(user_id = %user_id, video_id = %video_id, error = %e, "watch tick failed");
                            return Err(e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(ticks)
    }
}

fn key(user_id: &str, video_id: &str) -> SessionKey {
    (user_id.to_string(), video_id.to_string())
}

fn session_id(user_id: &str, video_id: &str) -> String {
    format!("{}/{}", user_id, video_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentitySignal;
    use chrono::TimeZone;

    const BROWSER: ClientEnvironment = ClientEnvironment {
        webdriver: false,
        plugin_count: 3,
        visible: true,
    };

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn tracker() -> (WatchTracker, Arc<GuardDb>) {
        let db = Arc::new(GuardDb::open_in_memory().unwrap());
        (WatchTracker::new(db.clone(), &GatekeeperConfig::default()), db)
    }

    fn ctx() -> SessionContext {
        SessionContext::known(
            "s-1",
            IdentitySignal {
                user_id: "viewer".to_string(),
                fingerprint: "fp-v".to_string(),
                ip: "10.1.1.1".to_string(),
                country: Some("FR".to_string()),
                isp: None,
                is_vpn: false,
                region_locked_to: Some("FR".to_string()),
            },
        )
    }

    fn snap(focused: bool, environment: ClientEnvironment, at: DateTime<Utc>) -> ActivitySnapshot {
        ActivitySnapshot {
            focused,
            environment,
            at,
        }
    }

    #[test]
    fn test_headless_heuristic() {
        assert!(!BROWSER.is_headless());
        assert!(ClientEnvironment { webdriver: true, ..BROWSER }.is_headless());
        assert!(ClientEnvironment { plugin_count: 0, ..BROWSER }.is_headless());
        assert!(ClientEnvironment { visible: false, ..BROWSER }.is_headless());
    }

    #[test]
    fn test_tick_counts_only_active_time() {
        let (tracker, db) = tracker();
        tracker.start(&ctx(), "vid", BROWSER, t(0)).unwrap();

        assert!(tracker.tick("viewer", "vid", snap(true, BROWSER, t(30))).unwrap().counted);
        // Unfocused
        assert!(!tracker.tick("viewer", "vid", snap(false, BROWSER, t(40))).unwrap().counted);
        // Idle past the inactivity limit
        assert!(!tracker.tick("viewer", "vid", snap(true, BROWSER, t(61))).unwrap().counted);

        tracker.record_interaction("viewer", "vid", t(100)).unwrap();
        let out = tracker.tick("viewer", "vid", snap(true, BROWSER, t(120))).unwrap();
        assert!(out.counted);
        assert_eq!(out.watch_minutes, 2);

        let headless = ClientEnvironment { webdriver: true, ..BROWSER };
        let out = tracker.tick("viewer", "vid", snap(true, headless, t(125))).unwrap();
        assert!(!out.counted);
        assert!(out.is_headless);

        // Every tick is persisted
        let row = db
            .with_conn(|c| store::get_session(c, "viewer", "vid"))
            .unwrap()
            .unwrap();
        assert_eq!(row.watch_minutes, 2);
        assert!(row.is_headless);
        assert_eq!(row.updated_at, t(125));
    }

    #[test]
    fn test_tick_at_inactivity_limit_is_idle() {
        let (tracker, _db) = tracker();
        tracker.start(&ctx(), "vid", BROWSER, t(0)).unwrap();

        assert!(tracker.tick("viewer", "vid", snap(true, BROWSER, t(59))).unwrap().counted);
        let out = tracker.tick("viewer", "vid", snap(true, BROWSER, t(60))).unwrap();
        assert!(!out.counted);
        assert_eq!(out.watch_minutes, 1);
    }

    #[test]
    fn test_restart_resumes_minutes() {
        let (tracker, _db) = tracker();
        tracker.start(&ctx(), "vid", BROWSER, t(0)).unwrap();
        tracker.tick("viewer", "vid", snap(true, BROWSER, t(10))).unwrap();
        let stopped = tracker.stop("viewer", "vid", t(20)).unwrap();
        assert_eq!(stopped.watch_minutes, 1);
        assert_eq!(tracker.active_sessions(), 0);

        let resumed = tracker.start(&ctx(), "vid", BROWSER, t(30)).unwrap();
        assert_eq!(resumed.watch_minutes, 1);
    }

    #[test]
    fn test_unknown_session() {
        let (tracker, _db) = tracker();
        let err = tracker
            .tick("nobody", "vid", snap(true, BROWSER, t(0)))
            .unwrap_err();
        assert!(matches!(err, GuardError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_ticker_stops_on_shutdown() {
        let (tracker, _db) = tracker();
        let tracker = Arc::new(tracker.with_tick_period(Duration::from_millis(10)));
        let start = Utc::now();
        tracker.start(&ctx(), "vid", BROWSER, start).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(tracker.clone().run_ticker(
            "viewer".to_string(),
            "vid".to_string(),
            move || snap(true, BROWSER, start),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        let ticks = handle.await.unwrap().unwrap();
        assert!(ticks >= 1);

        let row = tracker.stop("viewer", "vid", Utc::now()).unwrap();
        assert_eq!(row.watch_minutes as u64, ticks);
    }
}
