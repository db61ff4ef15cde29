//! Policy Sweep Engine.
//!
//! One run walks four phases in a fixed order:
//!
//! - **A** multi-account detection: one canonical animal-mode account per
//!   fingerprint, every other one is banned.
//! - **B** transfer integrity: self-transfers and rapid transfers ban both
//!   parties.
//! - **C** status normalization: backfill missing animal-since timestamps.
//! - **D** ban propagation: cancel pending trades and hide chat messages of
//!   every banned user.
//!
//! A, B and D run in a transaction each and abort the run on failure since D
//! consumes the bans A and B produce. C touches one user per write and keeps
//! going past individual failures. Every phase is safe to re-run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use codeguard_store::{
    audit, messages, trades, transfers, users, AnimalTransferRow, GuardDb, StoreError,
    ViolationKind,
};

use crate::config::SweepConfig;
use crate::error::Result;

pub const MULTI_ACCOUNT_REASON: &str = "multiple animal accounts on one device";
pub const SELF_TRANSFER_REASON: &str = "animal transfer between accounts on one device";
pub const RAPID_TRANSFER_REASON: &str = "rapid animal transfers";
const BAN_CANCEL_NOTE: &str = "cancelled: party banned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    MultiAccount,
    TransferIntegrity,
    StatusNormalization,
    BanPropagation,
}

/// What a phase does when one of its queries fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseFailurePolicy {
    /// Stop the whole run; later phases depend on this one
    Abort,
    /// Record the failure and continue with the next item
    Isolate,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::MultiAccount,
        Phase::TransferIntegrity,
        Phase::StatusNormalization,
        Phase::BanPropagation,
    ];

    pub fn failure_policy(&self) -> PhaseFailurePolicy {
        match self {
            Phase::StatusNormalization => PhaseFailurePolicy::Isolate,
            _ => PhaseFailurePolicy::Abort,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::MultiAccount => "multi_account",
            Phase::TransferIntegrity => "transfer_integrity",
            Phase::StatusNormalization => "status_normalization",
            Phase::BanPropagation => "ban_propagation",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure an isolating phase recorded and moved past.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub phase: Phase,
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Violations recorded by this run
    pub violations: usize,
    /// Users banned after the run, old bans included
    pub banned_users: usize,
    pub newly_banned: Vec<String>,
    pub animal_users: i64,
    pub processed_transfers: usize,
    pub backfilled: usize,
    pub cancelled_trades: usize,
    pub hidden_messages: usize,
    pub phase_errors: Vec<PhaseError>,
}

impl SweepSummary {
    fn banned(&mut self, user_id: &str) {
        if !self.newly_banned.iter().any(|u| u == user_id) {
            self.newly_banned.push(user_id.to_string());
        }
    }
}

pub struct PolicySweep {
    db: Arc<GuardDb>,
    config: SweepConfig,
}

impl PolicySweep {
    pub fn new(db: Arc<GuardDb>, config: SweepConfig) -> Self {
        Self { db, config }
    }

    /// Run all phases in order.
    pub fn run(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        info!("policy sweep started");
        let mut summary = SweepSummary::default();

        for phase in Phase::ALL {
            let outcome = match phase {
                Phase::MultiAccount => self.detect_multi_accounts(now, &mut summary),
                Phase::TransferIntegrity => self.check_transfers(now, &mut summary),
                Phase::StatusNormalization => self.normalize_status(now, &mut summary),
                Phase::BanPropagation => self.propagate_bans(now, &mut summary),
            };
            if let Err(e) = outcome {
                error!(phase = %phase, error = %e, "policy sweep aborted");
                return Err(e.into());
            }
            debug!(phase = %phase, "phase complete");
        }

        let (animal_users, banned) = self.db.with_conn(|conn| {
            Ok((
                users::count_animal_users(conn)?,
                users::list_banned_users(conn)?,
            ))
        })?;
        summary.animal_users = animal_users;
        summary.banned_users = banned.len();

        info!(
            violations = summary.violations,
            newly_banned = summary.newly_banned.len(),
            banned_users = summary.banned_users,
            cancelled_trades = summary.cancelled_trades,
            hidden_messages = summary.hidden_messages,
            phase_errors = summary.phase_errors.len(),
            "policy sweep finished"
        );
        Ok(summary)
    }

    /// Phase A. Canonical order is account creation time, then user id.
    fn detect_multi_accounts(
        &self,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> std::result::Result<(), StoreError> {
        self.db.with_transaction(|tx| {
            let devices = users::list_animal_devices(tx)?;
            let mut canonical: HashMap<String, String> = HashMap::new();

            for device in devices {
                let Some(fingerprint) = device.fingerprint else {
                    continue;
                };
                let first = match canonical.get(&fingerprint) {
                    Some(first) => first.clone(),
                    None => {
                        canonical.insert(fingerprint, device.user_id);
                        continue;
                    }
                };
                if device.banned {
                    continue;
                }
                if users::ban_user(tx, &device.user_id, MULTI_ACCOUNT_REASON, &now)? {
                    audit::record_violation(
                        tx,
                        ViolationKind::MultipleAnimalAccounts,
                        &[first.clone(), device.user_id.clone()],
                        json!({ "fingerprint": fingerprint, "canonical": first }),
                        &now,
                    )?;
                    summary.violations += 1;
                    summary.banned(&device.user_id);
                }
            }
            Ok(())
        })
    }

    /// Phase B.
    fn check_transfers(
        &self,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> std::result::Result<(), StoreError> {
        let window_hours = self.config.transfer_window_hours;
        let since = now - Duration::hours(window_hours);
        let threshold = self.config.transfer_threshold;

        self.db.with_transaction(|tx| {
            let all = transfers::list_transfers(tx)?;
            summary.processed_transfers = all.len();

            for transfer in &all {
                if is_self_transfer(transfer) {
                    let rejected =
                        transfers::reject_transfer(tx, &transfer.id, SELF_TRANSFER_REASON, &now)?;
                    let banned = ban_parties(tx, transfer, SELF_TRANSFER_REASON, &now, summary)?;
                    if rejected || banned {
                        audit::record_violation(
                            tx,
                            ViolationKind::SelfTransfer,
                            &parties(transfer),
                            json!({
                                "transfer_id": transfer.id,
                                "fingerprint": transfer.from_fingerprint,
                            }),
                            &now,
                        )?;
                        summary.violations += 1;
                    }
                }

                let sent = transfers::count_sent_since(tx, &transfer.from_user, &since)?;
                let received = transfers::count_received_since(tx, &transfer.to_user, &since)?;
                if sent > threshold || received > threshold {
                    if ban_parties(tx, transfer, RAPID_TRANSFER_REASON, &now, summary)? {
                        audit::record_violation(
                            tx,
                            ViolationKind::RapidTransfer,
                            &parties(transfer),
                            json!({
                                "transfer_id": transfer.id,
                                "sent": sent,
                                "received": received,
                                "window_hours": window_hours,
                            }),
                            &now,
                        )?;
                        summary.violations += 1;
                    }
                }
            }
            Ok(())
        })
    }

    /// Phase C. Failures stay with the user they happened on.
    fn normalize_status(
        &self,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> std::result::Result<(), StoreError> {
        let pending = self.db.with_conn(users::list_animal_without_since)?;
        let level = self.config.default_animal_level.as_str();

        for user_id in pending {
            match self
                .db
                .with_conn(|conn| users::backfill_animal_since(conn, &user_id, level, &now))
            {
                Ok(true) => summary.backfilled += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "animal status backfill failed");
                    summary.phase_errors.push(PhaseError {
                        phase: Phase::StatusNormalization,
                        subject: user_id,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Phase D.
    fn propagate_bans(
        &self,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> std::result::Result<(), StoreError> {
        self.db.with_transaction(|tx| {
            for user_id in users::list_banned_users(tx)? {
                let cancelled = trades::cancel_pending_for_user(tx, &user_id, BAN_CANCEL_NOTE, &now)?;
                let hidden = messages::hide_for_user(tx, &user_id)?;
                if cancelled > 0 || hidden > 0 {
                    debug!(user_id = %user_id, cancelled, hidden, "ban propagated");
                }
                summary.cancelled_trades += cancelled;
                summary.hidden_messages += hidden;
            }
            Ok(())
        })
    }
}

fn is_self_transfer(transfer: &AnimalTransferRow) -> bool {
    matches!(
        (&transfer.from_fingerprint, &transfer.to_fingerprint),
        (Some(a), Some(b)) if a == b
    )
}

fn parties(transfer: &AnimalTransferRow) -> Vec<String> {
    vec![transfer.from_user.clone(), transfer.to_user.clone()]
}

/// Ban both sides of a transfer. True if either ban was new.
fn ban_parties(
    conn: &rusqlite::Connection,
    transfer: &AnimalTransferRow,
    reason: &str,
    at: &DateTime<Utc>,
    summary: &mut SweepSummary,
) -> std::result::Result<bool, StoreError> {
    let mut changed = false;
    for user_id in [&transfer.from_user, &transfer.to_user] {
        if users::ban_user(conn, user_id, reason, at)? {
            summary.banned(user_id);
            changed = true;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use codeguard_store::{
        identity, IdentitySignalRow, MessageStatus, NewAnimalTransfer, NewChatMessage, NewTrade,
        TradeStatus, TransferStatus,
    };

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn sweep() -> (PolicySweep, Arc<GuardDb>) {
        let db = Arc::new(GuardDb::open_in_memory().unwrap());
        (PolicySweep::new(db.clone(), SweepConfig::default()), db)
    }

    fn animal(db: &GuardDb, user: &str, fingerprint: &str, created: i64) {
        db.with_conn(|conn| {
            users::ensure_user(conn, user, &t(created))?;
            users::enter_animal_mode(conn, user, "1", &t(created))?;
            identity::upsert_signal(
                conn,
                &IdentitySignalRow {
                    user_id: user.to_string(),
                    fingerprint: fingerprint.to_string(),
                    ip: "10.0.0.1".to_string(),
                    country: Some("US".to_string()),
                    isp: None,
                    is_vpn: false,
                    region_locked_to: Some("US".to_string()),
                    updated_at: t(created),
                },
            )
        })
        .unwrap();
    }

    fn transfer(db: &GuardDb, id: &str, from: (&str, &str), to: (&str, &str), at: DateTime<Utc>) {
        db.with_conn(|conn| {
            transfers::insert_transfer(
                conn,
                &NewAnimalTransfer {
                    id: id.to_string(),
                    from_user: from.0.to_string(),
                    to_user: to.0.to_string(),
                    from_fingerprint: Some(from.1.to_string()),
                    to_fingerprint: Some(to.1.to_string()),
                    created_at: at,
                },
            )
        })
        .unwrap();
    }

    #[test]
    fn test_phase_policies() {
        assert_eq!(Phase::MultiAccount.failure_policy(), PhaseFailurePolicy::Abort);
        assert_eq!(Phase::TransferIntegrity.failure_policy(), PhaseFailurePolicy::Abort);
        assert_eq!(
            Phase::StatusNormalization.failure_policy(),
            PhaseFailurePolicy::Isolate
        );
        assert_eq!(Phase::BanPropagation.failure_policy(), PhaseFailurePolicy::Abort);
    }

    #[test]
    fn test_second_account_on_device_is_banned() {
        let (sweep, db) = sweep();
        animal(&db, "first", "fp-shared", 0);
        animal(&db, "second", "fp-shared", 5);
        animal(&db, "alone", "fp-other", 10);

        let summary = sweep.run(t(60)).unwrap();
        assert_eq!(summary.newly_banned, vec!["second".to_string()]);
        assert_eq!(summary.violations, 1);
        assert_eq!(summary.animal_users, 3);

        let second = db.with_conn(|c| users::get_user(c, "second")).unwrap().unwrap();
        assert!(second.banned);
        assert!(second.ban_reason.unwrap().contains("device"));
        assert!(!db.with_conn(|c| users::is_banned(c, "first")).unwrap());
        assert!(!db.with_conn(|c| users::is_banned(c, "alone")).unwrap());
    }

    #[test]
    fn test_second_run_records_nothing_new() {
        let (sweep, db) = sweep();
        animal(&db, "a", "fp", 0);
        animal(&db, "b", "fp", 1);
        animal(&db, "c", "fp", 2);
        transfer(&db, "tx-1", ("a", "fp-x"), ("d", "fp-x"), t(30));

        let first = sweep.run(t(60)).unwrap();
        assert!(first.violations >= 3);

        let second = sweep.run(t(61)).unwrap();
        assert_eq!(second.violations, 0);
        assert!(second.newly_banned.is_empty());
        assert_eq!(second.banned_users, first.banned_users);
    }

    #[test]
    fn test_self_transfer_bans_both_and_rejects() {
        let (sweep, db) = sweep();
        transfer(&db, "tx-1", ("alice", "fp-1"), ("bob", "fp-1"), t(0));
        transfer(&db, "tx-2", ("carol", "fp-2"), ("dave", "fp-3"), t(0));

        let summary = sweep.run(t(10)).unwrap();
        assert_eq!(summary.processed_transfers, 2);
        assert!(summary.newly_banned.contains(&"alice".to_string()));
        assert!(summary.newly_banned.contains(&"bob".to_string()));
        assert!(!summary.newly_banned.contains(&"carol".to_string()));

        let rows = db.with_conn(transfers::list_transfers).unwrap();
        let tx1 = rows.iter().find(|r| r.id == "tx-1").unwrap();
        assert_eq!(tx1.status, TransferStatus::Rejected);
        let tx2 = rows.iter().find(|r| r.id == "tx-2").unwrap();
        assert_eq!(tx2.status, TransferStatus::Completed);
    }

    #[test]
    fn test_rapid_transfers_ban_both_parties() {
        let (sweep, db) = sweep();
        for i in 0..6 {
            transfer(
                &db,
                &format!("tx-{i}"),
                ("hub", "fp-hub"),
                (&format!("leaf-{i}"), &format!("fp-{i}")),
                t(i),
            );
        }
        transfer(&db, "tx-slow", ("x", "fp-x"), ("y", "fp-y"), t(0));

        let summary = sweep.run(t(60)).unwrap();
        assert!(summary.newly_banned.contains(&"hub".to_string()));
        assert!(summary.newly_banned.contains(&"leaf-0".to_string()));
        assert!(!summary.newly_banned.contains(&"x".to_string()));
    }

    #[test]
    fn test_rapid_receipts_ban_receiver_and_senders() {
        let (sweep, db) = sweep();
        for i in 0..6 {
            transfer(
                &db,
                &format!("rx-{i}"),
                (&format!("donor-{i}"), &format!("fp-d{i}")),
                ("sink", "fp-sink"),
                t(i),
            );
        }
        // Five receipts stay at the threshold
        for i in 0..5 {
            transfer(
                &db,
                &format!("ok-{i}"),
                (&format!("giver-{i}"), &format!("fp-g{i}")),
                ("steady", "fp-steady"),
                t(i),
            );
        }

        let summary = sweep.run(t(60)).unwrap();
        assert!(summary.newly_banned.contains(&"sink".to_string()));
        assert!(summary.newly_banned.contains(&"donor-0".to_string()));
        assert!(summary.newly_banned.contains(&"donor-5".to_string()));
        assert!(!summary.newly_banned.contains(&"steady".to_string()));
        assert!(!summary.newly_banned.contains(&"giver-0".to_string()));

        let rapid = db
            .with_conn(|conn| audit::list_violations(conn, Some(ViolationKind::RapidTransfer), 20))
            .unwrap();
        assert_eq!(rapid.len(), 6);
        assert!(rapid.iter().all(|v| v.details["received"] == 6));
    }

    #[test]
    fn test_transfers_outside_window_do_not_count() {
        let (sweep, db) = sweep();
        for i in 0..6 {
            transfer(
                &db,
                &format!("tx-{i}"),
                ("hub", "fp-hub"),
                (&format!("leaf-{i}"), &format!("fp-{i}")),
                t(0),
            );
        }
        let summary = sweep.run(t(60 * 48)).unwrap();
        assert!(summary.newly_banned.is_empty());
    }

    #[test]
    fn test_backfill_animal_since() {
        let (sweep, db) = sweep();
        db.with_conn(|conn| {
            users::ensure_user(conn, "legacy", &t(0))?;
            conn.execute(
                "UPDATE user_status SET is_animal = 1 WHERE user_id = 'legacy'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let summary = sweep.run(t(5)).unwrap();
        assert_eq!(summary.backfilled, 1);
        let row = db.with_conn(|c| users::get_user(c, "legacy")).unwrap().unwrap();
        assert_eq!(row.animal_since, Some(t(5)));
        assert_eq!(row.animal_level.as_deref(), Some("1"));
        assert!(row.is_animal);
    }

    #[test]
    fn test_ban_cancels_trades_and_hides_messages() {
        let (sweep, db) = sweep();
        animal(&db, "first", "fp", 0);
        animal(&db, "second", "fp", 1);
        db.with_conn(|conn| {
            trades::insert_trade(
                conn,
                &NewTrade {
                    id: "trade-1".to_string(),
                    code: "1ABCGO".to_string(),
                    from_user: "other".to_string(),
                    to_user: "second".to_string(),
                    from_fingerprint: None,
                    to_fingerprint: None,
                    from_ip: None,
                    to_ip: None,
                    status: TradeStatus::Pending,
                    created_at: t(2),
                },
            )?;
            messages::insert_message(
                conn,
                &NewChatMessage {
                    id: "msg-1".to_string(),
                    user_id: "second".to_string(),
                    content: "hello".to_string(),
                    fingerprint: Some("fp".to_string()),
                    ip: None,
                    country: None,
                    is_vpn: false,
                    created_at: t(3),
                },
            )
        })
        .unwrap();

        let summary = sweep.run(t(10)).unwrap();
        assert_eq!(summary.cancelled_trades, 1);
        assert_eq!(summary.hidden_messages, 1);

        let trade = db.with_conn(|c| trades::get_trade(c, "trade-1")).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Cancelled);
        let msgs = db.with_conn(|c| messages::list_for_user(c, "second")).unwrap();
        assert!(msgs.iter().all(|m| m.status == MessageStatus::Hidden));

        let again = sweep.run(t(11)).unwrap();
        assert_eq!(again.cancelled_trades, 0);
        assert_eq!(again.hidden_messages, 0);
    }

    #[test]
    fn test_failing_phase_aborts_run() {
        let (sweep, db) = sweep();
        animal(&db, "first", "fp", 0);
        animal(&db, "second", "fp", 1);
        db.with_conn(|conn| {
            conn.execute("DROP TABLE animal_transfers", [])?;
            Ok(())
        })
        .unwrap();

        assert!(sweep.run(t(10)).is_err());
        // Phase A committed before B failed; a re-run picks up from there
        assert!(db.with_conn(|c| users::is_banned(c, "second")).unwrap());
    }
}
