//! Trade Validator.
//!
//! Direct trades and accepted offers move a code between holders after the
//! same preconditions: transferable status, sender holds the code, neither
//! party banned, and no shared device. A shared IP still succeeds but the
//! trade is flagged. The re-audit sweep re-checks completed trades.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use codeguard_store::{
    codes, identity, trades, users, CodeRow, GuardDb, NewTrade, Resolution, StoreError, TradeRow,
    TradeStatus,
};

use crate::config::TradesConfig;
use crate::error::{GuardError, Refusal, Result};
use crate::identity::{IdentitySignal, SessionContext};
use crate::registry::transfer_holder_in;

const SUPERSEDED_NOTE: &str = "cancelled: code changed hands";

/// Result of an executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub trade_id: String,
    pub code: String,
    pub from_user: String,
    pub to_user: String,
    /// `completed`, or `flagged` when both sides share an IP
    pub status: TradeStatus,
}

/// Machine-checkable reason a completed trade was flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TradeFinding {
    SameUser,
    SameFingerprint,
    SameIp,
    SellerNotOriginalOwner { owner_id: String },
    SenderVelocity { count: i64, window_hours: i64 },
    ReceiverVelocity { count: i64, window_hours: i64 },
}

impl TradeFinding {
    pub fn describe(&self) -> String {
        match self {
            TradeFinding::SameUser => "sender and receiver are the same user".to_string(),
            TradeFinding::SameFingerprint => "sender and receiver share a fingerprint".to_string(),
            TradeFinding::SameIp => "sender and receiver share an IP".to_string(),
            TradeFinding::SellerNotOriginalOwner { owner_id } => {
                format!("seller is not the original owner ({})", owner_id)
            }
            TradeFinding::SenderVelocity {
                count,
                window_hours,
            } => format!(
                "sender made {} trades in the last {} hours",
                count, window_hours
            ),
            TradeFinding::ReceiverVelocity {
                count,
                window_hours,
            } => format!(
                "receiver got {} trades in the last {} hours",
                count, window_hours
            ),
        }
    }
}

pub fn render_trade_findings(findings: &[TradeFinding]) -> String {
    if findings.is_empty() {
        return "trade verified, no findings".to_string();
    }
    findings
        .iter()
        .map(TradeFinding::describe)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Human-readable notes for a stored trade.
pub fn describe_trade(trade: &TradeRow) -> String {
    match serde_json::from_value::<Vec<TradeFinding>>(trade.findings.clone()) {
        Ok(findings) if trade.status == TradeStatus::Flagged || trade.status == TradeStatus::Approved => {
            render_trade_findings(&findings)
        }
        _ => trade.resolution_notes.clone().unwrap_or_default(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TradeSweepResult {
    Approved,
    Flagged { findings: Vec<TradeFinding> },
    Skipped,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSweepItem {
    pub trade_id: String,
    pub code: String,
    #[serde(flatten)]
    pub result: TradeSweepResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeSweepReport {
    pub processed: usize,
    pub approved: usize,
    pub flagged: usize,
    pub skipped: usize,
    pub errors: usize,
    pub results: Vec<TradeSweepItem>,
}

pub struct TradeValidator {
    db: Arc<GuardDb>,
    config: TradesConfig,
}

impl TradeValidator {
    pub fn new(db: Arc<GuardDb>, config: TradesConfig) -> Self {
        Self { db, config }
    }

    /// Transfer `code` from the session's user to `to_user`.
    pub fn trade_code(&self, ctx: &SessionContext, code: &str, to_user: &str) -> Result<TradeReceipt> {
        let from_user = ctx.user_id.as_str();
        let sender = self.signal_for(ctx, from_user)?;
        let receiver = self.stored_signal(to_user)?;
        self.check_preconditions(code, from_user, sender.as_ref(), to_user, receiver.as_ref())?;

        let now = Utc::now();
        let status = trade_status(sender.as_ref(), receiver.as_ref());
        let trade = new_trade(code, from_user, to_user, sender.as_ref(), receiver.as_ref(), status, now);

        let written = self.db.with_transaction(|tx| {
            if !transfer_holder_in(tx, code, from_user, to_user, now)? {
                return Err(StoreError::Conflict(format!("code {} moved during trade", code)));
            }
            let withdrawn = trades::cancel_pending_for_code(tx, code, SUPERSEDED_NOTE, &now)?;
            if withdrawn > 0 {
                debug!(code = %code, withdrawn, "open offers superseded by direct trade");
            }
            trades::insert_trade(tx, &trade)
        });
        self.finish_write(written, code)?;

        info!(trade_id = %trade.id, code = %code, from = %from_user, to = %to_user, status = %status, "trade executed");
        Ok(TradeReceipt {
            trade_id: trade.id,
            code: code.to_string(),
            from_user: from_user.to_string(),
            to_user: to_user.to_string(),
            status,
        })
    }

    /// Record a pending offer. The code stays with the sender until accepted.
    pub fn offer_trade(&self, ctx: &SessionContext, code: &str, to_user: &str) -> Result<TradeRow> {
        let from_user = ctx.user_id.as_str();
        let sender = self.signal_for(ctx, from_user)?;
        let receiver = self.stored_signal(to_user)?;
        self.check_preconditions(code, from_user, sender.as_ref(), to_user, receiver.as_ref())?;

        let trade = new_trade(
            code,
            from_user,
            to_user,
            sender.as_ref(),
            receiver.as_ref(),
            TradeStatus::Pending,
            Utc::now(),
        );
        self.db.with_conn(|conn| trades::insert_trade(conn, &trade))?;
        info!(trade_id = %trade.id, code = %code, from = %from_user, to = %to_user, "trade offered");
        self.get_trade(&trade.id)
    }

    /// Accept a pending offer as its receiver.
    pub fn accept_offer(&self, ctx: &SessionContext, trade_id: &str) -> Result<TradeReceipt> {
        let offer = self.get_trade(trade_id)?;
        if offer.to_user != ctx.user_id {
            return Err(Refusal::NotParty {
                trade_id: trade_id.to_string(),
            }
            .into());
        }
        if offer.status != TradeStatus::Pending {
            return Err(already_resolved(trade_id));
        }

        let sender = self.stored_signal(&offer.from_user)?;
        let receiver = self.signal_for(ctx, &offer.to_user)?;
        self.check_preconditions(
            &offer.code,
            &offer.from_user,
            sender.as_ref(),
            &offer.to_user,
            receiver.as_ref(),
        )?;

        let now = Utc::now();
        let status = trade_status(sender.as_ref(), receiver.as_ref());
        let resolution = Resolution {
            status,
            findings: serde_json::Value::Array(Vec::new()),
            notes: "offer accepted".to_string(),
            resolved_by: None,
            at: now,
        };

        let written = self.db.with_transaction(|tx| {
            if !trades::resolve_trade(tx, trade_id, TradeStatus::Pending, &resolution)? {
                return Err(StoreError::Conflict(format!("trade {} no longer pending", trade_id)));
            }
            if !transfer_holder_in(tx, &offer.code, &offer.from_user, &offer.to_user, now)? {
                return Err(StoreError::Conflict(format!("code {} moved during trade", offer.code)));
            }
            trades::cancel_pending_for_code(tx, &offer.code, SUPERSEDED_NOTE, &now)?;
            Ok(())
        });
        self.finish_write(written, &offer.code)?;

        info!(trade_id = %trade_id, code = %offer.code, status = %status, "offer accepted");
        Ok(TradeReceipt {
            trade_id: offer.id,
            code: offer.code,
            from_user: offer.from_user,
            to_user: offer.to_user,
            status,
        })
    }

    /// Withdraw or decline a pending offer. Either party may cancel.
    pub fn cancel_offer(&self, ctx: &SessionContext, trade_id: &str) -> Result<TradeRow> {
        let offer = self.get_trade(trade_id)?;
        if offer.from_user != ctx.user_id && offer.to_user != ctx.user_id {
            return Err(Refusal::NotParty {
                trade_id: trade_id.to_string(),
            }
            .into());
        }

        let resolution = Resolution {
            status: TradeStatus::Cancelled,
            findings: serde_json::Value::Array(Vec::new()),
            notes: format!("cancelled by {}", ctx.user_id),
            resolved_by: Some(ctx.user_id.clone()),
            at: Utc::now(),
        };
        let cancelled = self
            .db
            .with_conn(|conn| trades::resolve_trade(conn, trade_id, TradeStatus::Pending, &resolution))?;
        if !cancelled {
            return Err(already_resolved(trade_id));
        }
        self.get_trade(trade_id)
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<TradeRow> {
        self.db
            .with_conn(|conn| trades::get_trade(conn, trade_id))?
            .ok_or_else(|| GuardError::not_found("trade", trade_id))
    }

    /// Every trade the user took part in, newest first.
    pub fn get_trade_history(&self, user_id: &str) -> Result<Vec<TradeRow>> {
        Ok(self.db.with_conn(|conn| trades::list_trades_for_user(conn, user_id))?)
    }

    /// Re-audit every completed trade.
    pub fn sweep_completed_trades(&self, now: DateTime<Utc>) -> Result<TradeSweepReport> {
        let completed = self
            .db
            .with_conn(|conn| trades::list_trades_by_status(conn, TradeStatus::Completed))?;
        info!(count = completed.len(), "trade sweep started");

        let mut report = TradeSweepReport::default();
        for trade in completed {
            let result = match self.sweep_one(&trade, now) {
                Ok(result) => result,
                Err(e) => {
                    warn!(trade_id = %trade.id, error = %e, "trade sweep item failed");
                    TradeSweepResult::Error {
                        message: e.to_string(),
                    }
                }
            };

            report.processed += 1;
            match &result {
                TradeSweepResult::Approved => report.approved += 1,
                TradeSweepResult::Flagged { .. } => report.flagged += 1,
                TradeSweepResult::Skipped => report.skipped += 1,
                TradeSweepResult::Error { .. } => report.errors += 1,
            }
            report.results.push(TradeSweepItem {
                trade_id: trade.id,
                code: trade.code,
                result,
            });
        }

        info!(
            processed = report.processed,
            approved = report.approved,
            flagged = report.flagged,
            errors = report.errors,
            "trade sweep finished"
        );
        Ok(report)
    }

    /// Findings for one completed trade, evaluated independently.
    pub fn audit_trade(&self, trade: &TradeRow, now: DateTime<Utc>) -> Result<Vec<TradeFinding>> {
        let code = self
            .db
            .with_conn(|conn| codes::get_code(conn, &trade.code))?
            .ok_or_else(|| GuardError::not_found("code", &trade.code))?;

        let window_hours = self.config.velocity_window_hours;
        let since = now - Duration::hours(window_hours);
        let (sent, received) = self.db.with_conn(|conn| {
            Ok((
                trades::count_sent_since(conn, &trade.from_user, &since)?,
                trades::count_received_since(conn, &trade.to_user, &since)?,
            ))
        })?;

        let mut findings = Vec::new();
        if trade.from_user == trade.to_user {
            findings.push(TradeFinding::SameUser);
        }
        if both_equal(&trade.from_fingerprint, &trade.to_fingerprint) {
            findings.push(TradeFinding::SameFingerprint);
        }
        if both_equal(&trade.from_ip, &trade.to_ip) {
            findings.push(TradeFinding::SameIp);
        }
        if code.owner_id != trade.from_user {
            findings.push(TradeFinding::SellerNotOriginalOwner {
                owner_id: code.owner_id,
            });
        }
        if sent > self.config.velocity_threshold {
            findings.push(TradeFinding::SenderVelocity {
                count: sent,
                window_hours,
            });
        }
        if received > self.config.velocity_threshold {
            findings.push(TradeFinding::ReceiverVelocity {
                count: received,
                window_hours,
            });
        }
        Ok(findings)
    }

    fn sweep_one(&self, trade: &TradeRow, now: DateTime<Utc>) -> Result<TradeSweepResult> {
        let findings = self.audit_trade(trade, now)?;
        let status = if findings.is_empty() {
            TradeStatus::Approved
        } else {
            TradeStatus::Flagged
        };
        let resolution = Resolution {
            status,
            findings: serde_json::to_value(&findings).map_err(StoreError::from)?,
            notes: format!("{} by trade re-audit", status),
            resolved_by: Some("trade-sweep".to_string()),
            at: now,
        };

        let changed = self.db.with_conn(|conn| {
            trades::resolve_trade(conn, &trade.id, TradeStatus::Completed, &resolution)
        })?;
        Ok(match (changed, findings.is_empty()) {
            (false, _) => TradeSweepResult::Skipped,
            (true, true) => TradeSweepResult::Approved,
            (true, false) => TradeSweepResult::Flagged { findings },
        })
    }

    fn check_preconditions(
        &self,
        code: &str,
        from_user: &str,
        sender: Option<&IdentitySignal>,
        to_user: &str,
        receiver: Option<&IdentitySignal>,
    ) -> Result<CodeRow> {
        if to_user.trim().is_empty() {
            return Err(GuardError::InvalidInput("receiver is empty".to_string()));
        }
        let row = self
            .db
            .with_conn(|conn| codes::get_code(conn, code))?
            .ok_or_else(|| GuardError::not_found("code", code))?;

        if !row.status.is_transferable() {
            return Err(Refusal::NotTransferable {
                code: code.to_string(),
                status: row.status.to_string(),
            }
            .into());
        }
        if row.holder_id != from_user {
            return Err(Refusal::NotHolder {
                code: code.to_string(),
                holder: row.holder_id,
            }
            .into());
        }
        for user in [from_user, to_user] {
            if self.db.with_conn(|conn| users::is_banned(conn, user))? {
                return Err(Refusal::Banned {
                    user_id: user.to_string(),
                }
                .into());
            }
        }

        if let (Some(s), Some(r)) = (sender, receiver) {
            if s.fingerprint == r.fingerprint {
                warn!(
                    code = %code,
                    from = %from_user,
                    to = %to_user,
                    fingerprint = %s.fingerprint,
                    "trade blocked: same device"
                );
                return Err(Refusal::SameDevice.into());
            }
        }
        Ok(row)
    }

    /// Session identity, falling back to the last stored signal.
    fn signal_for(&self, ctx: &SessionContext, user_id: &str) -> Result<Option<IdentitySignal>> {
        match ctx.signal() {
            Some(signal) => Ok(Some(signal.clone())),
            None => self.stored_signal(user_id),
        }
    }

    fn stored_signal(&self, user_id: &str) -> Result<Option<IdentitySignal>> {
        let row = self.db.with_conn(|conn| identity::get_signal(conn, user_id))?;
        Ok(row.map(IdentitySignal::from))
    }

    fn finish_write(&self, written: std::result::Result<(), StoreError>, code: &str) -> Result<()> {
        match written {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(_)) => Err(Refusal::RaceLost {
                entity: "code",
                id: code.to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }
}

fn already_resolved(trade_id: &str) -> GuardError {
    Refusal::AlreadyResolved {
        entity: "trade",
        id: trade_id.to_string(),
    }
    .into()
}

fn both_equal(a: &Option<String>, b: &Option<String>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

/// `flagged` when both IPs are known and equal.
fn trade_status(sender: Option<&IdentitySignal>, receiver: Option<&IdentitySignal>) -> TradeStatus {
    match (sender, receiver) {
        (Some(s), Some(r)) if s.ip == r.ip => TradeStatus::Flagged,
        _ => TradeStatus::Completed,
    }
}

fn new_trade(
    code: &str,
    from_user: &str,
    to_user: &str,
    sender: Option<&IdentitySignal>,
    receiver: Option<&IdentitySignal>,
    status: TradeStatus,
    at: DateTime<Utc>,
) -> NewTrade {
    NewTrade {
        id: Uuid::new_v4().to_string(),
        code: code.to_string(),
        from_user: from_user.to_string(),
        to_user: to_user.to_string(),
        from_fingerprint: sender.map(|s| s.fingerprint.clone()),
        to_fingerprint: receiver.map(|r| r.fingerprint.clone()),
        from_ip: sender.map(|s| s.ip.clone()),
        to_ip: receiver.map(|r| r.ip.clone()),
        status,
        created_at: at,
    }
}
