//! User status and animal-power transfers.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use codeguard_store::{
    audit, identity, transfers, users, AnimalTransferRow, GuardDb, NewAnimalTransfer,
    UserStatusRow, ViolationKind, ViolationRow,
};

use crate::error::{GuardError, Refusal, Result};
use crate::identity::SessionContext;

pub struct UserRegistry {
    db: Arc<GuardDb>,
    default_animal_level: String,
}

impl UserRegistry {
    pub fn new(db: Arc<GuardDb>, default_animal_level: impl Into<String>) -> Self {
        Self {
            db,
            default_animal_level: default_animal_level.into(),
        }
    }

    /// Create the status row if missing. Returns true when created.
    pub fn ensure_user(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .db
            .with_conn(|conn| users::ensure_user(conn, user_id, &Utc::now()))?)
    }

    /// One-way switch into animal mode. Returns false if already there.
    pub fn enter_animal_mode(&self, user_id: &str, level: Option<&str>) -> Result<bool> {
        let level = level.unwrap_or(self.default_animal_level.as_str());
        let entered = self
            .db
            .with_conn(|conn| users::enter_animal_mode(conn, user_id, level, &Utc::now()))?;
        if entered {
            info!(user_id = %user_id, level = %level, "entered animal mode");
        }
        Ok(entered)
    }

    pub fn user_status(&self, user_id: &str) -> Result<UserStatusRow> {
        self.db
            .with_conn(|conn| users::get_user(conn, user_id))?
            .ok_or_else(|| GuardError::not_found("user", user_id))
    }

    pub fn banned_users(&self) -> Result<Vec<String>> {
        Ok(self.db.with_conn(users::list_banned_users)?)
    }

    /// Record an animal-power transfer from the session's user.
    ///
    /// The receiver's fingerprint is taken from their last stored signal.
    /// Integrity checks run later in the policy sweep.
    pub fn record_animal_transfer(
        &self,
        ctx: &SessionContext,
        to_user: &str,
    ) -> Result<NewAnimalTransfer> {
        if to_user.trim().is_empty() {
            return Err(GuardError::InvalidInput("receiver is empty".to_string()));
        }
        let from_user = ctx.user_id.as_str();
        for user in [from_user, to_user] {
            if self.db.with_conn(|conn| users::is_banned(conn, user))? {
                return Err(Refusal::Banned {
                    user_id: user.to_string(),
                }
                .into());
            }
        }

        let to_fingerprint = self
            .db
            .with_conn(|conn| identity::get_signal(conn, to_user))?
            .map(|s| s.fingerprint);
        let transfer = NewAnimalTransfer {
            id: Uuid::new_v4().to_string(),
            from_user: from_user.to_string(),
            to_user: to_user.to_string(),
            from_fingerprint: ctx.fingerprint().map(str::to_string),
            to_fingerprint,
            created_at: Utc::now(),
        };
        self.db
            .with_conn(|conn| transfers::insert_transfer(conn, &transfer))?;
        info!(transfer_id = %transfer.id, from = %from_user, to = %to_user, "animal transfer recorded");
        Ok(transfer)
    }

    pub fn transfers(&self) -> Result<Vec<AnimalTransferRow>> {
        Ok(self.db.with_conn(transfers::list_transfers)?)
    }

    /// Audit trail, newest first.
    pub fn violations(&self, kind: Option<ViolationKind>, limit: u32) -> Result<Vec<ViolationRow>> {
        Ok(self
            .db
            .with_conn(|conn| audit::list_violations(conn, kind, limit))?)
    }
}
