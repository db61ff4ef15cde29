//! Message gate

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use codeguard_store::{messages, users, ChatMessageRow, GuardDb, NewChatMessage};

use crate::error::{GuardError, Refusal, Result};
use crate::identity::{is_vpn_isp, SessionContext};

/// Network badge shown next to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "badge", rename_all = "snake_case")]
pub enum Badge {
    VpnProxy,
    Verified { country: String },
    Unknown,
}

impl Badge {
    pub fn for_message(message: &ChatMessageRow) -> Self {
        Self::from_parts(message.is_vpn, message.country.as_deref())
    }

    pub fn for_isp(isp: Option<&str>, country: Option<&str>) -> Self {
        Self::from_parts(isp.map(is_vpn_isp).unwrap_or(false), country)
    }

    fn from_parts(is_vpn: bool, country: Option<&str>) -> Self {
        match (is_vpn, country) {
            (true, _) => Badge::VpnProxy,
            (false, Some(country)) => Badge::Verified {
                country: country.to_string(),
            },
            (false, None) => Badge::Unknown,
        }
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Badge::VpnProxy => write!(f, "VPN/Proxy"),
            Badge::Verified { country } => write!(f, "Verified ({})", country),
            Badge::Unknown => write!(f, "Unverified"),
        }
    }
}

/// Badge text for a stored message.
pub fn render_badge(message: &ChatMessageRow) -> String {
    Badge::for_message(message).to_string()
}

pub struct MessageGate {
    db: Arc<GuardDb>,
    default_limit: u32,
}

impl MessageGate {
    pub fn new(db: Arc<GuardDb>, default_limit: u32) -> Self {
        Self { db, default_limit }
    }

    /// Post a chat message as the session's user.
    pub fn send_message(&self, ctx: &SessionContext, text: &str) -> Result<ChatMessageRow> {
        let content = text.trim();
        if content.is_empty() {
            return Err(GuardError::InvalidInput("message is empty".to_string()));
        }
        let user_id = ctx.user_id.as_str();

        if let Some(status) = self.db.with_conn(|conn| users::get_user(conn, user_id))? {
            if status.banned {
                return Err(Refusal::Banned {
                    user_id: user_id.to_string(),
                }
                .into());
            }
            if status.is_animal {
                return Err(Refusal::AnimalMode {
                    user_id: user_id.to_string(),
                }
                .into());
            }
        }

        // Unknown fingerprint skips the device check rather than blocking
        if let Some(fingerprint) = ctx.fingerprint() {
            let posters = self
                .db
                .with_conn(|conn| messages::distinct_posters_for_fingerprint(conn, fingerprint))?;
            if posters.len() > 1 {
                warn!(
                    user_id = %user_id,
                    fingerprint = %fingerprint,
                    accounts = posters.len(),
                    "message blocked: multiple accounts on device"
                );
                return Err(Refusal::MultiAccountDevice {
                    accounts: posters.len(),
                }
                .into());
            }
        }

        let message = NewChatMessage {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            fingerprint: ctx.fingerprint().map(str::to_string),
            ip: ctx.ip().map(str::to_string),
            country: ctx.country().map(str::to_string),
            is_vpn: ctx.is_vpn(),
            created_at: Utc::now(),
        };
        let stored = self.db.with_conn(|conn| {
            messages::insert_message(conn, &message)?;
            messages::list_for_user(conn, user_id)
        })?;
        debug!(user_id = %user_id, message_id = %message.id, "message posted");

        stored
            .into_iter()
            .find(|m| m.id == message.id)
            .ok_or_else(|| GuardError::not_found("message", &message.id))
    }

    /// Visible messages, newest first. `None` uses the configured default.
    pub fn recent_messages(&self, limit: Option<u32>) -> Result<Vec<ChatMessageRow>> {
        let limit = limit.unwrap_or(self.default_limit);
        Ok(self
            .db
            .with_conn(|conn| messages::recent_visible(conn, limit))?)
    }
}
