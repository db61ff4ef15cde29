//! IntegrityEngine - wires every component over one store.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use codeguard_arbiter::{Arbiter, OpenAiArbiter, RuleBasedArbiter};
use codeguard_store::{DbStats, GuardDb};

use crate::claims::{ClaimAdjudicator, ClaimSweepReport};
use crate::config::{ClaimsConfig, EngineConfig};
use crate::error::{GuardError, Result};
use crate::gatekeeper::{MessageGate, WatchTracker};
use crate::identity::{HttpIdentityProvider, IdentityCollector, IdentityProvider};
use crate::registry::CodeRegistry;
use crate::sweep::{PolicySweep, SweepSummary};
use crate::trades::{TradeSweepReport, TradeValidator};
use crate::users::UserRegistry;

/// Which batch passes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Claims,
    Trades,
    Policy,
    All,
}

/// Combined output of a sweep trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub ran_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<ClaimSweepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trades: Option<TradeSweepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<SweepSummary>,
}

/// The integrity engine.
///
/// Owns the shared store and hands out the per-concern services. Every
/// service borrows the same `Arc<GuardDb>`.
pub struct IntegrityEngine {
    config: EngineConfig,
    db: Arc<GuardDb>,
    collector: IdentityCollector,
    registry: CodeRegistry,
    claims: ClaimAdjudicator,
    trades: TradeValidator,
    policy: PolicySweep,
    messages: MessageGate,
    watch: Arc<WatchTracker>,
    users: UserRegistry,
}

impl IntegrityEngine {
    /// Assemble an engine from explicit collaborators.
    pub fn new(
        config: EngineConfig,
        db: Arc<GuardDb>,
        provider: Arc<dyn IdentityProvider>,
        arbiter: Arc<dyn Arbiter>,
    ) -> Result<Self> {
        config.validate()?;

        let collector = IdentityCollector::new(provider, db.clone(), config.identity.lookup_timeout())
            .with_session_ttl(config.identity.session_ttl());
        let registry = CodeRegistry::new(db.clone(), config.registry.clone())?;
        let claims = ClaimAdjudicator::new(db.clone(), arbiter, config.claims.arbiter_timeout());
        let trades = TradeValidator::new(db.clone(), config.trades.clone());
        let policy = PolicySweep::new(db.clone(), config.sweep.clone());
        let messages = MessageGate::new(db.clone(), config.gatekeeper.default_message_limit);
        let watch = Arc::new(WatchTracker::new(db.clone(), &config.gatekeeper));
        let users = UserRegistry::new(db.clone(), config.sweep.default_animal_level.clone());

        info!(arbiter = %claims.arbiter_id(), "integrity engine ready");
        Ok(Self {
            config,
            db,
            collector,
            registry,
            claims,
            trades,
            policy,
            messages,
            watch,
            users,
        })
    }

    /// Open the configured database with the HTTP identity provider and
    /// the configured arbiter.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let db = Arc::new(GuardDb::open(Path::new(&config.general.database_path))?);
        let provider = HttpIdentityProvider::new(
            config.identity.geo_url_template.clone(),
            config.identity.geo_token.clone(),
        )
        .map_err(|e| GuardError::Config(e.to_string()))?;
        let arbiter = build_arbiter(&config.claims)?;
        Self::new(config, db, Arc::new(provider), arbiter)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<GuardDb> {
        &self.db
    }

    pub fn collector(&self) -> &IdentityCollector {
        &self.collector
    }

    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    pub fn claims(&self) -> &ClaimAdjudicator {
        &self.claims
    }

    pub fn trades(&self) -> &TradeValidator {
        &self.trades
    }

    pub fn policy(&self) -> &PolicySweep {
        &self.policy
    }

    pub fn messages(&self) -> &MessageGate {
        &self.messages
    }

    pub fn watch(&self) -> &Arc<WatchTracker> {
        &self.watch
    }

    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    pub fn stats(&self) -> Result<DbStats> {
        Ok(self.db.stats()?)
    }

    /// Run the requested sweeps in claims, trades, policy order.
    ///
    /// Claim and trade sweeps report per-item errors; a policy phase abort
    /// is returned as an error.
    pub fn run_sweeps(&self, kind: SweepKind, now: DateTime<Utc>) -> Result<SweepReport> {
        let wants = |k: SweepKind| kind == SweepKind::All || kind == k;
        let mut report = SweepReport {
            ran_at: Some(now),
            ..SweepReport::default()
        };

        if wants(SweepKind::Claims) {
            report.claims = Some(self.claims.sweep_pending_claims(now)?);
        }
        if wants(SweepKind::Trades) {
            report.trades = Some(self.trades.sweep_completed_trades(now)?);
        }
        if wants(SweepKind::Policy) {
            report.policy = Some(self.policy.run(now)?);
        }
        Ok(report)
    }
}

/// Arbiter named by `claims.arbiter`: `rule-based`, `openai` or `ollama`.
pub fn build_arbiter(config: &ClaimsConfig) -> Result<Arc<dyn Arbiter>> {
    let model = config.arbiter_model.as_deref().unwrap_or("gpt-4o-mini");
    match config.arbiter.as_str() {
        "rule-based" => Ok(Arc::new(RuleBasedArbiter::new())),
        "openai" => {
            let arbiter = match &config.arbiter_base_url {
                Some(base_url) => {
                    OpenAiArbiter::new(base_url.clone(), model, config.arbiter_api_key.clone())
                }
                None => {
                    let key = config.arbiter_api_key.clone().ok_or_else(|| {
                        GuardError::Config("openai arbiter needs an api key".to_string())
                    })?;
                    OpenAiArbiter::openai(model, key)
                }
            }
            .map_err(|e| GuardError::Config(e.to_string()))?;
            Ok(Arc::new(arbiter))
        }
        "ollama" => {
            let model = config.arbiter_model.as_deref().unwrap_or("llama3.1");
            let arbiter = match &config.arbiter_base_url {
                Some(base_url) => OpenAiArbiter::new(base_url.clone(), model, None),
                None => OpenAiArbiter::ollama(model),
            }
            .map_err(|e| GuardError::Config(e.to_string()))?;
            Ok(Arc::new(arbiter))
        }
        other => Err(GuardError::Config(format!("unknown arbiter: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentityProvider;

    fn engine() -> IntegrityEngine {
        IntegrityEngine::new(
            EngineConfig::default(),
            Arc::new(GuardDb::open_in_memory().unwrap()),
            Arc::new(StaticIdentityProvider::new()),
            Arc::new(RuleBasedArbiter::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_build_arbiter() {
        let mut config = ClaimsConfig::default();
        assert_eq!(build_arbiter(&config).unwrap().id(), "rule-based");

        config.arbiter = "openai".to_string();
        assert!(matches!(build_arbiter(&config), Err(GuardError::Config(_))));
        config.arbiter_api_key = Some("sk-test".to_string());
        assert!(build_arbiter(&config).is_ok());

        config.arbiter = "oracle".to_string();
        assert!(build_arbiter(&config).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.registry.middle_length = 9;
        let result = IntegrityEngine::new(
            config,
            Arc::new(GuardDb::open_in_memory().unwrap()),
            Arc::new(StaticIdentityProvider::new()),
            Arc::new(RuleBasedArbiter::new()),
        );
        assert!(matches!(result, Err(GuardError::Config(_))));
    }

    #[test]
    fn test_run_selected_sweeps() {
        let engine = engine();
        let now = Utc::now();

        let report = engine.run_sweeps(SweepKind::Policy, now).unwrap();
        assert!(report.claims.is_none());
        assert!(report.trades.is_none());
        assert_eq!(report.policy.unwrap().violations, 0);

        let report = engine.run_sweeps(SweepKind::All, now).unwrap();
        assert_eq!(report.claims.unwrap().processed, 0);
        assert_eq!(report.trades.unwrap().processed, 0);
        assert!(report.policy.is_some());

        let json = serde_json::to_value(engine.run_sweeps(SweepKind::Claims, now).unwrap()).unwrap();
        assert!(json.get("trades").is_none());
    }
}
