#![allow(dead_code)]

use std::sync::Arc;

use codeguard_arbiter::{Arbiter, RuleBasedArbiter};
use codeguard_engine::identity::StaticIdentityProvider;
use codeguard_engine::{EngineConfig, IntegrityEngine, Session, SessionContext};
use codeguard_store::GuardDb;

pub fn engine() -> IntegrityEngine {
    engine_with(EngineConfig::default(), Arc::new(RuleBasedArbiter::new()))
}

pub fn engine_with(config: EngineConfig, arbiter: Arc<dyn Arbiter>) -> IntegrityEngine {
    IntegrityEngine::new(
        config,
        Arc::new(GuardDb::open_in_memory().unwrap()),
        Arc::new(StaticIdentityProvider::new().with_default_country("US")),
        arbiter,
    )
    .unwrap()
}

/// Capture a fresh session for `user` presenting `fingerprint` from `ip`.
pub async fn login(
    engine: &IntegrityEngine,
    user: &str,
    fingerprint: &str,
    ip: &str,
) -> Arc<SessionContext> {
    let session = Session::new(format!("{user}-{fingerprint}-{ip}"), user, ip)
        .with_visitor_id(fingerprint);
    let ctx = engine.collector().capture(&session).await.unwrap();
    assert!(ctx.signal().is_some(), "identity should be known");
    ctx
}
