mod common;

use chrono::{Duration, Utc};
use codeguard_engine::trades::{describe_trade, TradeSweepResult};
use codeguard_engine::{GuardError, Refusal, SessionContext, TradeFinding};
use codeguard_store::{trades, users, NewTrade, TradeStatus};

use common::{engine, login};

#[tokio::test]
async fn test_same_device_trade_is_blocked_without_writes() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-shared", "10.0.0.1").await;
    let code = engine.registry().generate_code(&alice).unwrap().code;
    login(&engine, "bob", "fp-shared", "10.0.0.2").await;

    let before = engine.stats().unwrap();
    let err = engine.trades().trade_code(&alice, &code.code, "bob").unwrap_err();
    assert!(matches!(err.refusal(), Some(Refusal::SameDevice)));

    assert_eq!(engine.registry().get_code(&code.code).unwrap(), code);
    assert_eq!(engine.stats().unwrap().trade_count, before.trade_count);
    assert!(engine.trades().get_trade_history("alice").unwrap().is_empty());
}

#[tokio::test]
async fn test_shared_ip_is_flagged_distinct_ip_completed() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-a", "10.0.0.1").await;
    let first = engine.registry().generate_code(&alice).unwrap().code.code;
    let second = engine.registry().generate_code(&alice).unwrap().code.code;
    login(&engine, "bob", "fp-b", "10.0.0.1").await;
    login(&engine, "carol", "fp-c", "10.0.0.3").await;

    let flagged = engine.trades().trade_code(&alice, &first, "bob").unwrap();
    assert_eq!(flagged.status, TradeStatus::Flagged);
    let completed = engine.trades().trade_code(&alice, &second, "carol").unwrap();
    assert_eq!(completed.status, TradeStatus::Completed);

    assert_eq!(engine.registry().get_code(&first).unwrap().holder_id, "bob");
    assert_eq!(engine.registry().get_code(&second).unwrap().holder_id, "carol");

    let history = engine.trades().get_trade_history("alice").unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].created_at >= history[1].created_at);
}

#[tokio::test]
async fn test_trade_preconditions() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-a", "10.0.0.1").await;
    let bob = login(&engine, "bob", "fp-b", "10.0.0.2").await;
    let code = engine.registry().generate_code(&alice).unwrap().code.code;

    let err = engine.trades().trade_code(&bob, &code, "alice").unwrap_err();
    assert!(matches!(err.refusal(), Some(Refusal::NotHolder { .. })));

    let err = engine.trades().trade_code(&alice, "1ZZZGO", "bob").unwrap_err();
    assert!(matches!(err, GuardError::NotFound { .. }));

    engine
        .db()
        .with_conn(|conn| users::ban_user(conn, "bob", "test", &Utc::now()))
        .unwrap();
    let err = engine.trades().trade_code(&alice, &code, "bob").unwrap_err();
    assert!(matches!(err.refusal(), Some(Refusal::Banned { .. })));

    engine.registry().redeem_code(&alice, &code).unwrap();
    let err = engine.trades().trade_code(&alice, &code, "carol").unwrap_err();
    assert!(matches!(err.refusal(), Some(Refusal::NotTransferable { .. })));
}

#[tokio::test]
async fn test_unknown_receiver_identity_does_not_block() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-a", "10.0.0.1").await;
    let code = engine.registry().generate_code(&alice).unwrap().code.code;

    let receipt = engine.trades().trade_code(&alice, &code, "newcomer").unwrap();
    assert_eq!(receipt.status, TradeStatus::Completed);
    let trade = engine.trades().get_trade(&receipt.trade_id).unwrap();
    assert_eq!(trade.to_fingerprint, None);
}

#[tokio::test]
async fn test_offer_accept_and_cancel() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-a", "10.0.0.1").await;
    let bob = login(&engine, "bob", "fp-b", "10.0.0.2").await;
    let carol = login(&engine, "carol", "fp-c", "10.0.0.3").await;
    let code = engine.registry().generate_code(&alice).unwrap().code.code;
    let spare = engine.registry().generate_code(&alice).unwrap().code.code;

    let offer = engine.trades().offer_trade(&alice, &code, "bob").unwrap();
    assert_eq!(offer.status, TradeStatus::Pending);
    assert_eq!(engine.registry().get_code(&code).unwrap().holder_id, "alice");

    let err = engine.trades().accept_offer(&carol, &offer.id).unwrap_err();
    assert!(matches!(err.refusal(), Some(Refusal::NotParty { .. })));

    let receipt = engine.trades().accept_offer(&bob, &offer.id).unwrap();
    assert_eq!(receipt.status, TradeStatus::Completed);
    assert_eq!(engine.registry().get_code(&code).unwrap().holder_id, "bob");

    let err = engine.trades().accept_offer(&bob, &offer.id).unwrap_err();
    assert!(matches!(err.refusal(), Some(Refusal::AlreadyResolved { .. })));

    let declined = engine.trades().offer_trade(&alice, &spare, "carol").unwrap();
    let cancelled = engine.trades().cancel_offer(&carol, &declined.id).unwrap();
    assert_eq!(cancelled.status, TradeStatus::Cancelled);
    assert_eq!(engine.registry().get_code(&spare).unwrap().holder_id, "alice");
}

#[tokio::test]
async fn test_sweep_flags_sender_velocity_with_window_note() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-a", "10.0.0.1").await;
    let code = engine.registry().generate_code(&alice).unwrap().code.code;
    let now = Utc::now();

    engine
        .db()
        .with_conn(|conn| {
            for i in 0..11 {
                trades::insert_trade(
                    conn,
                    &NewTrade {
                        id: format!("burst-{i}"),
                        code: code.clone(),
                        from_user: "alice".to_string(),
                        to_user: format!("buyer-{i}"),
                        from_fingerprint: Some("fp-a".to_string()),
                        to_fingerprint: Some(format!("fp-{i}")),
                        from_ip: Some("10.0.0.1".to_string()),
                        to_ip: Some(format!("10.9.0.{i}")),
                        status: TradeStatus::Completed,
                        created_at: now - Duration::minutes(i),
                    },
                )?;
            }
            Ok(())
        })
        .unwrap();

    let report = engine.trades().sweep_completed_trades(now).unwrap();
    assert_eq!(report.processed, 11);
    assert_eq!(report.flagged, 11);

    let item = &report.results[0];
    match &item.result {
        TradeSweepResult::Flagged { findings } => {
            assert!(findings.contains(&TradeFinding::SenderVelocity {
                count: 11,
                window_hours: 24
            }));
        }
        other => panic!("expected flagged, got {:?}", other),
    }

    let stored = engine.trades().get_trade("burst-0").unwrap();
    assert_eq!(stored.status, TradeStatus::Flagged);
    assert!(describe_trade(&stored).contains("24 hours"));
}

#[tokio::test]
async fn test_sweep_approves_clean_trade_and_checks_original_owner() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-a", "10.0.0.1").await;
    let bob = login(&engine, "bob", "fp-b", "10.0.0.2").await;
    login(&engine, "carol", "fp-c", "10.0.0.3").await;
    let code = engine.registry().generate_code(&alice).unwrap().code.code;

    let first = engine.trades().trade_code(&alice, &code, "bob").unwrap();
    let resale = engine.trades().trade_code(&bob, &code, "carol").unwrap();

    let report = engine.trades().sweep_completed_trades(Utc::now()).unwrap();
    assert_eq!(report.approved, 1);
    assert_eq!(report.flagged, 1);

    let clean = engine.trades().get_trade(&first.trade_id).unwrap();
    assert_eq!(clean.status, TradeStatus::Approved);
    assert_eq!(describe_trade(&clean), "trade verified, no findings");

    let resold = engine.trades().get_trade(&resale.trade_id).unwrap();
    assert_eq!(resold.status, TradeStatus::Flagged);
    assert!(describe_trade(&resold).contains("not the original owner"));

    // Nothing left in completed
    let again = engine.trades().sweep_completed_trades(Utc::now()).unwrap();
    assert_eq!(again.processed, 0);
}

#[tokio::test]
async fn test_sweep_flags_receiver_velocity() {
    let engine = engine();
    let now = Utc::now();

    let mut seeded = Vec::new();
    for i in 0..11 {
        let seller = format!("seller-{i}");
        let offline = SessionContext::unavailable(format!("s-{i}"), seller.clone(), "lookup failed");
        let code = engine.registry().generate_code(&offline).unwrap().code.code;
        seeded.push(NewTrade {
            id: format!("inbound-{i}"),
            code,
            from_user: seller,
            to_user: "hoarder".to_string(),
            from_fingerprint: Some(format!("fp-s{i}")),
            to_fingerprint: Some("fp-h".to_string()),
            from_ip: Some(format!("10.2.0.{i}")),
            to_ip: Some("10.3.0.1".to_string()),
            status: TradeStatus::Completed,
            created_at: now - Duration::minutes(i),
        });
    }
    engine
        .db()
        .with_conn(|conn| {
            for trade in &seeded {
                trades::insert_trade(conn, trade)?;
            }
            Ok(())
        })
        .unwrap();

    let report = engine.trades().sweep_completed_trades(now).unwrap();
    assert_eq!(report.flagged, 11);
    for item in &report.results {
        assert_eq!(
            item.result,
            TradeSweepResult::Flagged {
                findings: vec![TradeFinding::ReceiverVelocity {
                    count: 11,
                    window_hours: 24
                }]
            }
        );
    }
    let stored = engine.trades().get_trade("inbound-3").unwrap();
    assert!(describe_trade(&stored).contains("receiver got 11 trades in the last 24 hours"));
}

#[tokio::test]
async fn test_direct_trade_withdraws_open_offers() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-a", "10.0.0.1").await;
    let bob = login(&engine, "bob", "fp-b", "10.0.0.2").await;
    login(&engine, "carol", "fp-c", "10.0.0.3").await;
    login(&engine, "dave", "fp-d", "10.0.0.4").await;
    let code = engine.registry().generate_code(&alice).unwrap().code.code;

    let offer = engine.trades().offer_trade(&alice, &code, "bob").unwrap();
    let rival = engine.trades().offer_trade(&alice, &code, "dave").unwrap();
    engine.trades().trade_code(&alice, &code, "carol").unwrap();

    for id in [&offer.id, &rival.id] {
        let stale = engine.trades().get_trade(id).unwrap();
        assert_eq!(stale.status, TradeStatus::Cancelled);
    }
    let err = engine.trades().accept_offer(&bob, &offer.id).unwrap_err();
    assert!(matches!(err.refusal(), Some(Refusal::AlreadyResolved { .. })));
}

#[tokio::test]
async fn test_accepting_one_offer_cancels_the_rest() {
    let engine = engine();
    let alice = login(&engine, "alice", "fp-a", "10.0.0.1").await;
    let bob = login(&engine, "bob", "fp-b", "10.0.0.2").await;
    login(&engine, "carol", "fp-c", "10.0.0.3").await;
    let code = engine.registry().generate_code(&alice).unwrap().code.code;

    let to_bob = engine.trades().offer_trade(&alice, &code, "bob").unwrap();
    let to_carol = engine.trades().offer_trade(&alice, &code, "carol").unwrap();
    engine.trades().accept_offer(&bob, &to_bob.id).unwrap();

    assert_eq!(
        engine.trades().get_trade(&to_carol.id).unwrap().status,
        TradeStatus::Cancelled
    );
    assert_eq!(
        engine.trades().get_trade(&to_bob.id).unwrap().status,
        TradeStatus::Completed
    );
}
