mod common;

use chrono::Utc;
use codeguard_engine::{Refusal, SweepKind};
use codeguard_store::{audit, MessageStatus, TradeStatus, ViolationKind};

use common::{engine, login};

#[tokio::test]
async fn test_policy_sweep_bans_second_device_account_and_propagates() {
    let engine = engine();
    login(&engine, "first", "fp-cat", "10.0.0.1").await;
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = login(&engine, "second", "fp-cat", "10.0.0.2").await;
    let buyer = login(&engine, "buyer", "fp-b", "10.0.0.3").await;

    // Activity before either account turns animal
    let code = engine.registry().generate_code(&buyer).unwrap().code.code;
    let offer = engine.trades().offer_trade(&buyer, &code, "second").unwrap();
    engine.messages().send_message(&second, "hello from second").unwrap();

    engine.users().enter_animal_mode("first", None).unwrap();
    engine.users().enter_animal_mode("second", None).unwrap();

    let report = engine.run_sweeps(SweepKind::Policy, Utc::now()).unwrap();
    let summary = report.policy.unwrap();
    assert_eq!(summary.newly_banned, vec!["second".to_string()]);
    assert_eq!(summary.cancelled_trades, 1);
    assert_eq!(summary.hidden_messages, 1);
    assert_eq!(summary.animal_users, 2);

    let status = engine.users().user_status("second").unwrap();
    assert!(status.banned);
    assert!(status.ban_reason.unwrap().contains("device"));
    assert!(!engine.users().user_status("first").unwrap().banned);

    assert_eq!(
        engine.trades().get_trade(&offer.id).unwrap().status,
        TradeStatus::Cancelled
    );
    assert!(engine.messages().recent_messages(None).unwrap().is_empty());
    let violations = engine
        .users()
        .violations(Some(ViolationKind::MultipleAnimalAccounts), 10)
        .unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].subject_ids, vec!["first".to_string(), "second".to_string()]);

    // Banned users cannot act
    let err = engine.messages().send_message(&second, "still here").unwrap_err();
    assert!(matches!(err.refusal(), Some(Refusal::Banned { .. })));
}

#[tokio::test]
async fn test_policy_sweep_twice_adds_no_violations() {
    let engine = engine();
    login(&engine, "a", "fp-1", "10.0.0.1").await;
    login(&engine, "b", "fp-1", "10.0.0.2").await;
    let giver = login(&engine, "giver", "fp-2", "10.0.0.3").await;
    login(&engine, "taker", "fp-2", "10.0.0.4").await;
    for user in ["a", "b", "giver", "taker"] {
        engine.users().enter_animal_mode(user, None).unwrap();
    }
    engine.users().record_animal_transfer(&giver, "taker").unwrap();

    let first = engine.policy().run(Utc::now()).unwrap();
    assert!(first.violations > 0);
    let recorded = engine.db().with_conn(audit::count_violations).unwrap();

    let second = engine.policy().run(Utc::now()).unwrap();
    assert_eq!(second.violations, 0);
    assert!(second.newly_banned.is_empty());
    assert_eq!(engine.db().with_conn(audit::count_violations).unwrap(), recorded);
}

#[tokio::test]
async fn test_policy_abort_leaves_message_state_alone() {
    let engine = engine();
    let spammer = login(&engine, "spammer", "fp-s", "10.0.0.1").await;
    engine.messages().send_message(&spammer, "buy codes").unwrap();
    engine
        .db()
        .with_conn(|conn| {
            codeguard_store::users::ban_user(conn, "spammer", "manual", &Utc::now())?;
            conn.execute("DROP TABLE animal_transfers", [])?;
            Ok(())
        })
        .unwrap();

    assert!(engine.run_sweeps(SweepKind::All, Utc::now()).is_err());
    let msgs = engine
        .db()
        .with_conn(|conn| codeguard_store::messages::list_for_user(conn, "spammer"))
        .unwrap();
    assert_eq!(msgs[0].status, MessageStatus::Visible);
}
