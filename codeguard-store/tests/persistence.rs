//! File-backed store behaviour across reopen.

use chrono::{TimeZone, Utc};
use codeguard_store::{balances, claims, codes, identity, users, GuardDb};
use codeguard_store::{ClaimStatus, CodeStatus, IdentitySignalRow, NewClaim, NewCode};
use serde_json::json;
use tempfile::TempDir;

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("guard.db");
    let at = Utc.with_ymd_and_hms(2025, 2, 1, 12, 0, 0).unwrap();

    {
        let db = GuardDb::open(&path).unwrap();
        db.with_conn(|conn| {
            codes::insert_code(
                conn,
                &NewCode {
                    code: "1K9PGO".to_string(),
                    owner_id: "alice".to_string(),
                    fingerprint: Some("fp-a".to_string()),
                    ip: Some("192.0.2.1".to_string()),
                    country: Some("NL".to_string()),
                    value: 25,
                    created_at: at,
                },
            )?;
            identity::upsert_signal(
                conn,
                &IdentitySignalRow {
                    user_id: "alice".to_string(),
                    fingerprint: "fp-a".to_string(),
                    ip: "192.0.2.1".to_string(),
                    country: Some("NL".to_string()),
                    isp: None,
                    is_vpn: false,
                    region_locked_to: Some("NL".to_string()),
                    updated_at: at,
                },
            )?;
            claims::insert_claim(
                conn,
                &NewClaim {
                    id: "claim-1".to_string(),
                    code: "1K9PGO".to_string(),
                    claimant_id: "alice".to_string(),
                    reason: "mine".to_string(),
                    status: ClaimStatus::Pending,
                    findings: json!([]),
                    resolution_notes: None,
                    resolved_by: None,
                    created_at: at,
                    resolved_at: None,
                },
            )?;
            users::enter_animal_mode(conn, "alice", "1", &at)?;
            Ok(())
        })
        .unwrap();
        db.with_conn_mut(|conn| balances::redeem_code(conn, "1K9PGO", "alice", &at))
            .unwrap();
    }

    let db = GuardDb::open(&path).unwrap();
    let stats = db.stats().unwrap();
    assert_eq!(stats.code_count, 1);
    assert_eq!(stats.claim_count, 1);
    assert_eq!(stats.user_count, 1);

    db.with_conn(|conn| {
        let code = codes::get_code(conn, "1K9PGO")?.unwrap();
        assert_eq!(code.status, CodeStatus::Used);
        assert_eq!(code.used_at, Some(at));
        assert_eq!(balances::get_balance(conn, "alice")?, 25);
        assert_eq!(claims::list_pending_claims(conn)?.len(), 1);
        assert!(users::get_user(conn, "alice")?.unwrap().is_animal);
        Ok(())
    })
    .unwrap();
}
