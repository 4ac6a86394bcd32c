//! End-to-end engine tests over the in-memory store and account double.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;

use vouchsafe_account::{CredentialToken, InMemoryAccountService};
use vouchsafe_core::{Clock, CreditAmount, FixedClock, VoucherId};
use vouchsafe_store::{InMemoryLedgerStore, LedgerStore};
use vouchsafe_voucher::{CodeGenerator, NewVoucher, VoucherUpdate};

use crate::engine::{IssuedVoucher, ListFilter, RedemptionEngine};
use crate::error::{AdminError, RedeemError, RejectReason};

struct Harness {
    engine: RedemptionEngine,
    store: Arc<InMemoryLedgerStore>,
    accounts: Arc<InMemoryAccountService>,
    clock: Arc<FixedClock>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryLedgerStore::new());
    let accounts = Arc::new(InMemoryAccountService::new());
    let clock = Arc::new(FixedClock::at(Utc::now()));
    let codes = CodeGenerator::with_rng("test-deployment-secret", StdRng::seed_from_u64(1234));
    let engine = RedemptionEngine::new(
        store.clone(),
        accounts.clone(),
        clock.clone(),
        codes,
    );
    Harness {
        engine,
        store,
        accounts,
        clock,
    }
}

fn spec(name: &str, amount_minor: i64, usage_limit: u32) -> NewVoucher {
    NewVoucher {
        name: name.to_string(),
        amount: CreditAmount::from_minor_units(amount_minor).unwrap(),
        usage_limit: Some(usage_limit),
        expires_at: None,
        tags: vec![],
        created_by: "admin".to_string(),
    }
}

fn account(harness: &Harness, token: &str, limit_minor: i64) -> CredentialToken {
    let token = CredentialToken::new(token);
    harness.accounts.register(
        &token,
        format!("Account {}", token.expose()),
        CreditAmount::from_minor_units(limit_minor).unwrap(),
    );
    token
}

fn assert_rejected(result: Result<crate::RedemptionReceipt, RedeemError>, reason: RejectReason) {
    match result {
        Err(RedeemError::Rejected(actual)) => assert_eq!(actual, reason),
        other => panic!("expected rejection {reason}, got {other:?}"),
    }
}

#[tokio::test]
async fn create_then_redeem_full_walkthrough() {
    let h = harness();
    let issued = h
        .engine
        .create_voucher(spec("Walkthrough", 1000, 2))
        .await
        .unwrap();

    let token_a = account(&h, "tok-a", 500);
    let token_b = account(&h, "tok-b", 0);
    let token_c = account(&h, "tok-c", 0);

    // Account A: credited amount and new limit come back.
    let receipt = h
        .engine
        .redeem(issued.code.as_str(), &token_a, "10.0.0.1")
        .await
        .unwrap();
    assert_eq!(receipt.credited_amount.minor_units(), 1000);
    assert_eq!(receipt.new_credit_limit.minor_units(), 1500);
    let stored = h.engine.voucher(issued.voucher.id).await.unwrap();
    assert_eq!(stored.used_count, 1);

    // Account B: second use consumes the remaining headroom.
    let receipt = h
        .engine
        .redeem(issued.code.as_str(), &token_b, "10.0.0.2")
        .await
        .unwrap();
    assert_eq!(receipt.new_credit_limit.minor_units(), 1000);
    let stored = h.engine.voucher(issued.voucher.id).await.unwrap();
    assert_eq!(stored.used_count, 2);

    // Account C: exhausted.
    assert_rejected(
        h.engine.redeem(issued.code.as_str(), &token_c, "10.0.0.3").await,
        RejectReason::CodeExhausted,
    );
    let stored = h.engine.voucher(issued.voucher.id).await.unwrap();
    assert_eq!(stored.used_count, 2);
}

#[tokio::test]
async fn same_account_twice_is_already_redeemed() {
    let h = harness();
    // Plenty of headroom: idempotency must reject regardless.
    let issued = h
        .engine
        .create_voucher(spec("Generous", 1000, 10))
        .await
        .unwrap();
    let token = account(&h, "tok-repeat", 0);

    h.engine
        .redeem(issued.code.as_str(), &token, "10.0.0.1")
        .await
        .unwrap();
    assert_rejected(
        h.engine.redeem(issued.code.as_str(), &token, "10.0.0.1").await,
        RejectReason::AlreadyRedeemed,
    );

    // The rejection left no trace: used count still 1, limit credited once.
    let stored = h.engine.voucher(issued.voucher.id).await.unwrap();
    assert_eq!(stored.used_count, 1);
    assert_eq!(h.accounts.credit_limit(&token).unwrap().minor_units(), 1000);
}

#[tokio::test]
async fn unknown_code_bumps_the_rate_counter_once() {
    let h = harness();
    let token = account(&h, "tok-x", 0);
    let now = h.clock.now();

    assert_rejected(
        h.engine.redeem("RC_DEADBEEF0000", &token, "203.0.113.7").await,
        RejectReason::InvalidCode,
    );
    assert_eq!(
        h.store.attempt_count("203.0.113.7", now).await.unwrap(),
        1
    );

    // Other sources are untouched.
    assert_eq!(h.store.attempt_count("203.0.113.8", now).await.unwrap(), 0);
}

#[tokio::test]
async fn sixth_attempt_is_rate_limited_before_resolution() {
    let h = harness();
    let issued = h.engine.create_voucher(spec("Valid", 1000, 1)).await.unwrap();
    let token = account(&h, "tok-rl", 0);

    for _ in 0..5 {
        assert_rejected(
            h.engine.redeem("RC_000000000000", &token, "198.51.100.1").await,
            RejectReason::InvalidCode,
        );
    }

    // Even a *valid* code is now refused for this source, and the refusal
    // itself does not grow the counter.
    assert_rejected(
        h.engine.redeem(issued.code.as_str(), &token, "198.51.100.1").await,
        RejectReason::RateLimited,
    );
    assert_eq!(
        h.store
            .attempt_count("198.51.100.1", h.clock.now())
            .await
            .unwrap(),
        5
    );

    // A different source still redeems fine.
    h.engine
        .redeem(issued.code.as_str(), &token, "198.51.100.2")
        .await
        .unwrap();
}

#[tokio::test]
async fn rate_window_expires_by_time() {
    let h = harness();
    let token = account(&h, "tok-window", 0);

    for _ in 0..5 {
        assert_rejected(
            h.engine.redeem("RC_FFFFFFFFFFFF", &token, "198.51.100.9").await,
            RejectReason::InvalidCode,
        );
    }
    assert_rejected(
        h.engine.redeem("RC_FFFFFFFFFFFF", &token, "198.51.100.9").await,
        RejectReason::RateLimited,
    );

    h.clock.advance(Duration::seconds(3601));
    // Window expired: attempts resolve again (and fail on the merits).
    assert_rejected(
        h.engine.redeem("RC_FFFFFFFFFFFF", &token, "198.51.100.9").await,
        RejectReason::InvalidCode,
    );
}

#[tokio::test]
async fn expiry_boundary_is_strict_greater_than() {
    let h = harness();
    let expires_at = h.clock.now() + Duration::hours(1);
    let issued = h
        .engine
        .create_voucher(NewVoucher {
            expires_at: Some(expires_at),
            ..spec("Expiring", 1000, 2)
        })
        .await
        .unwrap();
    let token_a = account(&h, "tok-exp-a", 0);
    let token_b = account(&h, "tok-exp-b", 0);

    // Exactly at the expiry instant the voucher is still valid.
    h.clock.set(expires_at);
    h.engine
        .redeem(issued.code.as_str(), &token_a, "10.0.0.1")
        .await
        .unwrap();

    // One instant later it is not.
    h.clock.advance(Duration::milliseconds(1));
    assert_rejected(
        h.engine.redeem(issued.code.as_str(), &token_b, "10.0.0.1").await,
        RejectReason::CodeExpired,
    );
}

#[tokio::test]
async fn disabled_voucher_is_rejected_without_side_effects() {
    let h = harness();
    let issued = h.engine.create_voucher(spec("Paused", 1000, 1)).await.unwrap();
    let token = account(&h, "tok-d", 0);

    h.engine
        .update_voucher(
            issued.voucher.id,
            VoucherUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_rejected(
        h.engine.redeem(issued.code.as_str(), &token, "10.0.0.1").await,
        RejectReason::CodeDisabled,
    );
}

#[tokio::test]
async fn invalid_credential_is_rejected_after_voucher_checks() {
    let h = harness();
    let issued = h.engine.create_voucher(spec("Valid", 1000, 1)).await.unwrap();

    assert_rejected(
        h.engine
            .redeem(
                issued.code.as_str(),
                &CredentialToken::new("never-registered"),
                "10.0.0.1",
            )
            .await,
        RejectReason::InvalidAccount,
    );

    // No counter movement for a known code.
    assert_eq!(
        h.store.attempt_count("10.0.0.1", h.clock.now()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn batch_creates_distinct_independently_redeemable_codes() {
    let h = harness();
    let issued = h
        .engine
        .create_batch(spec("Promo", 500, 1), 100)
        .await
        .unwrap();
    assert_eq!(issued.len(), 100);

    let mut ids = std::collections::HashSet::new();
    let mut codes = std::collections::HashSet::new();
    for IssuedVoucher { voucher, code } in &issued {
        assert!(ids.insert(voucher.id));
        assert!(codes.insert(code.as_str().to_string()));
    }

    // Children are numbered off the template name.
    assert_eq!(issued[0].voucher.name, "Promo #1");
    assert_eq!(issued[99].voucher.name, "Promo #100");

    // Two arbitrary members redeem independently.
    let token = account(&h, "tok-batch", 0);
    h.engine
        .redeem(issued[7].code.as_str(), &token, "10.0.0.1")
        .await
        .unwrap();
    h.engine
        .redeem(issued[42].code.as_str(), &token, "10.0.0.1")
        .await
        .unwrap();
    assert_eq!(h.accounts.credit_limit(&token).unwrap().minor_units(), 1000);
}

#[tokio::test]
async fn batch_count_window_is_validated_up_front() {
    let h = harness();
    assert!(matches!(
        h.engine.create_batch(spec("Zero", 500, 1), 0).await,
        Err(AdminError::Domain(_))
    ));
    assert!(matches!(
        h.engine.create_batch(spec("Too many", 500, 1), 101).await,
        Err(AdminError::Domain(_))
    ));
    // Nothing was created by the rejected calls.
    assert!(h
        .engine
        .list_vouchers(ListFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn deleted_voucher_leaves_listings_but_keeps_history() {
    let h = harness();
    let issued = h.engine.create_voucher(spec("Doomed", 1000, 2)).await.unwrap();
    let token = account(&h, "tok-del", 0);
    h.engine
        .redeem(issued.code.as_str(), &token, "10.0.0.1")
        .await
        .unwrap();
    let record_id = h.engine.records_for_voucher(issued.voucher.id, None).await.unwrap()[0].id;

    h.engine.delete_voucher(issued.voucher.id).await.unwrap();

    // Hidden from the default listing, visible when asked.
    assert!(h
        .engine
        .list_vouchers(ListFilter::default())
        .await
        .unwrap()
        .is_empty());
    let all = h
        .engine
        .list_vouchers(ListFilter {
            include_deleted: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].deleted);

    // The code no longer resolves.
    let token_b = account(&h, "tok-del-b", 0);
    assert_rejected(
        h.engine.redeem(issued.code.as_str(), &token_b, "10.0.0.2").await,
        RejectReason::InvalidCode,
    );

    // Past records remain queryable, by voucher and by id.
    let records = h
        .engine
        .records_for_voucher(issued.voucher.id, None)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(h.store.record(record_id).await.unwrap().is_some());

    // Deleting an unknown voucher is NotFound.
    assert!(matches!(
        h.engine.delete_voucher(VoucherId::new()).await,
        Err(AdminError::Domain(vouchsafe_core::DomainError::NotFound))
    ));
}

#[tokio::test]
async fn exact_code_filter_lists_one_voucher_without_plaintext() {
    let h = harness();
    let issued = h.engine.create_voucher(spec("Findable", 1000, 1)).await.unwrap();
    h.engine.create_voucher(spec("Other", 1000, 1)).await.unwrap();

    let found = h
        .engine
        .list_vouchers(ListFilter {
            code: Some(issued.code.as_str().to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, issued.voucher.id);

    // The stored record carries only the keyed hash, never the plaintext.
    assert_ne!(found[0].code_hash.as_str(), issued.code.as_str());
    assert!(!found[0].code_hash.as_str().contains(issued.code.as_str()));

    let missing = h
        .engine
        .list_vouchers(ListFilter {
            code: Some("RC_000000000001".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn audit_trail_orders_and_bounds_queries() {
    let h = harness();
    let first = h.engine.create_voucher(spec("First", 100, 5)).await.unwrap();
    let second = h.engine.create_voucher(spec("Second", 200, 5)).await.unwrap();

    let token_a = account(&h, "tok-au-a", 0);
    let token_b = account(&h, "tok-au-b", 0);

    h.engine.redeem(first.code.as_str(), &token_a, "s1").await.unwrap();
    h.clock.advance(Duration::seconds(1));
    h.engine.redeem(second.code.as_str(), &token_a, "s1").await.unwrap();
    h.clock.advance(Duration::seconds(1));
    h.engine.redeem(first.code.as_str(), &token_b, "s2").await.unwrap();

    // Global listing: newest first, bounded.
    let recent = h.engine.recent_records(None).await.unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].voucher_name, "First");
    assert_eq!(recent[0].account_name, "Account tok-au-b");
    assert_eq!(recent[2].voucher_name, "First");
    let bounded = h.engine.recent_records(Some(2)).await.unwrap();
    assert_eq!(bounded.len(), 2);

    // Per-voucher listing: oldest first, snapshots intact.
    let records = h.engine.records_for_voucher(first.voucher.id, None).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].account_name, "Account tok-au-a");
    assert_eq!(records[0].amount.minor_units(), 100);
    assert_eq!(records[0].limit_before.minor_units(), 0);
    assert_eq!(records[0].limit_after.minor_units(), 100);
    let bounded = h.engine.records_for_voucher(first.voucher.id, Some(1)).await.unwrap();
    assert_eq!(bounded.len(), 1);
}

#[tokio::test]
async fn record_snapshots_survive_voucher_edits() {
    let h = harness();
    let issued = h.engine.create_voucher(spec("Original", 1000, 5)).await.unwrap();
    let token = account(&h, "tok-snap", 0);
    h.engine.redeem(issued.code.as_str(), &token, "s1").await.unwrap();

    h.engine
        .update_voucher(
            issued.voucher.id,
            VoucherUpdate {
                name: Some("Renamed".to_string()),
                amount: Some(CreditAmount::from_minor_units(9999).unwrap()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let records = h.engine.records_for_voucher(issued.voucher.id, None).await.unwrap();
    assert_eq!(records[0].voucher_name, "Original");
    assert_eq!(records[0].amount.minor_units(), 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redeemers_on_limit_one_never_both_commit() {
    // Run the race repeatedly; exactly one COMMITTED and one CODE_EXHAUSTED
    // must come out every time, regardless of interleaving.
    for round in 0..20 {
        let h = harness();
        let issued = h
            .engine
            .create_voucher(spec(&format!("Race {round}"), 1000, 1))
            .await
            .unwrap();
        let token_a = account(&h, "tok-race-a", 0);
        let token_b = account(&h, "tok-race-b", 0);

        let engine = Arc::new(h.engine);
        let code = issued.code.as_str().to_string();

        let a = {
            let engine = Arc::clone(&engine);
            let code = code.clone();
            tokio::spawn(async move { engine.redeem(&code, &token_a, "10.0.0.1").await })
        };
        let b = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.redeem(&code, &token_b, "10.0.0.2").await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let committed = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(committed, 1, "exactly one racer may commit");
        let loser = results.iter().find(|r| r.is_err()).unwrap();
        match loser {
            Err(RedeemError::Rejected(RejectReason::CodeExhausted)) => {}
            other => panic!("loser must observe CODE_EXHAUSTED, got {other:?}"),
        }

        let stored = h.store.voucher(issued.voucher.id).await.unwrap().unwrap();
        assert_eq!(stored.used_count, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_account_never_double_credits() {
    for _ in 0..20 {
        let h = harness();
        let issued = h.engine.create_voucher(spec("Race", 1000, 10)).await.unwrap();
        let token = account(&h, "tok-dup", 0);

        let engine = Arc::new(h.engine);
        let code = issued.code.as_str().to_string();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let code = code.clone();
                let token = token.clone();
                tokio::spawn(async move { engine.redeem(&code, &token, "10.0.0.1").await })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(RedeemError::Rejected(RejectReason::AlreadyRedeemed)) => {}
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(h.accounts.credit_limit(&token).unwrap().minor_units(), 1000);
    }
}

#[tokio::test]
async fn credit_failure_after_commit_surfaces_reconciliation() {
    let h = harness();
    let issued = h.engine.create_voucher(spec("Fragile", 1000, 5)).await.unwrap();
    let token = account(&h, "tok-recon", 0);

    h.accounts.fail_credit_increases(true);
    let result = h.engine.redeem(issued.code.as_str(), &token, "10.0.0.1").await;
    let record_id = match result {
        Err(RedeemError::ReconciliationNeeded {
            record_id,
            voucher_id,
            amount,
            ..
        }) => {
            assert_eq!(voucher_id, issued.voucher.id);
            assert_eq!(amount.minor_units(), 1000);
            record_id
        }
        other => panic!("expected ReconciliationNeeded, got {other:?}"),
    };

    // The ledger is committed exactly once: the record exists and the money
    // was never moved.
    assert!(h.store.record(record_id).await.unwrap().is_some());
    let stored = h.engine.voucher(issued.voucher.id).await.unwrap();
    assert_eq!(stored.used_count, 1);
    assert_eq!(h.accounts.credit_limit(&token).unwrap().minor_units(), 0);

    // A caller retry cannot double-commit or double-credit: the marker
    // already exists, so the retry rejects before any side effect.
    h.accounts.fail_credit_increases(false);
    assert_rejected(
        h.engine.redeem(issued.code.as_str(), &token, "10.0.0.1").await,
        RejectReason::AlreadyRedeemed,
    );
    let stored = h.engine.voucher(issued.voucher.id).await.unwrap();
    assert_eq!(stored.used_count, 1);
}

#[tokio::test]
async fn update_validation_rejects_before_any_write() {
    let h = harness();
    let issued = h.engine.create_voucher(spec("Fixed", 1000, 1)).await.unwrap();

    let result = h
        .engine
        .update_voucher(
            issued.voucher.id,
            VoucherUpdate {
                amount: Some(CreditAmount::ZERO),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(AdminError::Domain(_))));

    let stored = h.engine.voucher(issued.voucher.id).await.unwrap();
    assert_eq!(stored.amount.minor_units(), 1000);
}
