use entitlement_store::{EntitlementStore, StoreError};
use entitlement_types::{NewTransition, SubscriptionId, SubscriptionRecord, SubscriptionState};
use pretty_assertions::assert_eq;

fn record(account: &str, token: &str, state: SubscriptionState) -> SubscriptionRecord {
    let mut r = SubscriptionRecord::new(account, 1_000);
    r.purchase_token = token.to_string();
    r.product_id = "std.tier".to_string();
    r.plan_id = "monthly".to_string();
    r.state = state;
    r
}

fn with_id(mut r: SubscriptionRecord, id: i64) -> SubscriptionRecord {
    r.id = Some(SubscriptionId::new(id));
    r
}

// ── Atomic writes ────────────────────────────────────────────────

#[test]
fn upsert_and_history_commit_together() {
    let store = EntitlementStore::open_in_memory().unwrap();
    let id = store
        .atomically(|tx| {
            let id = tx.upsert_current(&record("acct", "", SubscriptionState::PurchasePending))?;
            tx.append_history(&NewTransition {
                subscription_id: id,
                from_state: SubscriptionState::Initial,
                to_state: SubscriptionState::PurchasePending,
                timestamp_ms: 1_000,
                reason: Some("start".into()),
            })?;
            Ok(id)
        })
        .unwrap();

    let current = store.get_current("acct").unwrap().unwrap();
    assert_eq!(current.id, Some(id));
    assert_eq!(current.state, SubscriptionState::PurchasePending);

    let history = store.get_history(id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_state, SubscriptionState::Initial);
    assert_eq!(history[0].reason.as_deref(), Some("start"));
}

#[test]
fn failure_after_upsert_rolls_back_both_rows() {
    let store = EntitlementStore::open_in_memory().unwrap();
    let result: Result<(), StoreError> = store.atomically(|tx| {
        tx.upsert_current(&record("acct", "tok", SubscriptionState::Active))?;
        Err(StoreError::InvalidData("simulated crash".into()))
    });
    assert!(result.is_err());
    assert!(store.get_current("acct").unwrap().is_none());
    assert_eq!(store.audit().total_transitions().unwrap(), 0);
}

#[test]
fn failed_history_append_rolls_back_record_update() {
    let store = EntitlementStore::open_in_memory().unwrap();
    let id = store
        .upsert_current(&record("acct", "tok", SubscriptionState::Active))
        .unwrap();

    let mut changed = store.get_by_id(id).unwrap().unwrap();
    changed.state = SubscriptionState::Cancelled;
    let result = store.atomically(|tx| {
        tx.upsert_current(&changed)?;
        // same from/to is rejected
        tx.append_history(&NewTransition {
            subscription_id: id,
            from_state: SubscriptionState::Active,
            to_state: SubscriptionState::Active,
            timestamp_ms: 2_000,
            reason: None,
        })
    });
    assert!(matches!(result, Err(StoreError::InvalidData(_))));
    assert_eq!(
        store.get_by_id(id).unwrap().unwrap().state,
        SubscriptionState::Active
    );
}

#[test]
fn upsert_with_id_replaces_row() {
    let store = EntitlementStore::open_in_memory().unwrap();
    let id = store
        .upsert_current(&record("acct", "tok", SubscriptionState::AckPending))
        .unwrap();
    let mut r = store.get_by_id(id).unwrap().unwrap();
    r.state = SubscriptionState::Active;
    r.last_updated_ms = 5_000;
    assert_eq!(store.upsert_current(&r).unwrap(), id);

    let all = store.list_for_account("acct").unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state, SubscriptionState::Active);
}

// ── Lookups ──────────────────────────────────────────────────────

#[test]
fn get_current_picks_most_recently_updated() {
    let store = EntitlementStore::open_in_memory().unwrap();
    let mut old = record("acct", "a", SubscriptionState::Expired);
    old.last_updated_ms = 100;
    let mut new = record("acct", "b", SubscriptionState::Active);
    new.last_updated_ms = 200;
    store.upsert_current(&new).unwrap();
    store.upsert_current(&old).unwrap();
    store
        .upsert_current(&record("other", "c", SubscriptionState::Revoked))
        .unwrap();

    let current = store.get_current("acct").unwrap().unwrap();
    assert_eq!(current.purchase_token, "b");
    assert!(store.get_current("nobody").unwrap().is_none());
}

#[test]
fn get_by_token_ignores_empty_token() {
    let store = EntitlementStore::open_in_memory().unwrap();
    store
        .upsert_current(&record("acct", "", SubscriptionState::PurchasePending))
        .unwrap();
    assert!(store.get_by_token("").unwrap().is_none());
    store
        .upsert_current(&record("acct", "tok", SubscriptionState::Active))
        .unwrap();
    assert_eq!(
        store.get_by_token("tok").unwrap().unwrap().state,
        SubscriptionState::Active
    );
}

#[test]
fn unknown_state_code_loads_as_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ent.db");
    let id = {
        let store = EntitlementStore::open(&path).unwrap();
        store
            .upsert_current(&record("acct", "tok", SubscriptionState::Active))
            .unwrap()
    };
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE subscription_status SET state = 42 WHERE id = ?1",
            [id.get()],
        )
        .unwrap();
    }
    let store = EntitlementStore::open(&path).unwrap();
    assert_eq!(
        store.get_by_id(id).unwrap().unwrap().state,
        SubscriptionState::Unknown
    );
}

// ── Round-trip ───────────────────────────────────────────────────

#[test]
fn file_backed_round_trip_preserves_millis() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ent.db");

    let mut original = record("acct", "tok-rt", SubscriptionState::Active);
    original.purchase_time_ms = 1_700_000_000_123;
    original.billing_expiry_ms = 1_702_592_000_123;
    original.account_expiry_ms = 1_703_196_800_999;
    original.developer_payload = r#"{"cid":"acct"}"#.to_string();
    original.last_updated_ms = 1_700_000_000_456;

    let id = {
        let store = EntitlementStore::open(&path).unwrap();
        store.upsert_current(&original).unwrap()
    };

    let reopened = EntitlementStore::open(&path).unwrap();
    let loaded = reopened.get_by_id(id).unwrap().unwrap();
    original.id = Some(id);
    assert_eq!(loaded, original);
}

// ── Reconciliation queries ───────────────────────────────────────

#[test]
fn find_expired_where_filters_by_expiry_and_state() {
    let store = EntitlementStore::open_in_memory().unwrap();
    let now = 10_000;

    let mut past = record("acct", "a", SubscriptionState::Active);
    past.billing_expiry_ms = now - 1;
    let mut never_set = record("acct", "b", SubscriptionState::Active);
    never_set.billing_expiry_ms = 0;
    let mut future = record("acct", "c", SubscriptionState::Active);
    future.billing_expiry_ms = now + 1;
    let mut already = record("acct", "d", SubscriptionState::Expired);
    already.billing_expiry_ms = 1;
    let mut revoked = record("acct", "e", SubscriptionState::Revoked);
    revoked.billing_expiry_ms = 1;
    let mut cancelled = record("acct", "f", SubscriptionState::Cancelled);
    cancelled.billing_expiry_ms = 1;

    for r in [&past, &never_set, &future, &already, &revoked, &cancelled] {
        store.upsert_current(r).unwrap();
    }

    let tokens: Vec<_> = store
        .find_expired_where(now)
        .unwrap()
        .into_iter()
        .map(|r| r.purchase_token)
        .collect();
    assert_eq!(tokens, vec!["a".to_string(), "f".to_string()]);
}

#[test]
fn delete_older_than_only_touches_matching_state() {
    let store = EntitlementStore::open_in_memory().unwrap();
    let mut old_expired = record("acct", "a", SubscriptionState::Expired);
    old_expired.last_updated_ms = 100;
    let mut new_expired = record("acct", "b", SubscriptionState::Expired);
    new_expired.last_updated_ms = 900;
    let mut old_active = record("acct", "c", SubscriptionState::Active);
    old_active.last_updated_ms = 100;
    for r in [&old_expired, &new_expired, &old_active] {
        store.upsert_current(r).unwrap();
    }

    assert_eq!(
        store.delete_older_than(SubscriptionState::Expired, 500).unwrap(),
        1
    );
    let left: Vec<_> = store
        .list_for_account("acct")
        .unwrap()
        .into_iter()
        .map(|r| r.purchase_token)
        .collect();
    assert_eq!(left, vec!["b".to_string(), "c".to_string()]);
}

#[test]
fn purge_history_before_cutoff() {
    let store = EntitlementStore::open_in_memory().unwrap();
    let id = store
        .upsert_current(&record("acct", "tok", SubscriptionState::Active))
        .unwrap();
    store
        .atomically(|tx| {
            for (ts, to) in [
                (100, SubscriptionState::PurchasePending),
                (200, SubscriptionState::Active),
                (300, SubscriptionState::Cancelled),
            ] {
                tx.append_history(&NewTransition {
                    subscription_id: id,
                    from_state: SubscriptionState::Initial,
                    to_state: to,
                    timestamp_ms: ts,
                    reason: None,
                })?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(store.purge_history_before(250).unwrap(), 2);
    assert_eq!(store.get_history(id).unwrap().len(), 1);
}

// ── Duplicate tokens ─────────────────────────────────────────────

#[test]
fn remove_duplicate_tokens_keeps_lowest_id() {
    let store = EntitlementStore::open_in_memory().unwrap();
    for id in [5, 7, 9] {
        store
            .upsert_current(&with_id(record("acct", "dup", SubscriptionState::Active), id))
            .unwrap();
    }
    store
        .upsert_current(&with_id(record("acct", "solo", SubscriptionState::Active), 11))
        .unwrap();

    assert_eq!(store.find_duplicate_tokens().unwrap(), vec![("dup".to_string(), 3)]);
    assert_eq!(store.remove_duplicate_tokens().unwrap(), 2);

    let remaining: Vec<_> = store
        .list_for_account("acct")
        .unwrap()
        .into_iter()
        .filter(|r| r.purchase_token == "dup")
        .map(|r| r.id.unwrap().get())
        .collect();
    assert_eq!(remaining, vec![5]);
    assert!(store.find_duplicate_tokens().unwrap().is_empty());
    assert!(store.get_by_token("solo").unwrap().is_some());
}

#[test]
fn rows_without_token_are_never_duplicates() {
    let store = EntitlementStore::open_in_memory().unwrap();
    for _ in 0..3 {
        store
            .upsert_current(&record("acct", "", SubscriptionState::PurchaseFailed))
            .unwrap();
    }
    assert!(store.find_duplicate_tokens().unwrap().is_empty());
    assert_eq!(store.remove_duplicate_tokens().unwrap(), 0);
    assert_eq!(store.list_for_account("acct").unwrap().len(), 3);
}

#[test]
fn terminal_rows_do_not_count_as_duplicates() {
    let store = EntitlementStore::open_in_memory().unwrap();
    store
        .upsert_current(&with_id(record("acct", "tok", SubscriptionState::PurchaseFailed), 1))
        .unwrap();
    store
        .upsert_current(&with_id(record("acct", "tok", SubscriptionState::Active), 2))
        .unwrap();
    store
        .upsert_current(&with_id(record("acct", "tok", SubscriptionState::Revoked), 3))
        .unwrap();

    assert!(store.find_duplicate_tokens().unwrap().is_empty());
    assert_eq!(store.remove_duplicate_tokens().unwrap(), 0);
    assert_eq!(store.list_for_account("acct").unwrap().len(), 3);
}

#[test]
fn get_by_token_prefers_live_row() {
    let store = EntitlementStore::open_in_memory().unwrap();
    store
        .upsert_current(&with_id(record("acct", "tok", SubscriptionState::PurchaseFailed), 1))
        .unwrap();
    store
        .upsert_current(&with_id(record("acct", "tok", SubscriptionState::Expired), 2))
        .unwrap();

    let found = store.get_by_token("tok").unwrap().unwrap();
    assert_eq!(found.id, Some(SubscriptionId::new(2)));
    assert_eq!(found.state, SubscriptionState::Expired);
}
