//! Shared test helpers for engine tests.

#![allow(dead_code)]

use async_trait::async_trait;
use entitlement_engine::{
    EngineConfig, EntitlementError, EntitlementMachine, EntitlementResult, EventIngestor,
    PurchaseSource, RemoteEntitlementClient, RemoteError, RemoteResponse, RemoteResult,
};
use entitlement_store::EntitlementStore;
use entitlement_types::{
    ManualClock, PurchaseDetail, PurchaseNotification, PurchaseState, MILLIS_PER_DAY,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const ACCOUNT: &str = "acct-1";
pub const T0: i64 = 1_700_000_000_000;

pub fn make_config() -> EngineConfig {
    let mut config = EngineConfig {
        account_id: ACCOUNT.to_string(),
        ..EngineConfig::default()
    };
    config.catalog.insert("std.tier".to_string(), "P1M".to_string());
    config.catalog.insert("std.year".to_string(), "P1Y".to_string());
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 40;
    config
}

pub async fn make_machine_with(store: EntitlementStore, clock: &ManualClock) -> Arc<EntitlementMachine> {
    Arc::new(
        EntitlementMachine::open(store, Arc::new(clock.clone()), ACCOUNT)
            .await
            .unwrap(),
    )
}

pub async fn make_machine() -> (Arc<EntitlementMachine>, EntitlementStore, ManualClock) {
    let store = EntitlementStore::open_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let machine = make_machine_with(store.clone(), &clock).await;
    (machine, store, clock)
}

/// A detail with a one-month billing window starting at `T0`.
pub fn detail(token: &str, acknowledged: bool, auto_renewing: bool) -> PurchaseDetail {
    PurchaseDetail {
        product_id: "std.tier".to_string(),
        plan_id: "monthly".to_string(),
        product_title: "Standard".to_string(),
        purchase_token: token.to_string(),
        account_id: ACCOUNT.to_string(),
        purchase_time_ms: T0,
        billing_expiry_ms: T0 + 30 * MILLIS_PER_DAY,
        account_expiry_ms: Some(T0 + 37 * MILLIS_PER_DAY),
        is_auto_renewing: auto_renewing,
        is_acknowledged: acknowledged,
        developer_payload: String::new(),
    }
}

pub fn confirmed(token: &str) -> PurchaseDetail {
    detail(token, true, true)
}

pub fn notification(token: &str, state: PurchaseState, acknowledged: bool) -> PurchaseNotification {
    PurchaseNotification {
        product_id: "std.tier".to_string(),
        purchase_token: token.to_string(),
        purchase_state: state,
        is_auto_renewing: true,
        is_acknowledged: acknowledged,
        account_identifier: ACCOUNT.to_string(),
        purchase_time_ms: T0,
        developer_payload: r#"{"cid":"acct-1","test":true}"#.to_string(),
    }
}

/// Drives a fresh machine to `Active` under `token`.
pub async fn activate(machine: &EntitlementMachine, token: &str) {
    machine.start_purchase("std.tier", "monthly").await.unwrap();
    machine.payment_successful(confirmed(token)).await.unwrap();
}

// ── Fake remote ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Cancel,
    Revoke,
    Query,
}

/// Remote client returning scripted answers, in order. When the script runs
/// out it answers `200` with an empty payload.
#[derive(Default)]
pub struct FakeRemote {
    script: Mutex<VecDeque<RemoteResult<RemoteResponse>>>,
    pub calls: Mutex<Vec<Call>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, payload: &str) {
        self.script.lock().unwrap().push_back(Ok(RemoteResponse {
            payload: Some(payload.to_string()),
        }));
    }

    pub fn push_err(&self, code: u16) {
        self.script.lock().unwrap().push_back(Err(RemoteError::Status {
            code,
            body: "unavailable".to_string(),
        }));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, call: Call) -> RemoteResult<RemoteResponse> {
        self.calls.lock().unwrap().push(call);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RemoteResponse::default()))
    }
}

#[async_trait]
impl RemoteEntitlementClient for FakeRemote {
    async fn cancel_subscription(&self, _account_id: &str, _purchase_token: &str) -> RemoteResult<RemoteResponse> {
        self.answer(Call::Cancel)
    }

    async fn revoke_subscription(&self, _account_id: &str, _purchase_token: &str) -> RemoteResult<RemoteResponse> {
        self.answer(Call::Revoke)
    }

    async fn query_entitlement(&self, _account_id: &str, _purchase_token: &str) -> RemoteResult<RemoteResponse> {
        self.answer(Call::Query)
    }
}

// ── Fake purchase source ─────────────────────────────────────────

/// Purchase source returning a fixed list, optionally failing first.
#[derive(Default)]
pub struct FakeSource {
    pub purchases: Mutex<Vec<PurchaseNotification>>,
    pub failures_left: Mutex<u32>,
    pub queries: Mutex<u32>,
}

impl FakeSource {
    pub fn with(purchases: Vec<PurchaseNotification>) -> Arc<Self> {
        Arc::new(Self {
            purchases: Mutex::new(purchases),
            ..Self::default()
        })
    }

    pub fn set(&self, purchases: Vec<PurchaseNotification>) {
        *self.purchases.lock().unwrap() = purchases;
    }

    pub fn fail_next(&self, times: u32) {
        *self.failures_left.lock().unwrap() = times;
    }

    pub fn queries(&self) -> u32 {
        *self.queries.lock().unwrap()
    }
}

#[async_trait]
impl PurchaseSource for FakeSource {
    async fn query_purchases(&self) -> EntitlementResult<Vec<PurchaseNotification>> {
        *self.queries.lock().unwrap() += 1;
        let mut failures = self.failures_left.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(EntitlementError::Source("billing client disconnected".to_string()));
        }
        Ok(self.purchases.lock().unwrap().clone())
    }
}

pub fn make_ingestor(
    machine: &Arc<EntitlementMachine>,
    remote: Option<Arc<FakeRemote>>,
    source: Option<Arc<FakeSource>>,
) -> EventIngestor {
    let mut ingestor = EventIngestor::new(machine.clone(), Arc::new(make_config()));
    if let Some(remote) = remote {
        ingestor = ingestor.with_remote(remote);
    }
    if let Some(source) = source {
        ingestor = ingestor.with_source(source);
    }
    ingestor
}
