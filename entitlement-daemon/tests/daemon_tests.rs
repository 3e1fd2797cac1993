use entitlement_daemon::{load_config, parse_config, read_notifications, Engine, FilePurchaseSource};
use entitlement_engine::{EngineConfig, EntitlementError, PurchaseSource, ReconciliationWorker, RequeryOutcome};
use entitlement_store::EntitlementStore;
use entitlement_types::{ManualClock, PurchaseState, SubscriptionState};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

const T0: i64 = 1_700_000_000_000;

const PURCHASES: &str = r#"[
  {
    "productId": "std.tier",
    "purchaseToken": "tok-abcdef123456",
    "purchaseState": "PURCHASED",
    "isAutoRenewing": true,
    "isAcknowledged": true,
    "accountIdentifier": "install-7",
    "purchaseTimeMs": 1700000000000,
    "developerPayload": "{\"cid\":\"install-7\",\"test\":true}"
  }
]"#;

fn config_with_catalog() -> EngineConfig {
    parse_config(
        r#"
        account_id = "install-7"

        [catalog]
        "std.tier" = "P1M"
        "#,
    )
    .unwrap()
}

async fn make_engine(dir: &TempDir) -> Engine {
    let purchases = dir.path().join("purchases.json");
    Engine::with_store(
        config_with_catalog(),
        EntitlementStore::open_in_memory().unwrap(),
        Arc::new(ManualClock::new(T0)),
        Some(&purchases),
    )
    .await
    .unwrap()
}

// ── Config ───────────────────────────────────────────────────────

#[test]
fn full_config_parses() {
    let config = parse_config(
        r#"
        account_id = "install-7"
        default_grace_days = 3

        [retention]
        expired_retention_days = 10
        history_retention_days = 90

        [worker]
        interval_secs = 600
        run_on_start = false

        [retry]
        max_attempts = 5

        [remote]
        base_url = "https://ent.example.net"
        app_version = "55"
        test_mode = true

        [catalog]
        "std.tier" = "P1M"
        "std.year" = "P1Y"
        "#,
    )
    .unwrap();

    assert_eq!(config.account_id, "install-7");
    assert_eq!(config.default_grace_days, 3);
    assert_eq!(config.retention.expired_retention_days, 10);
    assert_eq!(config.retention.history_retention_days, 90);
    assert_eq!(config.worker.interval_secs, 600);
    assert!(!config.worker.run_on_start);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.initial_backoff_ms, 500);
    assert!(config.remote.is_enabled());
    assert_eq!(config.remote.timeout_secs, 10);
    assert_eq!(config.billing_period("std.year"), Some("P1Y"));
}

#[test]
fn empty_config_is_default() {
    assert_eq!(parse_config("").unwrap(), EngineConfig::default());
}

#[test]
fn missing_config_file_is_default() {
    let dir = TempDir::new().unwrap();
    let config = load_config(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, EngineConfig::default());
}

#[test]
fn malformed_config_names_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[worker]\ninterval_secs = \"soon\"\n").unwrap();
    let err = load_config(&path).unwrap_err();
    assert!(format!("{err:#}").contains("bad.toml"));
}

// ── Purchase source ──────────────────────────────────────────────

#[tokio::test]
async fn missing_snapshot_means_no_purchases() {
    let dir = TempDir::new().unwrap();
    let source = FilePurchaseSource::new(dir.path().join("none.json"));
    assert!(source.query_purchases().await.unwrap().is_empty());
}

#[tokio::test]
async fn snapshot_is_parsed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("purchases.json");
    std::fs::write(&path, PURCHASES).unwrap();

    let purchases = FilePurchaseSource::new(&path).query_purchases().await.unwrap();
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].purchase_state, PurchaseState::Purchased);
    assert_eq!(purchases[0].purchase_token, "tok-abcdef123456");
}

#[tokio::test]
async fn garbled_snapshot_is_a_retryable_source_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("purchases.json");
    std::fs::write(&path, "{not json").unwrap();

    let err = FilePurchaseSource::new(&path).query_purchases().await.unwrap_err();
    assert!(matches!(err, EntitlementError::Source(_)));
    assert!(err.is_retryable());
}

#[test]
fn ingest_file_must_exist() {
    let dir = TempDir::new().unwrap();
    assert!(read_notifications(&dir.path().join("nope.json")).is_err());
}

// ── Assembly ─────────────────────────────────────────────────────

#[tokio::test]
async fn engine_without_server_has_no_remote() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir).await;
    assert!(!engine.ingestor.has_remote());
    assert_eq!(engine.machine.account_id(), "install-7");
    assert_eq!(engine.machine.current_state(), SubscriptionState::Initial);
}

#[tokio::test]
async fn ingested_file_activates_subscription() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch.json");
    std::fs::write(&path, PURCHASES).unwrap();
    let engine = make_engine(&dir).await;

    let report = engine
        .ingestor
        .on_purchases_updated(read_notifications(&path).unwrap())
        .await;
    assert_eq!(report.applied, 1);
    assert!(report.failures.is_empty());
    assert_eq!(engine.machine.current_state(), SubscriptionState::Active);
}

#[tokio::test]
async fn reconcile_pass_reads_snapshot_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("purchases.json"), PURCHASES).unwrap();
    let engine = make_engine(&dir).await;

    let worker = ReconciliationWorker::new(engine.ingestor.clone(), engine.config.clone());
    let report = worker.run_once().await;
    assert!(report.is_clean());
    assert!(matches!(report.requery, Some(RequeryOutcome::Purchases(ref r)) if r.applied == 1));
    assert!(engine.machine.has_valid_subscription());
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("entitlement.db");
    let batch = dir.path().join("batch.json");
    std::fs::write(&batch, PURCHASES).unwrap();

    {
        let engine = Engine::open(config_with_catalog(), &db, None).await.unwrap();
        engine
            .ingestor
            .on_purchases_updated(read_notifications(&batch).unwrap())
            .await;
        assert_eq!(engine.machine.current_state(), SubscriptionState::Active);
    }

    let engine = Engine::open(config_with_catalog(), &db, None).await.unwrap();
    assert_eq!(engine.machine.current_state(), SubscriptionState::Active);
    let record = engine.machine.snapshot().record.clone().unwrap();
    assert_eq!(record.purchase_token, "tok-abcdef123456");
    assert_eq!(record.product_id, "std.tier");
}
