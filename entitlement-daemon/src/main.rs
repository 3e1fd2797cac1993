//! Subscription entitlement daemon.
//!
//! Hosts the entitlement state machine for one account: restores it from
//! the local database, feeds it purchase notifications, and runs periodic
//! reconciliation.
//!
//! Usage:
//!   entitlementd --config entitlement.toml --db entitlement.db run
//!   entitlementd status
//!   entitlementd ingest purchases.json

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use entitlement_daemon::{init_logging, load_config, read_notifications, Engine};
use entitlement_engine::ReconciliationWorker;
use entitlement_store::HistoryScope;
use entitlement_types::{SubscriptionState, TransitionRecord};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "entitlementd")]
#[command(about = "Subscription entitlement state machine host")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "entitlement.toml")]
    config: PathBuf,

    /// Path to the SQLite database
    #[arg(long, default_value = "entitlement.db")]
    db: PathBuf,

    /// JSON snapshot of current purchases, used for re-queries
    #[arg(long)]
    purchases: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the reconciliation worker until Ctrl-C
    Run,
    /// Run one reconciliation pass and print the report
    Reconcile,
    /// Print the current entitlement
    Status,
    /// Print recent transitions and transition counts
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Feed a JSON array of purchase notifications
    Ingest { file: PathBuf },
    /// Cancel the subscription on the entitlement server, then locally
    Cancel,
    /// Revoke the subscription on the entitlement server, then locally
    Revoke {
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Ask the entitlement server for the current status and apply it
    Verify,
}

#[derive(Serialize)]
struct StatusView {
    account_id: String,
    state: SubscriptionState,
    has_valid_subscription: bool,
    is_active: bool,
    can_make_purchase: bool,
    grace_period_millis: i64,
    product_id: Option<String>,
    billing_expiry_ms: Option<i64>,
    account_expiry_ms: Option<i64>,
    last_failure: Option<String>,
}

#[derive(Serialize)]
struct HistoryView {
    recent: Vec<TransitionRecord>,
    summary: entitlement_store::AuditSummary,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = load_config(&cli.config)?;
    let engine = Engine::open(config, &cli.db, cli.purchases.as_deref()).await?;

    match cli.command {
        Command::Run => run(engine).await,
        Command::Reconcile => {
            let worker = ReconciliationWorker::new(engine.ingestor.clone(), engine.config.clone());
            print_json(&worker.run_once().await)
        }
        Command::Status => print_json(&status(&engine)),
        Command::History { limit } => {
            let audit = engine.store.audit();
            let scope = HistoryScope::Account(engine.machine.account_id().to_string());
            let view = HistoryView {
                recent: audit.recent_history(&scope, limit)?,
                summary: audit.summary()?,
            };
            print_json(&view)
        }
        Command::Ingest { file } => {
            let notifications = read_notifications(&file)?;
            let report = engine.ingestor.on_purchases_updated(notifications).await;
            print_json(&report)
        }
        Command::Cancel => {
            let outcome = engine
                .ingestor
                .request_cancellation()
                .await
                .context("Cancellation failed")?;
            print_json(&outcome)
        }
        Command::Revoke { reason } => {
            let outcome = engine
                .ingestor
                .request_revocation(reason)
                .await
                .context("Revocation failed")?;
            print_json(&outcome)
        }
        Command::Verify => {
            let outcome = engine
                .ingestor
                .verify_entitlement()
                .await
                .context("Verification failed")?;
            print_json(&outcome)
        }
    }
}

async fn run(engine: Engine) -> Result<()> {
    info!(
        "entitlementd starting for account {} ({})",
        engine.machine.account_id(),
        engine.machine.current_state()
    );
    if !engine.ingestor.has_remote() {
        warn!("no entitlement server configured; remote verification disabled");
    }

    let mut snapshots = engine.machine.subscribe();
    let handle = ReconciliationWorker::new(engine.ingestor.clone(), engine.config.clone()).spawn();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                info!("entitlement now {}", snapshot.state);
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("shutdown requested");
                break;
            }
        }
    }

    handle.shutdown().await;
    info!("entitlementd stopped");
    Ok(())
}

fn status(engine: &Engine) -> StatusView {
    let snapshot = engine.machine.snapshot();
    let record = snapshot.record.as_ref();
    StatusView {
        account_id: engine.machine.account_id().to_string(),
        state: snapshot.state,
        has_valid_subscription: engine.machine.has_valid_subscription(),
        is_active: engine.machine.is_subscription_active(),
        can_make_purchase: engine.machine.can_make_purchase(),
        grace_period_millis: snapshot.grace_period_millis(),
        product_id: record.map(|r| r.product_id.clone()),
        billing_expiry_ms: record.map(|r| r.billing_expiry_ms),
        account_expiry_ms: record.map(|r| r.account_expiry_ms),
        last_failure: snapshot.failure.clone(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{text}");
    Ok(())
}
