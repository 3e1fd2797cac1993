//! Periodic reconciliation and purge.
//!
//! Each pass:
//! 1. drives `subscriptionExpired` for every row whose billing expiry passed
//! 2. purges stale `Expired` rows and old transition rows
//! 3. removes duplicate purchase tokens (lowest id wins)
//! 4. re-queries the billing provider and, when a server is configured,
//!    verifies the entitlement remotely
//!
//! Steps 1-3 are local; their failures are logged, collected in the report
//! and retried on the next pass. Step 4 goes over the network and is retried
//! with the configured backoff. Nothing here panics or ends the loop.

use crate::config::EngineConfig;
use crate::error::EntitlementError;
use crate::ingest::{EventIngestor, RequeryOutcome};
use crate::machine::{EntitlementMachine, Outcome, run_blocking};
use crate::retry::RetryPolicy;
use entitlement_types::SubscriptionState;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started_ms: i64,
    pub expired: usize,
    pub purged_records: usize,
    pub purged_history: usize,
    pub duplicates_removed: usize,
    pub requery: Option<RequeryOutcome>,
    pub verification: Option<Outcome>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs reconciliation passes against one machine.
pub struct ReconciliationWorker {
    machine: Arc<EntitlementMachine>,
    ingestor: Arc<EventIngestor>,
    config: Arc<EngineConfig>,
    retry: RetryPolicy,
}

impl ReconciliationWorker {
    #[must_use]
    pub fn new(ingestor: Arc<EventIngestor>, config: Arc<EngineConfig>) -> Self {
        Self {
            machine: ingestor.machine().clone(),
            retry: RetryPolicy::from(&config.retry),
            ingestor,
            config,
        }
    }

    /// Runs one full pass.
    pub async fn run_once(&self) -> ReconcileReport {
        let now = self.machine.now_ms();
        let mut report = ReconcileReport {
            started_ms: now,
            ..ReconcileReport::default()
        };

        self.expire_overdue(now, &mut report).await;
        let removed = self.purge(now, &mut report).await;
        if removed > 0 {
            if let Err(e) = self.machine.reload().await {
                warn!("reload after cleanup failed: {e}");
                report.errors.push(format!("reload: {e}"));
            }
        }
        self.requery(&mut report).await;

        info!(
            "reconciliation: {} expired, {} record(s) purged, {} history row(s) purged, {} duplicate(s) removed, {} error(s)",
            report.expired,
            report.purged_records,
            report.purged_history,
            report.duplicates_removed,
            report.errors.len()
        );
        report
    }

    async fn expire_overdue(&self, now: i64, report: &mut ReconcileReport) {
        let store = self.machine.store().clone();
        let overdue = match run_blocking(move || store.find_expired_where(now)).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("listing overdue subscriptions failed: {e}");
                report.errors.push(format!("expire: {e}"));
                return;
            }
        };

        for record in overdue {
            let Some(id) = record.id else { continue };
            match self.machine.expire_record(id).await {
                Ok(Outcome::Applied { .. }) => report.expired += 1,
                Ok(Outcome::AlreadyApplied(_) | Outcome::Renewed { .. }) => {}
                Err(EntitlementError::InvalidTransition { state, .. }) => {
                    debug!("subscription {id} in {state} past billing expiry, not expirable");
                }
                Err(e) => {
                    warn!("expiring subscription {id} failed: {e}");
                    report.errors.push(format!("expire {id}: {e}"));
                }
            }
        }
    }

    /// Steps 2 and 3. Returns the number of subscription rows deleted.
    async fn purge(&self, now: i64, report: &mut ReconcileReport) -> usize {
        let retention = &self.config.retention;

        let store = self.machine.store().clone();
        let cutoff = now - retention.expired_retention_millis();
        match run_blocking(move || store.delete_older_than(SubscriptionState::Expired, cutoff)).await {
            Ok(n) => report.purged_records = n,
            Err(e) => {
                warn!("purging expired records failed: {e}");
                report.errors.push(format!("purge records: {e}"));
            }
        }

        let store = self.machine.store().clone();
        let cutoff = now - retention.history_retention_millis();
        match run_blocking(move || store.purge_history_before(cutoff)).await {
            Ok(n) => report.purged_history = n,
            Err(e) => {
                warn!("purging transition history failed: {e}");
                report.errors.push(format!("purge history: {e}"));
            }
        }

        let store = self.machine.store().clone();
        let deduped = run_blocking(move || {
            let duplicates = store.find_duplicate_tokens()?;
            if duplicates.is_empty() {
                return Ok(0);
            }
            for (token, count) in &duplicates {
                debug!(
                    "token {} stored on {count} rows",
                    entitlement_types::token_hint(token)
                );
            }
            store.remove_duplicate_tokens()
        })
        .await;
        match deduped {
            Ok(n) => report.duplicates_removed = n,
            Err(e) => {
                warn!("removing duplicate tokens failed: {e}");
                report.errors.push(format!("dedupe: {e}"));
            }
        }

        report.purged_records + report.duplicates_removed
    }

    async fn requery(&self, report: &mut ReconcileReport) {
        let purchases = self
            .retry
            .run("purchase re-query", || self.ingestor.fetch_purchases())
            .await;
        match purchases {
            Ok(Some(purchases)) => match self.ingestor.on_requery(purchases).await {
                Ok(outcome) => report.requery = Some(outcome),
                Err(EntitlementError::InvalidTransition { state, event }) => {
                    debug!("re-query produced {event} in {state}; ignored");
                    report.requery = Some(RequeryOutcome::NoChange);
                }
                Err(e) => {
                    warn!("applying re-query failed: {e}");
                    report.errors.push(format!("requery: {e}"));
                }
            },
            Ok(None) => report.requery = Some(RequeryOutcome::Skipped),
            Err(e) => {
                warn!("purchase re-query failed after retries: {e}");
                report.errors.push(format!("requery: {e}"));
            }
        }

        if !self.ingestor.has_remote() {
            return;
        }
        let status = self
            .retry
            .run("entitlement query", || self.ingestor.query_status())
            .await;
        match status {
            Ok(Some(status)) => match self.ingestor.apply_status(&status).await {
                Ok(outcome) => report.verification = outcome,
                Err(EntitlementError::InvalidTransition { state, event }) => {
                    debug!("server status implies {event} in {state}; ignored");
                }
                Err(e) => {
                    warn!("applying server status failed: {e}");
                    report.errors.push(format!("verify: {e}"));
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!("entitlement query failed after retries: {e}");
                report.errors.push(format!("verify: {e}"));
            }
        }
    }

    /// Runs passes on the configured interval until shut down.
    ///
    /// Shutdown takes effect between passes; a pass in progress finishes
    /// first so the machine's in-memory record never lags a commit.
    #[must_use]
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (report_tx, report_rx) = watch::channel(None);
        let period = self.config.worker.interval();
        let run_on_start = self.config.worker.run_on_start;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !run_on_start {
                ticker.tick().await;
            }
            info!("reconciliation worker started (every {period:?})");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_once().await;
                        report_tx.send_replace(Some(Arc::new(report)));
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciliation worker stopped");
        });

        WorkerHandle {
            shutdown_tx,
            reports: report_rx,
            task,
        }
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    reports: watch::Receiver<Option<Arc<ReconcileReport>>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Receives the report of every completed pass.
    #[must_use]
    pub fn reports(&self) -> watch::Receiver<Option<Arc<ReconcileReport>>> {
        self.reports.clone()
    }

    /// Stops the worker after any pass in progress and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("reconciliation worker ended abnormally: {e}");
        }
    }
}
