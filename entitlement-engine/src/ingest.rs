//! Event ingestion: turns billing-provider callbacks, purchase re-queries,
//! remote-server answers and user cancel/revoke requests into state machine
//! events.
//!
//! Every entry point completes (applied, already applied, or an explicit
//! error) before it returns, so the caller can acknowledge the originating
//! callback only once the outcome is durable.

use crate::config::EngineConfig;
use crate::error::{EntitlementError, EntitlementResult, RemoteError};
use crate::machine::{EntitlementMachine, Outcome};
use crate::remote::{EntitlementStatus, RemoteEntitlementClient};
use crate::transition;
use async_trait::async_trait;
use entitlement_types::{
    EventKind, PayloadInfo, PurchaseDetail, PurchaseNotification, PurchaseState,
    SubscriptionEvent, SubscriptionState, token_hint,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Billing-provider query for the purchases it currently reports as owned.
#[async_trait]
pub trait PurchaseSource: Send + Sync {
    async fn query_purchases(&self) -> EntitlementResult<Vec<PurchaseNotification>>;
}

/// A notification that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestFailure {
    pub token_hint: String,
    pub error: String,
    pub retryable: bool,
}

/// What a batch of purchase notifications did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub received: usize,
    /// Notifications dropped because an earlier one had the same token.
    pub duplicates: usize,
    pub applied: usize,
    pub already_applied: usize,
    /// Notifications that only extended the active record's expiry.
    pub renewed: usize,
    /// Notifications that needed no event in the current state.
    pub ignored: usize,
    pub failures: Vec<IngestFailure>,
}

impl IngestReport {
    /// True if some failure is worth redelivering.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.failures.iter().any(|f| f.retryable)
    }

    fn record(&mut self, result: &EntitlementResult<Outcome>, token: &str) {
        match result {
            Ok(Outcome::Applied { .. }) => self.applied += 1,
            Ok(Outcome::AlreadyApplied(_)) => self.already_applied += 1,
            Ok(Outcome::Renewed { .. }) => self.renewed += 1,
            Err(e) => self.failures.push(IngestFailure {
                token_hint: token_hint(token).to_string(),
                error: e.to_string(),
                retryable: e.is_retryable(),
            }),
        }
    }
}

/// Result of feeding a purchase re-query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RequeryOutcome {
    /// The provider reported purchases; they went through normal ingestion.
    Purchases(IngestReport),
    /// Nothing reported while `Active` and the grace window is over.
    Expired(Outcome),
    /// Nothing reported while `Active`, still inside the account expiry.
    Cancelled(Outcome),
    /// Nothing to do.
    NoChange,
    /// No purchase source is configured.
    Skipped,
}

/// Normalizes inbound signals and feeds them to the machine.
pub struct EventIngestor {
    machine: Arc<EntitlementMachine>,
    config: Arc<EngineConfig>,
    remote: Option<Arc<dyn RemoteEntitlementClient>>,
    source: Option<Arc<dyn PurchaseSource>>,
}

impl EventIngestor {
    #[must_use]
    pub fn new(machine: Arc<EntitlementMachine>, config: Arc<EngineConfig>) -> Self {
        Self {
            machine,
            config,
            remote: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteEntitlementClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn PurchaseSource>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn machine(&self) -> &Arc<EntitlementMachine> {
        &self.machine
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    // ── Billing callbacks ────────────────────────────────────────

    /// Builds a `PurchaseDetail` from a raw notification.
    ///
    /// Billing expiry comes from the product's catalogued period; account
    /// expiry adds the configured default grace window. A purchase still
    /// reported as auto-renewing is rolled forward to the period running now.
    pub fn normalize(&self, n: &PurchaseNotification) -> EntitlementResult<PurchaseDetail> {
        if n.purchase_token.trim().is_empty() {
            return Err(EntitlementError::MalformedEvent(format!(
                "{} notification for {:?} without purchase token",
                n.purchase_state, n.product_id
            )));
        }
        if n.product_id.trim().is_empty() {
            return Err(EntitlementError::MalformedEvent(format!(
                "notification {} without product id",
                token_hint(&n.purchase_token)
            )));
        }

        if let Some(info) = PayloadInfo::parse(&n.developer_payload) {
            debug!(
                "payload for {}: expiry={:?} cid={:?} test={:?}",
                token_hint(&n.purchase_token),
                info.expiry,
                info.cid,
                info.test
            );
        }

        let renewing = n.is_auto_renewing && n.purchase_state == PurchaseState::Purchased;
        let billing_expiry_ms = match n.purchase_time_ms {
            t if t <= 0 => 0,
            t if renewing => self
                .config
                .renewed_billing_expiry(&n.product_id, t, self.machine.now_ms()),
            t => self.config.billing_expiry(&n.product_id, t),
        };
        let account_expiry_ms =
            (billing_expiry_ms > 0).then(|| billing_expiry_ms + self.config.default_grace_millis());
        let account_id = if n.account_identifier.is_empty() {
            self.machine.account_id().to_string()
        } else {
            n.account_identifier.clone()
        };

        Ok(PurchaseDetail {
            product_id: n.product_id.clone(),
            plan_id: self
                .config
                .billing_period(&n.product_id)
                .unwrap_or_default()
                .to_string(),
            product_title: String::new(),
            purchase_token: n.purchase_token.clone(),
            account_id,
            purchase_time_ms: n.purchase_time_ms,
            billing_expiry_ms,
            account_expiry_ms,
            is_auto_renewing: n.is_auto_renewing,
            is_acknowledged: n.is_acknowledged,
            developer_payload: n.developer_payload.clone(),
        })
    }

    /// Processes a batch of purchase notifications.
    ///
    /// The batch is deduplicated by purchase token first (first occurrence
    /// wins), then each notification is mapped against the state current at
    /// the time it is processed.
    pub async fn on_purchases_updated(&self, notifications: Vec<PurchaseNotification>) -> IngestReport {
        let mut report = IngestReport {
            received: notifications.len(),
            ..IngestReport::default()
        };

        let mut seen = HashSet::new();
        for n in notifications {
            // tokenless notifications fall through to normalize and fail there
            if !n.purchase_token.trim().is_empty() && !seen.insert(n.purchase_token.clone()) {
                debug!("dropping duplicate notification {}", token_hint(&n.purchase_token));
                report.duplicates += 1;
                continue;
            }

            let detail = match self.normalize(&n) {
                Ok(detail) => detail,
                Err(e) => {
                    warn!("malformed purchase notification: {e}");
                    report.record(&Err(e), &n.purchase_token);
                    continue;
                }
            };

            let events = plan_events(self.machine.current_state(), &n, detail);
            if events.is_empty() {
                debug!(
                    "{} notification {} needs no event in {}",
                    n.purchase_state,
                    token_hint(&n.purchase_token),
                    self.machine.current_state()
                );
                report.ignored += 1;
                continue;
            }

            for event in events {
                let result = self.machine.apply(event).await;
                if let Err(e) = &result {
                    warn!(
                        "purchase {} not applied: {e}",
                        token_hint(&n.purchase_token)
                    );
                }
                let failed = result.is_err();
                report.record(&result, &n.purchase_token);
                if failed {
                    break;
                }
            }
        }

        info!(
            "ingested {} notification(s): {} applied, {} renewed, {} already applied, {} duplicate, {} failed",
            report.received,
            report.applied,
            report.renewed,
            report.already_applied,
            report.duplicates,
            report.failures.len()
        );
        report
    }

    // ── Re-query ─────────────────────────────────────────────────

    /// Asks the configured purchase source for the current purchases.
    pub async fn fetch_purchases(&self) -> EntitlementResult<Option<Vec<PurchaseNotification>>> {
        match &self.source {
            Some(source) => Ok(Some(source.query_purchases().await?)),
            None => Ok(None),
        }
    }

    /// Re-queries the provider and feeds the result.
    pub async fn requery(&self) -> EntitlementResult<RequeryOutcome> {
        match self.fetch_purchases().await? {
            Some(purchases) => self.on_requery(purchases).await,
            None => Ok(RequeryOutcome::Skipped),
        }
    }

    /// Feeds the result of a purchase re-query.
    ///
    /// An empty result while `Active` means the provider stopped reporting
    /// the purchase. Past both the billing expiry and the account expiry
    /// that is an expiry; otherwise it is a cancellation inside the grace
    /// window.
    pub async fn on_requery(&self, purchases: Vec<PurchaseNotification>) -> EntitlementResult<RequeryOutcome> {
        if !purchases.is_empty() {
            return Ok(RequeryOutcome::Purchases(
                self.on_purchases_updated(purchases).await,
            ));
        }

        let snapshot = self.machine.snapshot();
        if snapshot.state != SubscriptionState::Active {
            return Ok(RequeryOutcome::NoChange);
        }
        let Some(record) = snapshot.record.as_ref() else {
            return Ok(RequeryOutcome::NoChange);
        };

        let now = self.machine.now_ms();
        let cutoff = record.account_expiry_ms.max(record.billing_expiry_ms);
        if record.billing_expiry_ms > 0 && now > record.billing_expiry_ms && now > cutoff {
            info!(
                "provider no longer reports {} and account expiry passed",
                token_hint(&record.purchase_token)
            );
            Ok(RequeryOutcome::Expired(self.machine.subscription_expired().await?))
        } else {
            info!(
                "provider no longer reports {}; treating as cancellation",
                token_hint(&record.purchase_token)
            );
            Ok(RequeryOutcome::Cancelled(
                self.machine.handle_user_cancellation().await?,
            ))
        }
    }

    // ── User requests ────────────────────────────────────────────

    /// Cancels the current subscription on the entitlement server, then
    /// locally. A server failure leaves local state untouched.
    pub async fn request_cancellation(&self) -> EntitlementResult<Outcome> {
        let (remote, token) = self.remote_target(EventKind::UserCancellation)?;
        let account = self.machine.account_id();
        if let Err(e) = remote.cancel_subscription(account, &token).await {
            warn!("server refused cancellation of {}: {e}", token_hint(&token));
            return Err(e.into());
        }
        self.machine.handle_user_cancellation().await
    }

    /// Revokes the current subscription on the entitlement server, then
    /// locally. A server failure leaves local state untouched.
    pub async fn request_revocation(&self, reason: Option<String>) -> EntitlementResult<Outcome> {
        let (remote, token) = self.remote_target(EventKind::Revoke)?;
        let account = self.machine.account_id();
        if let Err(e) = remote.revoke_subscription(account, &token).await {
            warn!("server refused revocation of {}: {e}", token_hint(&token));
            return Err(e.into());
        }
        self.machine
            .revoke(reason.or_else(|| Some("revoked on request".to_string())))
            .await
    }

    fn remote_target(&self, event: EventKind) -> EntitlementResult<(Arc<dyn RemoteEntitlementClient>, String)> {
        let snapshot = self.machine.snapshot();
        if !transition::is_allowed(snapshot.state, event) {
            return Err(EntitlementError::InvalidTransition {
                state: snapshot.state,
                event,
            });
        }
        let token = snapshot
            .record
            .as_ref()
            .map(|r| r.purchase_token.clone())
            .filter(|t| !t.is_empty())
            .ok_or(EntitlementError::NoSubscription)?;
        let remote = self.remote.clone().ok_or_else(not_configured)?;
        Ok((remote, token))
    }

    // ── Server verification ──────────────────────────────────────

    /// Queries the entitlement server for the current purchase. `None`
    /// when there is no purchase token to ask about.
    pub async fn query_status(&self) -> EntitlementResult<Option<EntitlementStatus>> {
        let snapshot = self.machine.snapshot();
        let Some(token) = snapshot
            .record
            .as_ref()
            .map(|r| r.purchase_token.clone())
            .filter(|t| !t.is_empty())
        else {
            return Ok(None);
        };
        let remote = self.remote.clone().ok_or_else(not_configured)?;
        let response = remote
            .query_entitlement(self.machine.account_id(), &token)
            .await?;
        let payload = response.payload.unwrap_or_default();
        let status = EntitlementStatus::from_payload(&payload).ok_or_else(|| {
            RemoteError::InvalidResponse(format!("unexpected entitlement payload: {payload}"))
        })?;
        Ok(Some(status))
    }

    /// Feeds a server-reported status as events.
    pub async fn apply_status(&self, status: &EntitlementStatus) -> EntitlementResult<Option<Outcome>> {
        let state = self.machine.current_state();
        let outcome = if status.revoked {
            Some(
                self.machine
                    .revoke(Some("revoked by entitlement server".to_string()))
                    .await?,
            )
        } else if status.expired && state == SubscriptionState::Active {
            Some(self.machine.subscription_expired().await?)
        } else if status.canceled && state == SubscriptionState::Active {
            Some(self.machine.handle_user_cancellation().await?)
        } else {
            None
        };
        Ok(outcome)
    }

    /// Queries the server once and applies what it reports.
    pub async fn verify_entitlement(&self) -> EntitlementResult<Option<Outcome>> {
        match self.query_status().await? {
            Some(status) => self.apply_status(&status).await,
            None => Ok(None),
        }
    }
}

fn not_configured() -> EntitlementError {
    EntitlementError::RemoteCall(RemoteError::Rejected(
        "no entitlement server configured".to_string(),
    ))
}

/// Maps one notification to the events it implies in `state`.
///
/// - `PURCHASED` completes whatever purchase flow is open, and restores an
///   acknowledged purchase from any state that is not already `Active`.
/// - `PENDING` means paid but unacknowledged; it parks the flow in
///   `AckPending`.
/// - `UNSPECIFIED` fails the open flow.
fn plan_events(state: SubscriptionState, n: &PurchaseNotification, detail: PurchaseDetail) -> Vec<SubscriptionEvent> {
    use SubscriptionState::*;

    let open_flow = |mut detail: PurchaseDetail| {
        vec![
            SubscriptionEvent::StartPurchase {
                product_id: detail.product_id.clone(),
                plan_id: detail.plan_id.clone(),
            },
            SubscriptionEvent::PaymentSuccessful({
                detail.is_acknowledged = false;
                detail
            }),
        ]
    };

    match n.purchase_state {
        PurchaseState::Purchased => match state {
            PurchasePending => vec![SubscriptionEvent::PaymentSuccessful(detail)],
            AckPending if detail.is_acknowledged => vec![SubscriptionEvent::CompletePurchase(detail)],
            AckPending => vec![SubscriptionEvent::PaymentSuccessful(detail)],
            Active => vec![SubscriptionEvent::RestoreSubscription(detail)],
            s if detail.is_acknowledged || !s.can_make_purchase() => {
                vec![SubscriptionEvent::RestoreSubscription(detail)]
            }
            _ => open_flow(detail),
        },
        PurchaseState::Pending => {
            let mut detail = detail;
            detail.is_acknowledged = false;
            match state {
                PurchasePending | AckPending => vec![SubscriptionEvent::PaymentSuccessful(detail)],
                s if s.can_make_purchase() => open_flow(detail),
                _ => Vec::new(),
            }
        }
        PurchaseState::Unspecified => vec![SubscriptionEvent::PurchaseFailed {
            message: "unspecified purchase state".to_string(),
            raw: serde_json::to_string(n).ok(),
        }],
    }
}
