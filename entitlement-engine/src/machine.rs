//! The state machine core.
//!
//! `EntitlementMachine` is the single writer for one account's subscription
//! state. Every event goes through [`EntitlementMachine::apply`], which
//! serializes on a `tokio::sync::Mutex`, validates the event against the
//! transition table, writes the record and its audit row in one SQLite
//! transaction, and only then publishes a fresh snapshot on a `watch`
//! channel. Readers never take the writer lock.

use crate::error::{EntitlementError, EntitlementResult};
use crate::transition;
use entitlement_store::{EntitlementStore, StoreResult};
use entitlement_types::{
    Clock, EventKind, NewTransition, PurchaseDetail, SubscriptionEvent, SubscriptionId,
    SubscriptionRecord, SubscriptionState, token_hint,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Immutable view of the machine, published after every committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementSnapshot {
    pub state: SubscriptionState,
    pub record: Option<SubscriptionRecord>,
    /// Message of the last purchase failure, while in `PurchaseFailed`.
    pub failure: Option<String>,
}

impl EntitlementSnapshot {
    fn new(record: Option<SubscriptionRecord>, failure: Option<String>) -> Self {
        Self {
            state: record
                .as_ref()
                .map_or(SubscriptionState::Initial, |r| r.state),
            record,
            failure,
        }
    }

    /// Active, or cancelled but still inside the grace window.
    #[must_use]
    pub fn has_valid_subscription(&self, now_ms: i64) -> bool {
        match &self.record {
            Some(r) => r.state.is_active() || r.is_in_grace(now_ms),
            None => false,
        }
    }

    #[must_use]
    pub fn grace_period_millis(&self) -> i64 {
        self.record
            .as_ref()
            .map_or(0, SubscriptionRecord::grace_period_millis)
    }
}

/// Result of submitting an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The transition was persisted and published.
    Applied {
        from: SubscriptionState,
        to: SubscriptionState,
        subscription_id: SubscriptionId,
    },
    /// A redelivery of something already in effect. Nothing was written.
    AlreadyApplied(SubscriptionState),
    /// The provider renewed the active purchase. The record now carries the
    /// later expiry; the state did not change and no transition was logged.
    Renewed {
        subscription_id: SubscriptionId,
        billing_expiry_ms: i64,
    },
}

impl Outcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

struct Inner {
    record: Option<SubscriptionRecord>,
    failure: Option<String>,
}

/// Single-writer authority over one account's subscription state.
pub struct EntitlementMachine {
    account_id: String,
    store: EntitlementStore,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<Arc<EntitlementSnapshot>>,
}

impl EntitlementMachine {
    /// Opens the machine for `account_id`, adopting the persisted state of
    /// the account's most recent record. No events are replayed and no
    /// history is written.
    pub async fn open(
        store: EntitlementStore,
        clock: Arc<dyn Clock>,
        account_id: impl Into<String>,
    ) -> EntitlementResult<Self> {
        let account_id = account_id.into();
        let record = {
            let store = store.clone();
            let account = account_id.clone();
            run_blocking(move || store.get_current(&account)).await?
        };

        match &record {
            Some(r) => info!(
                "restored {} subscription for account {} (token {})",
                r.state,
                account_id,
                token_hint(&r.purchase_token)
            ),
            None => info!("no subscription on record for account {account_id}"),
        }

        let (snapshot_tx, _) = watch::channel(Arc::new(EntitlementSnapshot::new(record.clone(), None)));
        Ok(Self {
            account_id,
            store,
            clock,
            inner: Mutex::new(Inner {
                record,
                failure: None,
            }),
            snapshot_tx,
        })
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    #[must_use]
    pub fn store(&self) -> &EntitlementStore {
        &self.store
    }

    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    // ── Read side ────────────────────────────────────────────────

    /// Latest committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<EntitlementSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Stream of committed snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<EntitlementSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    #[must_use]
    pub fn current_state(&self) -> SubscriptionState {
        self.snapshot_tx.borrow().state
    }

    #[must_use]
    pub fn can_make_purchase(&self) -> bool {
        self.current_state().can_make_purchase()
    }

    #[must_use]
    pub fn has_valid_subscription(&self) -> bool {
        self.snapshot().has_valid_subscription(self.clock.now_ms())
    }

    #[must_use]
    pub fn is_subscription_active(&self) -> bool {
        self.has_valid_subscription()
    }

    /// `accountExpiry - billingExpiry` of the current record; zero without one.
    #[must_use]
    pub fn grace_period_millis(&self) -> i64 {
        self.snapshot().grace_period_millis()
    }

    // ── Events ───────────────────────────────────────────────────

    pub async fn start_purchase(
        &self,
        product_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> EntitlementResult<Outcome> {
        self.apply(SubscriptionEvent::StartPurchase {
            product_id: product_id.into(),
            plan_id: plan_id.into(),
        })
        .await
    }

    pub async fn payment_successful(&self, detail: PurchaseDetail) -> EntitlementResult<Outcome> {
        self.apply(SubscriptionEvent::PaymentSuccessful(detail)).await
    }

    pub async fn complete_purchase(&self, detail: PurchaseDetail) -> EntitlementResult<Outcome> {
        self.apply(SubscriptionEvent::CompletePurchase(detail)).await
    }

    pub async fn purchase_failed(
        &self,
        message: impl Into<String>,
        raw: Option<String>,
    ) -> EntitlementResult<Outcome> {
        self.apply(SubscriptionEvent::PurchaseFailed {
            message: message.into(),
            raw,
        })
        .await
    }

    pub async fn restore_subscription(&self, detail: PurchaseDetail) -> EntitlementResult<Outcome> {
        self.apply(SubscriptionEvent::RestoreSubscription(detail)).await
    }

    pub async fn subscription_expired(&self) -> EntitlementResult<Outcome> {
        self.apply(SubscriptionEvent::SubscriptionExpired).await
    }

    pub async fn handle_user_cancellation(&self) -> EntitlementResult<Outcome> {
        self.apply(SubscriptionEvent::UserCancellation).await
    }

    pub async fn revoke(&self, reason: Option<String>) -> EntitlementResult<Outcome> {
        self.apply(SubscriptionEvent::Revoke { reason }).await
    }

    /// Submits one event. See the module docs for the ordering guarantees.
    pub async fn apply(&self, event: SubscriptionEvent) -> EntitlementResult<Outcome> {
        validate(&event)?;
        let mut inner = self.inner.lock().await;
        self.apply_locked(&mut inner, event).await
    }

    /// Drives `subscriptionExpired` for a specific row.
    ///
    /// The current row goes through the normal path and is published. Any
    /// other row (an older lifecycle, or another account sharing the
    /// database) is validated and audited the same way but not published,
    /// and keeps its `last_updated_ms`.
    pub async fn expire_record(&self, id: SubscriptionId) -> EntitlementResult<Outcome> {
        let mut inner = self.inner.lock().await;
        if inner.record.as_ref().and_then(|r| r.id) == Some(id) {
            return self
                .apply_locked(&mut inner, SubscriptionEvent::SubscriptionExpired)
                .await;
        }

        let record = {
            let store = self.store.clone();
            run_blocking(move || store.get_by_id(id)).await?
        }
        .ok_or(EntitlementError::NoSubscription)?;

        let from = record.state;
        if from == SubscriptionState::Expired {
            return Ok(Outcome::AlreadyApplied(from));
        }
        let event = EventKind::SubscriptionExpired;
        let to = transition::resolve(from, event, false)
            .ok_or(EntitlementError::InvalidTransition { state: from, event })?;

        // `last_updated_ms` stays put: `get_current` ranks by it, and this
        // row must not outrank the account's live lifecycle.
        let now = self.clock.now_ms();
        let mut updated = record;
        updated.state = to;
        let saved = self
            .commit(updated, from, Some("billing expiry passed".to_string()), now)
            .await?;
        let subscription_id = saved.id.ok_or(EntitlementError::NoSubscription)?;
        info!(
            "expired subscription {} of account {} ({} -> {})",
            subscription_id, saved.account_id, from, to
        );
        Ok(Outcome::Applied {
            from,
            to,
            subscription_id,
        })
    }

    /// Re-reads the current record after out-of-band cleanup (purge,
    /// duplicate removal) and publishes it if it changed. Writes nothing.
    pub async fn reload(&self) -> EntitlementResult<bool> {
        let mut inner = self.inner.lock().await;
        let record = {
            let store = self.store.clone();
            let account = self.account_id.clone();
            run_blocking(move || store.get_current(&account)).await?
        };
        if record == inner.record {
            return Ok(false);
        }
        debug!(
            "reloaded current record for account {}: {:?}",
            self.account_id,
            record.as_ref().map(|r| r.state)
        );
        inner.record = record;
        inner.failure = None;
        self.publish(&inner);
        Ok(true)
    }

    async fn apply_locked(&self, inner: &mut Inner, event: SubscriptionEvent) -> EntitlementResult<Outcome> {
        let kind = event.kind();
        let from = inner
            .record
            .as_ref()
            .map_or(SubscriptionState::Initial, |r| r.state);

        if is_redelivery(inner.record.as_ref(), &event) {
            if let Some(renewed) = renewal(inner.record.as_ref(), &event, self.clock.now_ms()) {
                return self.renew_locked(inner, renewed).await;
            }
            debug!(
                "ignoring duplicate {} for account {} in {}",
                kind, self.account_id, from
            );
            return Ok(Outcome::AlreadyApplied(from));
        }

        let confirmed = event.detail().is_some_and(PurchaseDetail::is_confirmed);
        let Some(to) = transition::resolve(from, kind, confirmed) else {
            warn!(
                "rejected {} for account {}: not allowed from {}",
                kind, self.account_id, from
            );
            return Err(EntitlementError::InvalidTransition { state: from, event: kind });
        };

        let now = self.clock.now_ms();
        let mut record = self.target_row(inner.record.as_ref(), &event, now).await?;
        if let Some(detail) = event.detail() {
            record.apply_detail(detail);
        }
        record.state = to;
        record.last_updated_ms = now;

        let saved = self.commit(record, from, event.reason(), now).await?;
        let subscription_id = saved.id.ok_or(EntitlementError::NoSubscription)?;

        info!(
            "{} for account {} (token {}): {} -> {}",
            kind,
            self.account_id,
            token_hint(&saved.purchase_token),
            from,
            to
        );

        inner.failure = match &event {
            SubscriptionEvent::PurchaseFailed { message, raw } => {
                if let Some(raw) = raw {
                    debug!("purchase failure payload: {raw}");
                }
                Some(message.clone())
            }
            _ => None,
        };
        inner.record = Some(saved);
        self.publish(inner);

        Ok(Outcome::Applied {
            from,
            to,
            subscription_id,
        })
    }

    /// Stores a renewed expiry on the active record. No transition row.
    async fn renew_locked(&self, inner: &mut Inner, record: SubscriptionRecord) -> EntitlementResult<Outcome> {
        let subscription_id = record.id.ok_or(EntitlementError::NoSubscription)?;
        let billing_expiry_ms = record.billing_expiry_ms;
        {
            let store = self.store.clone();
            let record = record.clone();
            run_blocking(move || store.atomically(|tx| tx.upsert_current(&record))).await?;
        }
        info!(
            "renewed subscription {} for account {} (token {}) until {}",
            subscription_id,
            self.account_id,
            token_hint(&record.purchase_token),
            billing_expiry_ms
        );
        inner.record = Some(record);
        self.publish(inner);
        Ok(Outcome::Renewed {
            subscription_id,
            billing_expiry_ms,
        })
    }

    /// Picks the row an accepted event writes to.
    async fn target_row(
        &self,
        current: Option<&SubscriptionRecord>,
        event: &SubscriptionEvent,
        now: i64,
    ) -> EntitlementResult<SubscriptionRecord> {
        match event {
            SubscriptionEvent::StartPurchase {
                product_id,
                plan_id,
            } => {
                let mut record = SubscriptionRecord::new(self.account_id.clone(), now);
                record.product_id = product_id.clone();
                record.plan_id = plan_id.clone();
                Ok(record)
            }
            SubscriptionEvent::PaymentSuccessful(detail)
            | SubscriptionEvent::CompletePurchase(detail)
            | SubscriptionEvent::RestoreSubscription(detail) => {
                if let Some(cur) = current.filter(|c| {
                    !c.state.is_terminal()
                        && (c.purchase_token.is_empty() || c.purchase_token == detail.purchase_token)
                }) {
                    return Ok(cur.clone());
                }
                let existing = {
                    let store = self.store.clone();
                    let token = detail.purchase_token.clone();
                    run_blocking(move || store.get_by_token(&token)).await?
                };
                match existing {
                    Some(row) if !row.state.is_terminal() && row.account_id == self.account_id => Ok(row),
                    _ => Ok(SubscriptionRecord::new(self.account_id.clone(), now)),
                }
            }
            _ => match current {
                Some(cur) if !cur.state.is_terminal() => Ok(cur.clone()),
                Some(cur) => {
                    let mut record = cur.clone();
                    record.id = None;
                    Ok(record)
                }
                None => Ok(SubscriptionRecord::new(self.account_id.clone(), now)),
            },
        }
    }

    /// Writes the record and its audit row in one transaction.
    async fn commit(
        &self,
        record: SubscriptionRecord,
        from: SubscriptionState,
        reason: Option<String>,
        now: i64,
    ) -> EntitlementResult<SubscriptionRecord> {
        let store = self.store.clone();
        run_blocking(move || {
            let id = store.atomically(|tx| {
                let id = tx.upsert_current(&record)?;
                tx.append_history(&NewTransition {
                    subscription_id: id,
                    from_state: from,
                    to_state: record.state,
                    timestamp_ms: now,
                    reason,
                })?;
                Ok(id)
            })?;
            Ok(SubscriptionRecord {
                id: Some(id),
                ..record
            })
        })
        .await
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(Arc::new(EntitlementSnapshot::new(
            inner.record.clone(),
            inner.failure.clone(),
        )));
    }
}

/// Runs a store call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> EntitlementResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EntitlementError::Background(format!("store task failed: {e}")))?
        .map_err(EntitlementError::from)
}

fn validate(event: &SubscriptionEvent) -> EntitlementResult<()> {
    match event {
        SubscriptionEvent::StartPurchase { product_id, .. } if product_id.trim().is_empty() => Err(
            EntitlementError::MalformedEvent("startPurchase without product id".to_string()),
        ),
        SubscriptionEvent::PaymentSuccessful(d)
        | SubscriptionEvent::CompletePurchase(d)
        | SubscriptionEvent::RestoreSubscription(d) => {
            if d.purchase_token.trim().is_empty() {
                return Err(EntitlementError::MalformedEvent(format!(
                    "{} without purchase token",
                    event.kind()
                )));
            }
            if d.product_id.trim().is_empty() {
                return Err(EntitlementError::MalformedEvent(format!(
                    "{} without product id",
                    event.kind()
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// For a redelivered detail on the active record that extends its billing
/// expiry, the record with the new purchase fields applied.
fn renewal(
    current: Option<&SubscriptionRecord>,
    event: &SubscriptionEvent,
    now_ms: i64,
) -> Option<SubscriptionRecord> {
    let current = current.filter(|c| c.state == SubscriptionState::Active && c.id.is_some())?;
    let detail = event.detail()?;
    if detail.billing_expiry_ms <= current.billing_expiry_ms {
        return None;
    }
    let mut record = current.clone();
    record.apply_detail(detail);
    record.last_updated_ms = now_ms;
    Some(record)
}

/// True if `event` only restates what the current record already says.
fn is_redelivery(current: Option<&SubscriptionRecord>, event: &SubscriptionEvent) -> bool {
    let Some(current) = current else {
        return false;
    };
    match event {
        SubscriptionEvent::Revoke { .. } => current.state == SubscriptionState::Revoked,
        SubscriptionEvent::PaymentSuccessful(d) => {
            let intended = if d.is_confirmed() {
                SubscriptionState::Active
            } else {
                SubscriptionState::AckPending
            };
            current.purchase_token == d.purchase_token && current.state == intended
        }
        SubscriptionEvent::CompletePurchase(d) | SubscriptionEvent::RestoreSubscription(d) => {
            current.purchase_token == d.purchase_token && current.state == SubscriptionState::Active
        }
        _ => false,
    }
}
