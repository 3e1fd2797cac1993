//! Persisted record shapes: the current subscription row and its audit log.

use crate::ids::SubscriptionId;
use crate::purchase::PurchaseDetail;
use crate::state::SubscriptionState;
use serde::{Deserialize, Serialize};

/// One subscription lifecycle, mutated in place on every accepted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// `None` until the store assigns a row id.
    pub id: Option<SubscriptionId>,
    pub account_id: String,
    pub purchase_token: String,
    pub product_id: String,
    pub plan_id: String,
    pub product_title: String,
    pub state: SubscriptionState,
    pub purchase_time_ms: i64,
    pub account_expiry_ms: i64,
    pub billing_expiry_ms: i64,
    pub developer_payload: String,
    pub last_updated_ms: i64,
}

impl SubscriptionRecord {
    /// A fresh, unsaved record in `Initial`.
    #[must_use]
    pub fn new(account_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: None,
            account_id: account_id.into(),
            purchase_token: String::new(),
            product_id: String::new(),
            plan_id: String::new(),
            product_title: String::new(),
            state: SubscriptionState::Initial,
            purchase_time_ms: 0,
            account_expiry_ms: 0,
            billing_expiry_ms: 0,
            developer_payload: String::new(),
            last_updated_ms: now_ms,
        }
    }

    /// Copies the purchase fields of `detail` onto this record.
    ///
    /// Empty strings and zero times in the detail do not overwrite values
    /// already on the record.
    pub fn apply_detail(&mut self, detail: &PurchaseDetail) {
        fn fill(dst: &mut String, src: &str) {
            if !src.is_empty() {
                *dst = src.to_string();
            }
        }
        fill(&mut self.purchase_token, &detail.purchase_token);
        fill(&mut self.product_id, &detail.product_id);
        fill(&mut self.plan_id, &detail.plan_id);
        fill(&mut self.product_title, &detail.product_title);
        fill(&mut self.developer_payload, &detail.developer_payload);
        if !detail.account_id.is_empty() && self.account_id.is_empty() {
            self.account_id = detail.account_id.clone();
        }
        if detail.purchase_time_ms > 0 {
            self.purchase_time_ms = detail.purchase_time_ms;
        }
        if detail.billing_expiry_ms > 0 {
            self.billing_expiry_ms = detail.billing_expiry_ms;
        }
        let account_expiry = detail.effective_account_expiry();
        if account_expiry > 0 {
            self.account_expiry_ms = account_expiry;
        }
    }

    /// `account_expiry_ms - billing_expiry_ms`. Zero or negative means no
    /// grace window.
    #[must_use]
    pub const fn grace_period_millis(&self) -> i64 {
        self.account_expiry_ms - self.billing_expiry_ms
    }

    /// True while a cancelled subscription still grants entitlement.
    #[must_use]
    pub const fn is_in_grace(&self, now_ms: i64) -> bool {
        matches!(self.state, SubscriptionState::Cancelled) && now_ms < self.account_expiry_ms
    }

    /// True once the provider-side billing expiry has been set and passed.
    #[must_use]
    pub const fn billing_expired(&self, now_ms: i64) -> bool {
        self.billing_expiry_ms > 0 && self.billing_expiry_ms < now_ms
    }
}

/// One accepted transition. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub subscription_id: SubscriptionId,
    pub from_state: SubscriptionState,
    pub to_state: SubscriptionState,
    pub timestamp_ms: i64,
    pub reason: Option<String>,
}

/// A transition not yet written; the store assigns the row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransition {
    pub subscription_id: SubscriptionId,
    pub from_state: SubscriptionState,
    pub to_state: SubscriptionState,
    pub timestamp_ms: i64,
    pub reason: Option<String>,
}
