//! State machine events.

use crate::purchase::PurchaseDetail;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of event kinds, without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StartPurchase,
    PaymentSuccessful,
    CompletePurchase,
    PurchaseFailed,
    RestoreSubscription,
    SubscriptionExpired,
    UserCancellation,
    Revoke,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        Self::StartPurchase,
        Self::PaymentSuccessful,
        Self::CompletePurchase,
        Self::PurchaseFailed,
        Self::RestoreSubscription,
        Self::SubscriptionExpired,
        Self::UserCancellation,
        Self::Revoke,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::StartPurchase => "startPurchase",
            Self::PaymentSuccessful => "paymentSuccessful",
            Self::CompletePurchase => "completePurchase",
            Self::PurchaseFailed => "purchaseFailed",
            Self::RestoreSubscription => "restoreSubscription",
            Self::SubscriptionExpired => "subscriptionExpired",
            Self::UserCancellation => "handleUserCancellation",
            Self::Revoke => "revoke",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An event submitted to the state machine, with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    StartPurchase { product_id: String, plan_id: String },
    PaymentSuccessful(PurchaseDetail),
    CompletePurchase(PurchaseDetail),
    PurchaseFailed { message: String, raw: Option<String> },
    RestoreSubscription(PurchaseDetail),
    SubscriptionExpired,
    UserCancellation,
    Revoke { reason: Option<String> },
}

impl SubscriptionEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StartPurchase { .. } => EventKind::StartPurchase,
            Self::PaymentSuccessful(_) => EventKind::PaymentSuccessful,
            Self::CompletePurchase(_) => EventKind::CompletePurchase,
            Self::PurchaseFailed { .. } => EventKind::PurchaseFailed,
            Self::RestoreSubscription(_) => EventKind::RestoreSubscription,
            Self::SubscriptionExpired => EventKind::SubscriptionExpired,
            Self::UserCancellation => EventKind::UserCancellation,
            Self::Revoke { .. } => EventKind::Revoke,
        }
    }

    /// The purchase detail carried by the event, if any.
    #[must_use]
    pub fn detail(&self) -> Option<&PurchaseDetail> {
        match self {
            Self::PaymentSuccessful(d) | Self::CompletePurchase(d) | Self::RestoreSubscription(d) => {
                Some(d)
            }
            _ => None,
        }
    }

    /// Free-text reason recorded on the transition row.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::StartPurchase {
                product_id,
                plan_id,
            } => Some(format!("start purchase {product_id}/{plan_id}")),
            Self::PaymentSuccessful(d) => Some(format!(
                "payment successful ack={} renew={}",
                d.is_acknowledged, d.is_auto_renewing
            )),
            Self::CompletePurchase(_) => Some("purchase acknowledged".to_string()),
            Self::PurchaseFailed { message, .. } => Some(message.clone()),
            Self::RestoreSubscription(_) => Some("restored owned purchase".to_string()),
            Self::SubscriptionExpired => Some("billing expiry passed".to_string()),
            Self::UserCancellation => Some("purchase no longer reported".to_string()),
            Self::Revoke { reason } => reason.clone(),
        }
    }
}
