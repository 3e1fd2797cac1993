//! The transition table: which events are valid from which states, and
//! where they lead.

use entitlement_types::{EventKind, SubscriptionState};

use SubscriptionState::*;

/// Resolves `event` applied in `state`.
///
/// `confirmed` only matters for `PaymentSuccessful`: an acknowledged,
/// auto-renewing payment goes straight to `Active`, anything else parks in
/// `AckPending`. Returns `None` when the event is not valid from `state`.
#[must_use]
pub fn resolve(state: SubscriptionState, event: EventKind, confirmed: bool) -> Option<SubscriptionState> {
    let next = match (event, state) {
        (EventKind::StartPurchase, Initial | Cancelled | Expired | Revoked) => PurchasePending,
        (EventKind::PaymentSuccessful, PurchasePending) => {
            if confirmed {
                Active
            } else {
                AckPending
            }
        }
        (EventKind::CompletePurchase, AckPending) => Active,
        (EventKind::PurchaseFailed, PurchasePending | AckPending) => PurchaseFailed,
        (EventKind::RestoreSubscription, s) if s != Active => Active,
        (EventKind::SubscriptionExpired, Active | AckPending) => Expired,
        (EventKind::UserCancellation, Active) => Cancelled,
        (EventKind::Revoke, _) => Revoked,
        _ => return None,
    };
    Some(next)
}

/// True if `event` is valid from `state`.
#[must_use]
pub fn is_allowed(state: SubscriptionState, event: EventKind) -> bool {
    resolve(state, event, false).is_some()
}

/// Events valid from `state`, in declaration order.
#[must_use]
pub fn allowed_events(state: SubscriptionState) -> Vec<EventKind> {
    EventKind::ALL
        .into_iter()
        .filter(|&event| is_allowed(state, event))
        .collect()
}
