use entitlement_engine::allowed_events;
use entitlement_engine::transition::{is_allowed, resolve};
use entitlement_types::{EventKind, SubscriptionState};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use SubscriptionState::*;

fn any_state() -> impl Strategy<Value = SubscriptionState> {
    proptest::sample::select(SubscriptionState::ALL.to_vec())
}

fn any_event() -> impl Strategy<Value = EventKind> {
    proptest::sample::select(EventKind::ALL.to_vec())
}

#[test]
fn table_rows() {
    assert_eq!(
        allowed_events(Initial),
        vec![
            EventKind::StartPurchase,
            EventKind::RestoreSubscription,
            EventKind::Revoke
        ]
    );
    assert_eq!(
        allowed_events(Active),
        vec![
            EventKind::SubscriptionExpired,
            EventKind::UserCancellation,
            EventKind::Revoke
        ]
    );
    assert_eq!(
        allowed_events(PurchaseFailed),
        vec![EventKind::RestoreSubscription, EventKind::Revoke]
    );
}

#[test]
fn payment_confirmation_picks_target() {
    assert_eq!(resolve(PurchasePending, EventKind::PaymentSuccessful, true), Some(Active));
    assert_eq!(resolve(PurchasePending, EventKind::PaymentSuccessful, false), Some(AckPending));
    assert_eq!(resolve(AckPending, EventKind::PaymentSuccessful, true), None);
}

#[test]
fn cancelled_cannot_expire() {
    assert_eq!(resolve(Cancelled, EventKind::SubscriptionExpired, false), None);
    assert_eq!(resolve(AckPending, EventKind::SubscriptionExpired, false), Some(Expired));
}

proptest! {
    #[test]
    fn revoke_is_always_allowed(state in any_state()) {
        prop_assert_eq!(resolve(state, EventKind::Revoke, false), Some(Revoked));
    }

    #[test]
    fn start_purchase_follows_can_make_purchase(state in any_state()) {
        prop_assert_eq!(is_allowed(state, EventKind::StartPurchase), state.can_make_purchase());
    }

    #[test]
    fn restore_allowed_unless_active(state in any_state()) {
        prop_assert_eq!(is_allowed(state, EventKind::RestoreSubscription), state != Active);
    }

    #[test]
    fn allowed_events_agree_with_resolve(state in any_state(), event in any_event()) {
        prop_assert_eq!(allowed_events(state).contains(&event), is_allowed(state, event));
    }

    #[test]
    fn confirmation_only_matters_for_payment(
        state in any_state(),
        event in any_event(),
    ) {
        prop_assume!(event != EventKind::PaymentSuccessful);
        prop_assert_eq!(resolve(state, event, true), resolve(state, event, false));
    }

    #[test]
    fn no_transition_lands_in_initial_or_unknown(
        state in any_state(),
        event in any_event(),
        confirmed in any::<bool>(),
    ) {
        if let Some(next) = resolve(state, event, confirmed) {
            prop_assert!(next != Initial && next != Unknown);
        }
    }
}
