//! Core type definitions for the subscription entitlement subsystem.
//!
//! This crate defines the plain data shared by the store, the state machine
//! and the ingestion/reconciliation layers:
//! - The closed `SubscriptionState` set and its persisted integer codes
//! - The closed event set (`EventKind`, `SubscriptionEvent`)
//! - Billing-provider notifications and normalized `PurchaseDetail`s
//! - The persisted `SubscriptionRecord` / `TransitionRecord` rows
//! - A `Clock` abstraction so time-based rules can be driven in tests
//!
//! Nothing in here performs I/O.

mod clock;
mod event;
mod ids;
mod payload;
mod purchase;
mod record;
mod state;

pub use clock::{Clock, ManualClock, SystemClock, MILLIS_PER_DAY};
pub use event::{EventKind, SubscriptionEvent};
pub use ids::SubscriptionId;
pub use payload::PayloadInfo;
pub use purchase::{
    token_hint, BillingPeriod, PurchaseDetail, PurchaseNotification, PurchaseState,
};
pub use record::{NewTransition, SubscriptionRecord, TransitionRecord};
pub use state::SubscriptionState;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown subscription state: {0}")]
    UnknownState(String),

    #[error("invalid subscription id: {0}")]
    InvalidId(#[from] std::num::ParseIntError),
}
