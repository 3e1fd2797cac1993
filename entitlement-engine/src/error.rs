//! Error types for the entitlement engine.

use entitlement_store::StoreError;
use entitlement_types::{EventKind, SubscriptionState};
use thiserror::Error;

/// Result type for engine operations.
pub type EntitlementResult<T> = Result<T, EntitlementError>;

/// Result type for remote entitlement server calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors from the remote entitlement server.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport failure (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("server returned {code}: {body}")]
    Status { code: u16, body: String },

    /// The server answered 2xx but reported an error in the body.
    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors surfaced by the state machine and the layers around it.
#[derive(Debug, Error)]
pub enum EntitlementError {
    /// The event is not valid from the current state. Nothing changed.
    #[error("invalid transition: {event} not allowed from {state}")]
    InvalidTransition {
        state: SubscriptionState,
        event: EventKind,
    },

    /// The atomic record + history write failed. Nothing was published.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// A call to the remote entitlement server failed. Local state is untouched.
    #[error("remote call failed: {0}")]
    RemoteCall(#[from] RemoteError),

    /// An inbound billing signal is missing required fields.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The billing provider could not be queried for current purchases.
    #[error("purchase query failed: {0}")]
    Source(String),

    /// The operation needs a subscription record and there is none.
    #[error("no subscription on record")]
    NoSubscription,

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Background(String),
}

impl EntitlementError {
    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(_) | Self::Background(_) | Self::Source(_) => true,
            Self::RemoteCall(e) => e.is_retryable(),
            Self::InvalidTransition { .. } | Self::MalformedEvent(_) | Self::NoSubscription => {
                false
            }
        }
    }
}

impl RemoteError {
    /// Transport failures and 5xx/429 responses are worth retrying; an
    /// explicit rejection is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { code, .. } => *code >= 500 || *code == 429,
            Self::Rejected(_) | Self::InvalidResponse(_) => false,
        }
    }
}
