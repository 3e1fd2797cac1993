//! The subscription state set and its persisted integer codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of a subscription lifecycle.
///
/// This is the single representation used in memory, in the published
/// snapshot and (as an integer code) in both persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Fresh install, or no lifecycle started yet.
    Initial,
    /// The purchase flow was started and the provider has not reported back.
    PurchasePending,
    /// Paid, but the provider has not confirmed acknowledgement.
    AckPending,
    /// Paid and acknowledged; entitlement granted.
    Active,
    /// The provider stopped reporting the purchase; entitlement lasts until
    /// the account expiry (grace window).
    Cancelled,
    /// Billing expiry passed without renewal.
    Expired,
    /// Administratively revoked. Terminal.
    Revoked,
    /// The purchase flow failed. Terminal.
    PurchaseFailed,
    /// Could not be classified (e.g. an unrecognized persisted code).
    Unknown,
}

impl SubscriptionState {
    /// Every state, in code order.
    pub const ALL: [SubscriptionState; 9] = [
        Self::Initial,
        Self::PurchasePending,
        Self::AckPending,
        Self::Active,
        Self::Cancelled,
        Self::Expired,
        Self::Revoked,
        Self::PurchaseFailed,
        Self::Unknown,
    ];

    /// Returns the persisted integer code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Initial => 0,
            Self::PurchasePending => 1,
            Self::AckPending => 2,
            Self::Active => 3,
            Self::Cancelled => 4,
            Self::Expired => 5,
            Self::Revoked => 6,
            Self::PurchaseFailed => 7,
            Self::Unknown => 8,
        }
    }

    /// Decodes a persisted code. Unrecognized codes become `Unknown`.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Initial,
            1 => Self::PurchasePending,
            2 => Self::AckPending,
            3 => Self::Active,
            4 => Self::Cancelled,
            5 => Self::Expired,
            6 => Self::Revoked,
            7 => Self::PurchaseFailed,
            _ => Self::Unknown,
        }
    }

    /// Returns the stable display name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initial => "Initial",
            Self::PurchasePending => "PurchasePending",
            Self::AckPending => "AckPending",
            Self::Active => "Active",
            Self::Cancelled => "Cancelled",
            Self::Expired => "Expired",
            Self::Revoked => "Revoked",
            Self::PurchaseFailed => "PurchaseFailed",
            Self::Unknown => "Unknown",
        }
    }

    /// Returns true if a new purchase flow may be started from this state.
    #[must_use]
    pub const fn can_make_purchase(self) -> bool {
        matches!(
            self,
            Self::Initial | Self::Cancelled | Self::Expired | Self::Revoked
        )
    }

    /// Returns true for states whose record must never be rewritten.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Revoked | Self::PurchaseFailed)
    }

    /// Returns true if the state is `Active`.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SubscriptionState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::UnknownState(s.to_string()))
    }
}

impl From<i64> for SubscriptionState {
    fn from(code: i64) -> Self {
        Self::from_code(code)
    }
}
