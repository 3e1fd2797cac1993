//! Identifier types for persisted subscription rows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Surrogate key of a subscription record.
///
/// Assigned by the store on first insert; lower ids are older rows, which is
/// what duplicate-token cleanup relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(i64);

impl SubscriptionId {
    /// Wraps a raw row id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw row id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<i64> for SubscriptionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}
