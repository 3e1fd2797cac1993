//! Billing-provider purchase shapes and billing period arithmetic.

use crate::clock::MILLIS_PER_DAY;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Purchase state reported by the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseState {
    #[default]
    Unspecified,
    Purchased,
    Pending,
}

impl PurchaseState {
    /// Provider wire code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Unspecified => 0,
            Self::Purchased => 1,
            Self::Pending => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Purchased,
            2 => Self::Pending,
            _ => Self::Unspecified,
        }
    }
}

impl fmt::Display for PurchaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "UNSPECIFIED"),
            Self::Purchased => write!(f, "PURCHASED"),
            Self::Pending => write!(f, "PENDING"),
        }
    }
}

/// A raw purchase notification as delivered by the billing provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseNotification {
    pub product_id: String,
    pub purchase_token: String,
    #[serde(default)]
    pub purchase_state: PurchaseState,
    #[serde(default)]
    pub is_auto_renewing: bool,
    #[serde(default)]
    pub is_acknowledged: bool,
    #[serde(default)]
    pub account_identifier: String,
    #[serde(default)]
    pub purchase_time_ms: i64,
    #[serde(default)]
    pub developer_payload: String,
}

/// A normalized purchase, ready to be fed to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PurchaseDetail {
    pub product_id: String,
    pub plan_id: String,
    pub product_title: String,
    pub purchase_token: String,
    pub account_id: String,
    pub purchase_time_ms: i64,
    /// Provider-side renewal deadline. Zero means never set.
    pub billing_expiry_ms: i64,
    /// App-side cutoff. Defaults to the billing expiry when absent.
    pub account_expiry_ms: Option<i64>,
    pub is_auto_renewing: bool,
    pub is_acknowledged: bool,
    pub developer_payload: String,
}

impl PurchaseDetail {
    /// Returns true if the purchase grants entitlement immediately.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.is_acknowledged && self.is_auto_renewing
    }

    /// Account expiry, falling back to the billing expiry.
    #[must_use]
    pub fn effective_account_expiry(&self) -> i64 {
        self.account_expiry_ms.unwrap_or(self.billing_expiry_ms)
    }

    /// Short form of the purchase token for logs.
    #[must_use]
    pub fn token_hint(&self) -> &str {
        token_hint(&self.purchase_token)
    }
}

/// Returns at most the first eight characters of a purchase token.
#[must_use]
pub fn token_hint(token: &str) -> &str {
    match token.char_indices().nth(8) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

/// Subscription billing period as an ISO-8601 duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillingPeriod {
    OneWeek,
    FourWeeks,
    OneMonth,
    TwoMonths,
    ThreeMonths,
    FourMonths,
    SixMonths,
    EightMonths,
    OneYear,
    TwoYears,
    FiveYears,
}

impl BillingPeriod {
    /// Days used when a period string is not recognized.
    pub const FALLBACK_DAYS: i64 = 30;

    /// Parses an ISO-8601 period such as `P1M`.
    #[must_use]
    pub fn parse(iso: &str) -> Option<Self> {
        let period = match iso.trim().to_ascii_uppercase().as_str() {
            "P1W" => Self::OneWeek,
            "P4W" => Self::FourWeeks,
            "P1M" => Self::OneMonth,
            "P2M" => Self::TwoMonths,
            "P3M" => Self::ThreeMonths,
            "P4M" => Self::FourMonths,
            "P6M" => Self::SixMonths,
            "P8M" => Self::EightMonths,
            "P1Y" => Self::OneYear,
            "P2Y" => Self::TwoYears,
            "P5Y" => Self::FiveYears,
            _ => return None,
        };
        Some(period)
    }

    #[must_use]
    pub const fn days(self) -> i64 {
        match self {
            Self::OneWeek => 7,
            Self::FourWeeks => 28,
            Self::OneMonth => 30,
            Self::TwoMonths => 60,
            Self::ThreeMonths => 90,
            Self::FourMonths => 120,
            Self::SixMonths => 180,
            Self::EightMonths => 240,
            Self::OneYear => 365,
            Self::TwoYears => 730,
            Self::FiveYears => 1825,
        }
    }

    #[must_use]
    pub const fn millis(self) -> i64 {
        self.days() * MILLIS_PER_DAY
    }

    /// Days for a period string, falling back to 30 for unknown strings.
    #[must_use]
    pub fn days_for(iso: &str) -> i64 {
        Self::parse(iso).map_or(Self::FALLBACK_DAYS, Self::days)
    }

    /// Billing expiry for a purchase made at `purchase_time_ms`.
    #[must_use]
    pub fn expiry_from(iso: &str, purchase_time_ms: i64) -> i64 {
        purchase_time_ms + Self::days_for(iso) * MILLIS_PER_DAY
    }

    /// Billing expiry of the period running at `now_ms` for a purchase that
    /// keeps renewing: the first expiry after `now_ms` on the purchase's
    /// period grid.
    #[must_use]
    pub fn renewed_expiry(iso: &str, purchase_time_ms: i64, now_ms: i64) -> i64 {
        let first = Self::expiry_from(iso, purchase_time_ms);
        if first > now_ms {
            return first;
        }
        let period = Self::days_for(iso) * MILLIS_PER_DAY;
        first + ((now_ms - first) / period + 1) * period
    }
}
