//! Engine configuration. Every field has a default so a partial (or empty)
//! config file is valid.

use entitlement_types::{BillingPeriod, MILLIS_PER_DAY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for the state machine, ingestion and reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Opaque install/account identifier. Never raw PII.
    pub account_id: String,
    /// Grace window applied when a purchase carries no account expiry.
    pub default_grace_days: i64,
    pub retention: RetentionConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub remote: RemoteConfig,
    /// Product id to ISO-8601 billing period, e.g. `"std.tier" = "P1M"`.
    pub catalog: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            default_grace_days: 0,
            retention: RetentionConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            remote: RemoteConfig::default(),
            catalog: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Billing period string for a product, if catalogued.
    #[must_use]
    pub fn billing_period(&self, product_id: &str) -> Option<&str> {
        self.catalog.get(product_id).map(String::as_str)
    }

    /// Billing expiry for a product purchased at `purchase_time_ms`.
    /// Uncatalogued products use the fallback period.
    #[must_use]
    pub fn billing_expiry(&self, product_id: &str, purchase_time_ms: i64) -> i64 {
        BillingPeriod::expiry_from(self.billing_period(product_id).unwrap_or(""), purchase_time_ms)
    }

    /// Billing expiry of the period running at `now_ms` for a purchase the
    /// provider still reports as auto-renewing.
    #[must_use]
    pub fn renewed_billing_expiry(&self, product_id: &str, purchase_time_ms: i64, now_ms: i64) -> i64 {
        BillingPeriod::renewed_expiry(
            self.billing_period(product_id).unwrap_or(""),
            purchase_time_ms,
            now_ms,
        )
    }

    #[must_use]
    pub fn default_grace_millis(&self) -> i64 {
        self.default_grace_days.max(0) * MILLIS_PER_DAY
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// `Expired` records untouched for this long are purged.
    pub expired_retention_days: i64,
    /// Transition rows older than this are purged.
    pub history_retention_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            expired_retention_days: 30,
            history_retention_days: 365,
        }
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn expired_retention_millis(&self) -> i64 {
        self.expired_retention_days * MILLIS_PER_DAY
    }

    #[must_use]
    pub fn history_retention_millis(&self) -> i64 {
        self.history_retention_days * MILLIS_PER_DAY
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub interval_secs: u64,
    /// Run one pass immediately when the worker starts.
    pub run_on_start: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 60 * 60,
            run_on_start: true,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Entitlement server root. Empty disables remote calls.
    pub base_url: String,
    pub app_version: String,
    pub test_mode: bool,
    pub timeout_secs: u64,
}

impl RemoteConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            app_version: "0".to_string(),
            test_mode: false,
            timeout_secs: 10,
        }
    }
}
