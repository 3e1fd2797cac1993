//! Diagnostic view of the billing provider's developer payload.
//!
//! The payload is opaque JSON forwarded with a purchase. A few fields are
//! useful in logs; none of them carry authority over the entitlement.

use serde::Deserialize;

/// Fields read from a developer payload for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PayloadInfo {
    /// Expiry hint in epoch millis.
    pub expiry: Option<i64>,
    /// Account hint.
    pub cid: Option<String>,
    /// Whether the purchase was made in test mode.
    pub test: Option<bool>,
}

impl PayloadInfo {
    /// Parses a payload. Empty or unparsable payloads yield `None`.
    #[must_use]
    pub fn parse(payload: &str) -> Option<Self> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Returns true if no diagnostic field was present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expiry.is_none() && self.cid.is_none() && self.test.is_none()
    }
}
