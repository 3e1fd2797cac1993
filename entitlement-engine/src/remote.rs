//! Client for the remote entitlement server.
//!
//! The server is the source of truth for cancellation and revocation. All
//! three calls are idempotent and keyed by `(account_id, purchase_token)`.
//! Any transport error, non-2xx status or error body means "do not apply
//! locally".

use crate::config::RemoteConfig;
use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use entitlement_types::token_hint;
use reqwest::{Client, Method};
use serde::Deserialize;
use tracing::debug;

/// Successful server reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteResponse {
    /// Raw response body, if any.
    pub payload: Option<String>,
}

/// Entitlement flags reported by a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EntitlementStatus {
    pub expired: bool,
    pub canceled: bool,
    pub revoked: bool,
    #[serde(rename = "purchaseId")]
    pub purchase_id: Option<String>,
}

impl EntitlementStatus {
    /// Parses a query payload. Returns `None` for anything that is not a
    /// JSON object.
    #[must_use]
    pub fn from_payload(payload: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

/// The three operations the state machine needs from the entitlement server.
#[async_trait]
pub trait RemoteEntitlementClient: Send + Sync {
    async fn cancel_subscription(&self, account_id: &str, purchase_token: &str) -> RemoteResult<RemoteResponse>;

    async fn revoke_subscription(&self, account_id: &str, purchase_token: &str) -> RemoteResult<RemoteResponse>;

    async fn query_entitlement(&self, account_id: &str, purchase_token: &str) -> RemoteResult<RemoteResponse>;
}

/// HTTP implementation over reqwest.
pub struct HttpEntitlementClient {
    config: RemoteConfig,
    client: Client,
}

impl HttpEntitlementClient {
    pub fn new(config: RemoteConfig) -> RemoteResult<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/g/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path,
            self.config.app_version
        )
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        account_id: &str,
        purchase_token: &str,
    ) -> RemoteResult<RemoteResponse> {
        let test = if self.config.test_mode { "true" } else { "false" };
        debug!(
            "{} /g/{} for account {} (token {})",
            method,
            path,
            account_id,
            token_hint(purchase_token)
        );

        let response = self
            .client
            .request(method, self.url(path))
            .query(&[
                ("cid", account_id),
                ("purchaseToken", purchase_token),
                ("test", test),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                code: status.as_u16(),
                body,
            });
        }

        if let Some(error) = error_field(&body) {
            return Err(RemoteError::Rejected(error));
        }

        Ok(RemoteResponse {
            payload: (!body.trim().is_empty()).then_some(body),
        })
    }
}

#[async_trait]
impl RemoteEntitlementClient for HttpEntitlementClient {
    async fn cancel_subscription(&self, account_id: &str, purchase_token: &str) -> RemoteResult<RemoteResponse> {
        self.call(Method::POST, "stop", account_id, purchase_token).await
    }

    async fn revoke_subscription(&self, account_id: &str, purchase_token: &str) -> RemoteResult<RemoteResponse> {
        self.call(Method::POST, "refund", account_id, purchase_token).await
    }

    async fn query_entitlement(&self, account_id: &str, purchase_token: &str) -> RemoteResult<RemoteResponse> {
        self.call(Method::GET, "ent", account_id, purchase_token).await
    }
}

/// The `error` field of a JSON object body, if present.
fn error_field(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
