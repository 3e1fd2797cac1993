//! Subscription entitlement engine.
//!
//! - [`EntitlementMachine`]: the single-writer state machine core
//! - [`EventIngestor`]: billing callbacks, re-queries and user requests
//! - [`ReconciliationWorker`]: periodic expiry, purge and re-query
//! - [`RemoteEntitlementClient`]: the entitlement server boundary

pub mod config;
pub mod error;
pub mod ingest;
pub mod machine;
pub mod remote;
pub mod retry;
pub mod transition;
pub mod worker;

pub use config::{EngineConfig, RemoteConfig, RetentionConfig, RetryConfig, WorkerConfig};
pub use error::{EntitlementError, EntitlementResult, RemoteError, RemoteResult};
pub use ingest::{EventIngestor, IngestFailure, IngestReport, PurchaseSource, RequeryOutcome};
pub use machine::{EntitlementMachine, EntitlementSnapshot, Outcome};
pub use remote::{EntitlementStatus, HttpEntitlementClient, RemoteEntitlementClient, RemoteResponse};
pub use retry::RetryPolicy;
pub use transition::allowed_events;
pub use worker::{ReconcileReport, ReconciliationWorker, WorkerHandle};
