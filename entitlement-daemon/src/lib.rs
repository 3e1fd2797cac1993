//! Host-side plumbing for `entitlementd`: config loading, logging, the
//! file-backed purchase source and engine assembly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use entitlement_engine::{
    EngineConfig, EntitlementError, EntitlementMachine, EntitlementResult, EventIngestor,
    HttpEntitlementClient, PurchaseSource,
};
use entitlement_store::EntitlementStore;
use entitlement_types::{Clock, PurchaseNotification, SystemClock};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// ── Config ───────────────────────────────────────────────────────

/// Loads the engine config. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        info!("config {:?} not found, using defaults", path);
        return Ok(EngineConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn parse_config(text: &str) -> Result<EngineConfig> {
    Ok(toml::from_str(text)?)
}

// ── Logging ──────────────────────────────────────────────────────

/// Installs the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
}

// ── Purchase source ──────────────────────────────────────────────

/// Reads the host app's JSON snapshot of current purchases.
///
/// The file holds an array of purchase notifications. A missing file means
/// the provider reports no purchases.
#[derive(Debug, Clone)]
pub struct FilePurchaseSource {
    path: PathBuf,
}

impl FilePurchaseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PurchaseSource for FilePurchaseSource {
    async fn query_purchases(&self) -> EntitlementResult<Vec<PurchaseNotification>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no purchase snapshot at {:?}", self.path);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(EntitlementError::Source(format!(
                    "reading {}: {e}",
                    self.path.display()
                )));
            }
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text)
            .map_err(|e| EntitlementError::Source(format!("parsing {}: {e}", self.path.display())))
    }
}

/// Parses a JSON array of purchase notifications.
pub fn read_notifications(path: &Path) -> Result<Vec<PurchaseNotification>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid purchase notifications in {}", path.display()))
}

// ── Assembly ─────────────────────────────────────────────────────

/// A machine wired to its store, ingestor and collaborators.
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub store: EntitlementStore,
    pub machine: Arc<EntitlementMachine>,
    pub ingestor: Arc<EventIngestor>,
}

impl Engine {
    /// Opens the database at `db_path` and restores the machine from it.
    pub async fn open(config: EngineConfig, db_path: &Path, purchases: Option<&Path>) -> Result<Self> {
        let store = EntitlementStore::open(db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        Self::with_store(config, store, Arc::new(SystemClock), purchases).await
    }

    pub async fn with_store(
        config: EngineConfig,
        store: EntitlementStore,
        clock: Arc<dyn Clock>,
        purchases: Option<&Path>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let machine = Arc::new(
            EntitlementMachine::open(store.clone(), clock, config.account_id.clone())
                .await
                .context("Failed to restore subscription state")?,
        );

        let mut ingestor = EventIngestor::new(machine.clone(), config.clone());
        if config.remote.is_enabled() {
            let client = HttpEntitlementClient::new(config.remote.clone())
                .context("Failed to build entitlement server client")?;
            ingestor = ingestor.with_remote(Arc::new(client));
        }
        if let Some(path) = purchases {
            ingestor = ingestor.with_source(Arc::new(FilePurchaseSource::new(path)));
        }

        Ok(Self {
            config,
            store,
            machine,
            ingestor: Arc::new(ingestor),
        })
    }
}
