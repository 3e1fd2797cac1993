//! Persistent storage for subscription entitlement state.
//!
//! Two tables back the state machine:
//! - `subscription_status`: one row per purchase lifecycle, mutated in place
//! - `subscription_state_history`: append-only log of accepted transitions
//!
//! Every accepted transition writes both inside one SQLite transaction via
//! [`EntitlementStore::atomically`]; a failure anywhere rolls back both.

mod audit;
mod error;

pub use audit::{AuditReader, AuditSummary, HistoryScope, StatePairCount};
pub use error::{StoreError, StoreResult};

use entitlement_types::{
    NewTransition, SubscriptionId, SubscriptionRecord, SubscriptionState, TransitionRecord,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS subscription_status (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id TEXT NOT NULL,
        purchase_token TEXT NOT NULL DEFAULT '',
        product_id TEXT NOT NULL DEFAULT '',
        plan_id TEXT NOT NULL DEFAULT '',
        product_title TEXT NOT NULL DEFAULT '',
        state INTEGER NOT NULL,
        purchase_time INTEGER NOT NULL DEFAULT 0,
        account_expiry INTEGER NOT NULL DEFAULT 0,
        billing_expiry INTEGER NOT NULL DEFAULT 0,
        developer_payload TEXT NOT NULL DEFAULT '',
        last_updated INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_status_account ON subscription_status(account_id);
    CREATE INDEX IF NOT EXISTS idx_status_token ON subscription_status(purchase_token);
    CREATE INDEX IF NOT EXISTS idx_status_billing_expiry ON subscription_status(billing_expiry);

    CREATE TABLE IF NOT EXISTS subscription_state_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subscription_id INTEGER NOT NULL,
        from_state INTEGER NOT NULL,
        to_state INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        reason TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_history_subscription ON subscription_state_history(subscription_id);
    CREATE INDEX IF NOT EXISTS idx_history_timestamp ON subscription_state_history(timestamp);
";

const RECORD_COLUMNS: &str = "id, account_id, purchase_token, product_id, plan_id, product_title, \
     state, purchase_time, account_expiry, billing_expiry, developer_payload, last_updated";

/// SQLite-backed store for subscription records and their transition log.
#[derive(Clone)]
pub struct EntitlementStore {
    conn: Arc<Mutex<Connection>>,
}

impl EntitlementStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!("opened entitlement store at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Runs `f` inside one SQLite transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls
    /// back every write made through the [`StoreTxn`].
    pub fn atomically<T>(&self, f: impl FnOnce(&StoreTxn<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&StoreTxn { tx: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    // ── Current records ──────────────────────────────────────────

    /// Returns the most recently updated record for an account.
    pub fn get_current(&self, account_id: &str) -> StoreResult<Option<SubscriptionRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM subscription_status WHERE account_id = ?1 \
                     ORDER BY last_updated DESC, id DESC LIMIT 1"
                ),
                params![account_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_by_id(&self, id: SubscriptionId) -> StoreResult<Option<SubscriptionRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM subscription_status WHERE id = ?1"),
                params![id.get()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Returns the record stored under a purchase token. A live row wins
    /// over terminal ones; among equals the oldest wins.
    pub fn get_by_token(&self, purchase_token: &str) -> StoreResult<Option<SubscriptionRecord>> {
        if purchase_token.is_empty() {
            return Ok(None);
        }
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM subscription_status WHERE purchase_token = ?1 \
                     ORDER BY state IN (?2, ?3) ASC, id ASC LIMIT 1"
                ),
                params![
                    purchase_token,
                    SubscriptionState::Revoked.code(),
                    SubscriptionState::PurchaseFailed.code()
                ],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Returns every record for an account, oldest first.
    pub fn list_for_account(&self, account_id: &str) -> StoreResult<Vec<SubscriptionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM subscription_status WHERE account_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![account_id], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Writes a record outside of any transition. Prefer [`Self::atomically`]
    /// for state changes so the audit row lands with it.
    pub fn upsert_current(&self, record: &SubscriptionRecord) -> StoreResult<SubscriptionId> {
        self.atomically(|tx| tx.upsert_current(record))
    }

    // ── History ──────────────────────────────────────────────────

    /// Returns the transitions of one subscription, oldest first.
    pub fn get_history(&self, subscription_id: SubscriptionId) -> StoreResult<Vec<TransitionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, subscription_id, from_state, to_state, timestamp, reason \
             FROM subscription_state_history WHERE subscription_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![subscription_id.get()], transition_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Reconciliation queries ───────────────────────────────────

    /// Records whose billing expiry is set and has passed, excluding rows
    /// already `Expired` or `Revoked`.
    pub fn find_expired_where(&self, now_ms: i64) -> StoreResult<Vec<SubscriptionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM subscription_status \
             WHERE billing_expiry > 0 AND billing_expiry < ?1 AND state NOT IN (?2, ?3) \
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                now_ms,
                SubscriptionState::Expired.code(),
                SubscriptionState::Revoked.code()
            ],
            record_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Deletes records in `state` last updated before `cutoff_ms`.
    pub fn delete_older_than(&self, state: SubscriptionState, cutoff_ms: i64) -> StoreResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM subscription_status WHERE state = ?1 AND last_updated < ?2",
            params![state.code(), cutoff_ms],
        )?;
        if deleted > 0 {
            debug!("deleted {deleted} {state} record(s) older than {cutoff_ms}");
        }
        Ok(deleted)
    }

    /// Deletes transition rows older than `cutoff_ms`.
    pub fn purge_history_before(&self, cutoff_ms: i64) -> StoreResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM subscription_state_history WHERE timestamp < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    /// Purchase tokens stored on more than one live row, with their row
    /// counts. Rows without a token yet and terminal rows (`Revoked`,
    /// `PurchaseFailed`) are not considered.
    pub fn find_duplicate_tokens(&self) -> StoreResult<Vec<(String, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT purchase_token, COUNT(*) FROM subscription_status \
             WHERE purchase_token != '' AND state NOT IN (?1, ?2) \
             GROUP BY purchase_token HAVING COUNT(*) > 1 ORDER BY purchase_token",
        )?;
        let rows = stmt.query_map(
            params![
                SubscriptionState::Revoked.code(),
                SubscriptionState::PurchaseFailed.code()
            ],
            |row| {
                let token: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((token, count as usize))
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Keeps only the lowest-id live row of every duplicated token. Terminal
    /// rows are left for the retention policy.
    pub fn remove_duplicate_tokens(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM subscription_status \
             WHERE purchase_token != '' AND state NOT IN (?1, ?2) AND id NOT IN \
             (SELECT MIN(id) FROM subscription_status \
              WHERE purchase_token != '' AND state NOT IN (?1, ?2) GROUP BY purchase_token)",
            params![
                SubscriptionState::Revoked.code(),
                SubscriptionState::PurchaseFailed.code()
            ],
        )?;
        if removed > 0 {
            debug!("removed {removed} duplicate-token record(s)");
        }
        Ok(removed)
    }

    /// Returns an audit reader over the same connection.
    #[must_use]
    pub fn audit(&self) -> AuditReader {
        AuditReader::new(self.clone())
    }
}

/// Write handle valid for the duration of [`EntitlementStore::atomically`].
pub struct StoreTxn<'a> {
    tx: &'a Transaction<'a>,
}

impl StoreTxn<'_> {
    /// Inserts or replaces a record and returns its row id.
    ///
    /// A record without an id is inserted and assigned one. A record with an
    /// id replaces the row with that id.
    pub fn upsert_current(&self, record: &SubscriptionRecord) -> StoreResult<SubscriptionId> {
        self.tx.execute(
            "INSERT OR REPLACE INTO subscription_status (id, account_id, purchase_token, product_id, \
             plan_id, product_title, state, purchase_time, account_expiry, billing_expiry, \
             developer_payload, last_updated) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id.map(SubscriptionId::get),
                record.account_id,
                record.purchase_token,
                record.product_id,
                record.plan_id,
                record.product_title,
                record.state.code(),
                record.purchase_time_ms,
                record.account_expiry_ms,
                record.billing_expiry_ms,
                record.developer_payload,
                record.last_updated_ms,
            ],
        )?;
        Ok(match record.id {
            Some(id) => id,
            None => SubscriptionId::new(self.tx.last_insert_rowid()),
        })
    }

    /// Appends one transition row and returns its id.
    pub fn append_history(&self, transition: &NewTransition) -> StoreResult<i64> {
        if transition.from_state == transition.to_state {
            return Err(StoreError::InvalidData(format!(
                "transition {} -> {} does not change state",
                transition.from_state, transition.to_state
            )));
        }
        self.tx.execute(
            "INSERT INTO subscription_state_history (subscription_id, from_state, to_state, timestamp, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                transition.subscription_id.get(),
                transition.from_state.code(),
                transition.to_state.code(),
                transition.timestamp_ms,
                transition.reason,
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }
}

fn decode_state(code: i64) -> SubscriptionState {
    let state = SubscriptionState::from_code(code);
    if state == SubscriptionState::Unknown && code != SubscriptionState::Unknown.code() {
        warn!("unrecognized persisted state code {code}, treating as Unknown");
    }
    state
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SubscriptionRecord> {
    Ok(SubscriptionRecord {
        id: Some(SubscriptionId::new(row.get(0)?)),
        account_id: row.get(1)?,
        purchase_token: row.get(2)?,
        product_id: row.get(3)?,
        plan_id: row.get(4)?,
        product_title: row.get(5)?,
        state: decode_state(row.get(6)?),
        purchase_time_ms: row.get(7)?,
        account_expiry_ms: row.get(8)?,
        billing_expiry_ms: row.get(9)?,
        developer_payload: row.get(10)?,
        last_updated_ms: row.get(11)?,
    })
}

pub(crate) fn transition_from_row(row: &Row<'_>) -> rusqlite::Result<TransitionRecord> {
    Ok(TransitionRecord {
        id: row.get(0)?,
        subscription_id: SubscriptionId::new(row.get(1)?),
        from_state: decode_state(row.get(2)?),
        to_state: decode_state(row.get(3)?),
        timestamp_ms: row.get(4)?,
        reason: row.get(5)?,
    })
}
