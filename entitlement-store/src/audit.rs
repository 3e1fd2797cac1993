//! Read-only aggregation over the transition log, for diagnostics and
//! support tooling. Nothing here mutates either table.

use crate::error::StoreResult;
use crate::{transition_from_row, EntitlementStore};
use entitlement_types::{SubscriptionId, SubscriptionState, TransitionRecord};
use rusqlite::params;
use serde::Serialize;

/// Number of accepted transitions between two states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatePairCount {
    pub from_state: SubscriptionState,
    pub to_state: SubscriptionState,
    pub count: usize,
}

/// Which history rows to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryScope {
    /// Every subscription of an account.
    Account(String),
    /// A single subscription.
    Subscription(SubscriptionId),
}

/// Aggregate view of the transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub total_transitions: usize,
    pub by_state_pair: Vec<StatePairCount>,
}

/// Read-side view of the entitlement store.
#[derive(Clone)]
pub struct AuditReader {
    store: EntitlementStore,
}

impl AuditReader {
    #[must_use]
    pub fn new(store: EntitlementStore) -> Self {
        Self { store }
    }

    /// Transition counts grouped by `(from, to)`, highest count first.
    pub fn counts_by_state_pair(&self) -> StoreResult<Vec<StatePairCount>> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(
            "SELECT from_state, to_state, COUNT(*) AS n FROM subscription_state_history \
             GROUP BY from_state, to_state ORDER BY n DESC, from_state ASC, to_state ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let from: i64 = row.get(0)?;
            let to: i64 = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok(StatePairCount {
                from_state: SubscriptionState::from_code(from),
                to_state: SubscriptionState::from_code(to),
                count: count as usize,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent transitions first, at most `limit` rows.
    pub fn recent_history(&self, scope: &HistoryScope, limit: usize) -> StoreResult<Vec<TransitionRecord>> {
        let conn = self.store.lock()?;
        let limit = limit as i64;
        let rows = match scope {
            HistoryScope::Account(account_id) => {
                let mut stmt = conn.prepare(
                    "SELECT h.id, h.subscription_id, h.from_state, h.to_state, h.timestamp, h.reason \
                     FROM subscription_state_history h \
                     JOIN subscription_status s ON s.id = h.subscription_id \
                     WHERE s.account_id = ?1 ORDER BY h.timestamp DESC, h.id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![account_id, limit], transition_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            HistoryScope::Subscription(id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, subscription_id, from_state, to_state, timestamp, reason \
                     FROM subscription_state_history WHERE subscription_id = ?1 \
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![id.get(), limit], transition_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub fn transition_count(&self, subscription_id: SubscriptionId) -> StoreResult<usize> {
        let conn = self.store.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subscription_state_history WHERE subscription_id = ?1",
            params![subscription_id.get()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn total_transitions(&self) -> StoreResult<usize> {
        let conn = self.store.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM subscription_state_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Total count plus the per-pair breakdown.
    pub fn summary(&self) -> StoreResult<AuditSummary> {
        Ok(AuditSummary {
            total_transitions: self.total_transitions()?,
            by_state_pair: self.counts_by_state_pair()?,
        })
    }
}
