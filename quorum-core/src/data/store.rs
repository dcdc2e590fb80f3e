//! Persistent store contract and an in-process implementation.
//!
//! Stores upsert by `(symbol, source, date)`, so concurrent writers from
//! different workers need no engine-level locking: last write wins.

use super::provider::DataError;
use crate::domain::Bar;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Durable row storage keyed by `(symbol, source, date)`.
pub trait BarStore: Send + Sync {
    /// All stored bars for `(symbol, source)`, ascending by date.
    fn load_rows(&self, symbol: &str, source: &str) -> Result<Vec<Bar>, DataError>;

    /// Upsert `bars` for `(symbol, source)`.
    fn store_rows(&self, symbol: &str, source: &str, bars: &[Bar]) -> Result<(), DataError>;

    /// Most recent `updated_at` for `(symbol, source)`, if anything is stored.
    fn last_updated(&self, symbol: &str, source: &str)
        -> Result<Option<NaiveDateTime>, DataError>;

    /// True when the latest update is no older than `days_threshold` days.
    fn is_fresh(
        &self,
        symbol: &str,
        source: &str,
        days_threshold: u32,
        now: NaiveDateTime,
    ) -> Result<bool, DataError> {
        let limit = Duration::days(i64::from(days_threshold));
        Ok(self
            .last_updated(symbol, source)?
            .is_some_and(|t| now - t <= limit))
    }
}

type Partition = BTreeMap<NaiveDate, Bar>;

/// Store backed by a map in memory. Useful for tests and for runs that should
/// not touch disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<(String, String), Partition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `(symbol, source)` partitions held.
    pub fn partitions(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }
}

fn poisoned(_: impl std::fmt::Display) -> DataError {
    DataError::PersistenceError("memory store lock poisoned".into())
}

impl BarStore for MemoryStore {
    fn load_rows(&self, symbol: &str, source: &str) -> Result<Vec<Bar>, DataError> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .get(&(symbol.to_string(), source.to_string()))
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    fn store_rows(&self, symbol: &str, source: &str, bars: &[Bar]) -> Result<(), DataError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let partition = rows
            .entry((symbol.to_string(), source.to_string()))
            .or_default();
        for bar in bars {
            partition.insert(bar.date, bar.clone());
        }
        Ok(())
    }

    fn last_updated(
        &self,
        symbol: &str,
        source: &str,
    ) -> Result<Option<NaiveDateTime>, DataError> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .get(&(symbol.to_string(), source.to_string()))
            .and_then(|p| p.values().map(|b| b.updated_at).max()))
    }
}
