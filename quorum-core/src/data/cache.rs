//! Short-lived in-memory dataset cache keyed by request fingerprint.
//!
//! An entry is served while `now - inserted_at < ttl`, except that during
//! market hours a snapshot taken before that day's open is stale. Warming
//! preloads the first symbols of a priority-ordered list from the store
//! during low-traffic hours.

use super::store::BarStore;
use crate::clock::Clock;
use crate::config::CacheSettings;
use crate::domain::{Bar, Interval, Period};
use crate::fingerprint::RequestFingerprint;
use crate::market::MarketHours;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// What a cache hit hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDataset {
    pub symbol: String,
    pub source: String,
    pub bars: Arc<Vec<Bar>>,
    /// Composite quality score, when the dataset went through analysis.
    pub composite_score: Option<f64>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    symbol: String,
    inserted_at: NaiveDateTime,
    payload: CachedDataset,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<RequestFingerprint, CacheEntry>,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheAnalytics {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub invalidations: u64,
}

/// Outcome of one warming pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmReport {
    /// False when the current hour is not a low-traffic hour.
    pub ran: bool,
    pub warmed: Vec<String>,
    pub already_cached: Vec<String>,
    pub no_data: Vec<String>,
}

pub struct BarCache {
    inner: Mutex<Inner>,
    ttl: chrono::Duration,
    warm_top_n: usize,
    low_traffic_hours: Vec<u32>,
    hours: MarketHours,
    clock: Arc<dyn Clock>,
}

impl BarCache {
    pub fn new(settings: &CacheSettings, hours: MarketHours, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl: chrono::Duration::seconds(settings.ttl_secs as i64),
            warm_top_n: settings.warm_top_n,
            low_traffic_hours: settings.low_traffic_hours.clone(),
            hours,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_valid(&self, entry: &CacheEntry, now: NaiveDateTime) -> bool {
        now - entry.inserted_at < self.ttl
            && !self.hours.is_pre_open_snapshot(entry.inserted_at, now)
    }

    /// Look up a fingerprint, dropping the entry if it has gone stale.
    pub fn get(&self, key: &RequestFingerprint) -> Option<CachedDataset> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let valid = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => self.is_valid(entry, now),
        };

        if valid {
            inner.hits += 1;
            inner.entries.get(key).map(|e| e.payload.clone())
        } else {
            inner.entries.remove(key);
            inner.misses += 1;
            inner.invalidations += 1;
            debug!(key = %key, "stale cache entry dropped");
            None
        }
    }

    pub fn insert(&self, key: RequestFingerprint, payload: CachedDataset) {
        let entry = CacheEntry {
            symbol: payload.symbol.clone(),
            inserted_at: self.clock.now(),
            payload,
        };
        self.lock().entries.insert(key, entry);
    }

    /// Presence check that does not touch hit/miss counters.
    pub fn contains_valid(&self, key: &RequestFingerprint) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|e| self.is_valid(e, now))
    }

    pub fn invalidate(&self, key: &RequestFingerprint) -> bool {
        let mut inner = self.lock();
        let removed = inner.entries.remove(key).is_some();
        if removed {
            inner.invalidations += 1;
        }
        removed
    }

    /// Drop every entry for `symbol`, whatever its request shape.
    pub fn invalidate_symbol(&self, symbol: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| !e.symbol.eq_ignore_ascii_case(symbol));
        let removed = before - inner.entries.len();
        inner.invalidations += removed as u64;
        removed
    }

    /// Remove every entry that would no longer be served.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        let ttl = self.ttl;
        let hours = self.hours;
        inner.entries.retain(|_, e| {
            now - e.inserted_at < ttl && !hours.is_pre_open_snapshot(e.inserted_at, now)
        });
        let removed = before - inner.entries.len();
        inner.invalidations += removed as u64;
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        let n = inner.entries.len() as u64;
        inner.entries.clear();
        inner.invalidations += n;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn analytics(&self) -> CacheAnalytics {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheAnalytics {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            invalidations: inner.invalidations,
        }
    }

    /// True when the current hour is a configured low-traffic hour.
    pub fn in_warming_window(&self) -> bool {
        self.low_traffic_hours.contains(&self.clock.now().hour())
    }

    /// Preload the first `warm_top_n` symbols from the store, taking each
    /// symbol from the first source (in `sources` order) with rows inside
    /// the period's window.
    pub fn warm(
        &self,
        symbols: &[String],
        sources: &[String],
        interval: Interval,
        period: Period,
        store: &dyn BarStore,
    ) -> WarmReport {
        let mut report = WarmReport::default();
        if !self.in_warming_window() {
            debug!("outside low-traffic hours, skipping cache warming");
            return report;
        }
        report.ran = true;
        let window = period.window_ending(self.clock.now().date());

        for symbol in symbols.iter().take(self.warm_top_n) {
            let key = RequestFingerprint::new(symbol, interval, period, sources);
            if self.contains_valid(&key) {
                report.already_cached.push(symbol.clone());
                continue;
            }

            let mut found = None;
            for source in sources {
                match store.load_rows(symbol, source) {
                    Ok(rows) => {
                        let rows: Vec<Bar> =
                            rows.into_iter().filter(|b| window.covers(interval, b.date)).collect();
                        if !rows.is_empty() {
                            found = Some((source.clone(), rows));
                            break;
                        }
                    }
                    Err(e) => warn!(symbol = %symbol, source = %source, error = %e, "warming load failed"),
                }
            }

            match found {
                Some((source, rows)) => {
                    self.insert(
                        key,
                        CachedDataset {
                            symbol: symbol.clone(),
                            source,
                            bars: Arc::new(rows),
                            composite_score: None,
                        },
                    );
                    report.warmed.push(symbol.clone());
                }
                None => report.no_data.push(symbol.clone()),
            }
        }

        info!(
            warmed = report.warmed.len(),
            cached = report.already_cached.len(),
            missing = report.no_data.len(),
            "cache warming pass finished"
        );
        report
    }
}
