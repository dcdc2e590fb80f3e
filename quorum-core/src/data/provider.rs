//! Source adapter trait and the structured error taxonomy.
//!
//! `SourceAdapter` abstracts over market-data vendors so the reconciler can
//! treat Yahoo, Polygon, Alpha Vantage, or a scripted test double the same way.
//! Adapters only speak to their vendor; throttling, retries and persistence
//! live above this trait.

use crate::domain::Interval;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One row as returned by a vendor, already mapped onto canonical field names.
///
/// Missing cells are `NaN`; normalization repairs OHLC ordering and stamps
/// symbol/source/fetch time to produce a [`crate::domain::Bar`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Error taxonomy for every data operation.
///
/// Per-provider failures are absorbed by the reconciler and recorded in the
/// rate controller's stats; only `NoDataAvailable` reaches engine callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataError {
    #[error("{provider} unavailable: {reason}")]
    SourceUnavailable { provider: String, reason: String },

    #[error("{provider} rate limited the request{}", retry_hint(.retry_after_secs))]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    #[error("{provider} does not recognize symbol '{symbol}'")]
    InvalidSymbol { provider: String, symbol: String },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("insufficient history for '{symbol}': {found} bars, need at least {required}")]
    InsufficientHistory {
        symbol: String,
        found: usize,
        required: usize,
    },

    #[error("persistence error: {0}")]
    PersistenceError(String),

    #[error("no provider yielded a usable dataset for '{symbol}'")]
    NoDataAvailable { symbol: String },

    #[error("no adapter registered for source '{0}'")]
    UnknownSource(String),
}

fn retry_hint(secs: &Option<u64>) -> String {
    match secs {
        Some(s) => format!(" (retry after {s}s)"),
        None => String::new(),
    }
}

impl DataError {
    /// Only network-level failures are worth another attempt. A rate-limited
    /// provider is not retried within the same request: the caller falls back
    /// to stored rows and the adaptive delay slows later calls.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataError::SourceUnavailable { .. })
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, DataError::RateLimited { .. })
    }

    /// The provider's `Retry-After` hint, when it sent one.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            DataError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => Some(std::time::Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Latest quote for a symbol (best-effort, provider specific).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub source: String,
    pub price: f64,
    pub previous_close: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: Option<f64>,
    pub as_of: Option<NaiveDateTime>,
}

impl Quote {
    /// Percentage change against the previous close, when the vendor did not
    /// report one itself.
    pub fn derived_change_percent(&self) -> Option<f64> {
        self.change_percent.or_else(|| {
            self.previous_close
                .filter(|prev| *prev > 0.0)
                .map(|prev| (self.price - prev) / prev * 100.0)
        })
    }
}

/// Descriptive instrument metadata (best-effort, provider specific).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub source: String,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub currency: Option<String>,
    pub instrument_type: Option<String>,
    pub sector: Option<String>,
    pub market_cap: Option<f64>,
}

/// A market-data vendor.
///
/// `fetch_raw` returns rows sorted ascending by date. Vendors that cannot
/// serve an arbitrary sub-range report `supports_partial() == false`; the
/// reconciler then asks them for the whole window.
pub trait SourceAdapter: Send + Sync {
    /// Stable provider name used in configuration, stats and the store.
    fn name(&self) -> &str;

    fn fetch_raw(
        &self,
        symbol: &str,
        interval: Interval,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, DataError>;

    fn supports_partial(&self) -> bool {
        true
    }

    /// False when the adapter knows it cannot serve requests (e.g. missing API key).
    fn is_available(&self) -> bool {
        true
    }

    fn real_time_quote(&self, symbol: &str) -> Result<Quote, DataError> {
        let _ = symbol;
        Err(DataError::SourceUnavailable {
            provider: self.name().to_string(),
            reason: "real-time quotes not supported".into(),
        })
    }

    fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, DataError> {
        let _ = symbol;
        Err(DataError::SourceUnavailable {
            provider: self.name().to_string(),
            reason: "instrument info not supported".into(),
        })
    }
}
