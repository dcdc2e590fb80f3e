//! Bar: one OHLCV record for one symbol from one provider.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// OHLCV bar for a single symbol, provider and date.
///
/// Uniqueness is `(symbol, source, date)`. A missing cell is carried as `NaN`
/// so the quality analyzer can count it; `updated_at` records when the value
/// was fetched and decides which copy survives a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub source: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub updated_at: NaiveDateTime,
}

impl Bar {
    /// Returns true if any OHLCV field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan()
            || self.high.is_nan()
            || self.low.is_nan()
            || self.close.is_nan()
            || self.volume.is_nan()
    }

    /// Number of missing OHLCV cells (date is never missing).
    pub fn missing_cells(&self) -> usize {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .filter(|v| v.is_nan())
            .count()
    }

    /// True when high/low bracket open and close.
    pub fn has_ohlc_order(&self) -> bool {
        self.high >= self.open.max(self.close) && self.low <= self.open.min(self.close)
    }

    /// Full sanity check: no missing cells, OHLC ordering, positive prices,
    /// non-negative volume.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.has_ohlc_order()
            && self.high >= self.low
            && self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
    }

    /// Restore `high >= max(open, close)` and `low <= min(open, close)` in place.
    ///
    /// `f64::max`/`min` skip NaN operands, so a missing high or low is rebuilt
    /// from whichever of open/close is present.
    pub fn repair_ohlc(&mut self) {
        self.high = self.high.max(self.open).max(self.close);
        self.low = self.low.min(self.open).min(self.close);
    }
}
