//! Canonicalization: raw vendor rows → bars, merging fetched deltas into
//! stored history, and working out which dates are still missing.

use super::provider::{DataError, RawRow};
use crate::domain::{Bar, DateWindow, Interval};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use std::collections::{BTreeMap, BTreeSet};

/// Turn vendor rows into bars for `(symbol, source)`.
///
/// - infinite values are rejected (a vendor sending them is broken)
/// - rows with every price cell missing are dropped (holidays, halts)
/// - OHLC ordering is repaired in place
/// - output is sorted ascending with one bar per date (last row wins)
pub fn normalize(
    symbol: &str,
    source: &str,
    rows: Vec<RawRow>,
    fetched_at: NaiveDateTime,
) -> Result<Vec<Bar>, DataError> {
    let mut by_date: BTreeMap<NaiveDate, Bar> = BTreeMap::new();

    for row in rows {
        let cells = [
            ("open", row.open),
            ("high", row.high),
            ("low", row.low),
            ("close", row.close),
            ("volume", row.volume),
        ];
        if let Some((field, value)) = cells.iter().find(|(_, v)| v.is_infinite()) {
            return Err(DataError::InvalidData(format!(
                "{source}: {field} for {symbol} on {} is {value}",
                row.date
            )));
        }
        if row.open.is_nan() && row.high.is_nan() && row.low.is_nan() && row.close.is_nan() {
            continue;
        }

        let mut bar = Bar {
            symbol: symbol.to_string(),
            source: source.to_string(),
            date: row.date,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            updated_at: fetched_at,
        };
        bar.repair_ohlc();
        by_date.insert(bar.date, bar);
    }

    Ok(by_date.into_values().collect())
}

/// Result of folding fetched bars into existing ones.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub bars: Vec<Bar>,
    /// Dates that were not present before.
    pub added: usize,
    /// Existing dates overwritten by a fetched value.
    pub replaced: usize,
    /// The merge lost rows and the existing set was kept instead.
    pub fell_back: bool,
}

/// Concatenate existing + fetched, dedupe by date keeping the fetched copy,
/// sort ascending. A result smaller than `existing` is a failed merge and
/// yields `existing` unchanged.
pub fn merge(existing: &[Bar], fetched: &[Bar]) -> MergeOutcome {
    let mut by_date: BTreeMap<NaiveDate, Bar> = BTreeMap::new();
    for bar in existing {
        by_date.insert(bar.date, bar.clone());
    }

    let mut added = 0;
    let mut replaced = 0;
    for bar in fetched {
        match by_date.insert(bar.date, bar.clone()) {
            Some(_) => replaced += 1,
            None => added += 1,
        }
    }

    let bars: Vec<Bar> = by_date.into_values().collect();
    if bars.len() < existing.len() {
        let mut kept = existing.to_vec();
        kept.sort_by_key(|b| b.date);
        return MergeOutcome {
            bars: kept,
            added: 0,
            replaced: 0,
            fell_back: true,
        };
    }

    MergeOutcome {
        bars,
        added,
        replaced,
        fell_back: false,
    }
}

/// How much of a window a provider already has.
#[derive(Debug, Clone, PartialEq)]
pub struct Coverage {
    /// Expected slots already present.
    pub present: usize,
    /// Expected slots not present, ascending.
    pub missing: Vec<NaiveDate>,
}

impl Coverage {
    /// `present / (present + missing)`; an empty expectation counts as complete.
    pub fn completion(&self) -> f64 {
        let total = self.present + self.missing.len();
        if total == 0 {
            1.0
        } else {
            self.present as f64 / total as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Smallest `[start, end]` covering every missing slot.
    pub fn missing_range(&self, interval: Interval) -> Option<(NaiveDate, NaiveDate)> {
        let first = *self.missing.first()?;
        let last = *self.missing.last()?;
        Some((first, last + Duration::days(interval.step_days() - 1)))
    }
}

/// Compare stored bars against the slots a window should contain.
///
/// Daily slots are calendar dates (optionally weekdays only); weekly slots
/// are ISO weeks keyed by their Monday.
pub fn coverage(
    existing: &[Bar],
    window: DateWindow,
    interval: Interval,
    weekdays_only: bool,
) -> Coverage {
    let expected: BTreeSet<NaiveDate> = window
        .dates()
        .filter(|d| !weekdays_only || !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .map(|d| interval.slot(d))
        .collect();
    let have: BTreeSet<NaiveDate> = existing.iter().map(|b| interval.slot(b.date)).collect();

    let present = expected.intersection(&have).count();
    let missing = expected.difference(&have).copied().collect();
    Coverage { present, missing }
}
