//! Request shapes: bar interval, lookback period, and the date window they imply.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bar interval requested from providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[default]
    Daily,
    Weekly,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
        }
    }

    /// Largest spacing between consecutive bars that is not a gap.
    pub fn step_days(&self) -> i64 {
        match self {
            Interval::Daily => 1,
            Interval::Weekly => 7,
        }
    }

    /// The slot a date falls into: the date itself for daily bars, the
    /// Monday of its ISO week for weekly bars.
    pub fn slot(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Interval::Daily => date,
            Interval::Weekly => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "1d" => Ok(Interval::Daily),
            "weekly" | "1wk" => Ok(Interval::Weekly),
            other => Err(format!("unknown interval '{other}' (expected daily or weekly)")),
        }
    }
}

/// Lookback period, expressed in calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Period {
    #[serde(rename = "1mo")]
    OneMonth,
    #[serde(rename = "3mo")]
    ThreeMonths,
    #[default]
    #[serde(rename = "6mo")]
    SixMonths,
    #[serde(rename = "1y")]
    OneYear,
    #[serde(rename = "2y")]
    TwoYears,
}

impl Period {
    pub fn days(&self) -> i64 {
        match self {
            Period::OneMonth => 30,
            Period::ThreeMonths => 90,
            Period::SixMonths => 180,
            Period::OneYear => 365,
            Period::TwoYears => 730,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::OneMonth => "1mo",
            Period::ThreeMonths => "3mo",
            Period::SixMonths => "6mo",
            Period::OneYear => "1y",
            Period::TwoYears => "2y",
        }
    }

    /// The window `[end - days, end]`.
    pub fn window_ending(&self, end: NaiveDate) -> DateWindow {
        DateWindow {
            start: end - Duration::days(self.days()),
            end,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1mo" => Ok(Period::OneMonth),
            "3mo" => Ok(Period::ThreeMonths),
            "6mo" => Ok(Period::SixMonths),
            "1y" => Ok(Period::OneYear),
            "2y" => Ok(Period::TwoYears),
            other => Err(format!(
                "unknown period '{other}' (expected 1mo, 3mo, 6mo, 1y or 2y)"
            )),
        }
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Returns `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Whether `date` falls in one of the window's `interval` slots. A weekly
    /// bar keyed by the Monday before `start` still belongs to the first week.
    pub fn covers(&self, interval: Interval, date: NaiveDate) -> bool {
        let slot = interval.slot(date);
        slot >= interval.slot(self.start) && slot <= interval.slot(self.end)
    }

    /// Number of calendar days in the window, both ends included.
    pub fn calendar_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Every calendar date in the window, ascending.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}
