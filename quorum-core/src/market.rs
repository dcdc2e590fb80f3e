//! Exchange session hours and market status.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Regular session for the exchange, in local exchange time, weekdays only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketHours {
    #[serde(with = "hhmm")]
    pub open: NaiveTime,
    #[serde(with = "hhmm")]
    pub close: NaiveTime,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl MarketHours {
    pub fn is_trading_day(&self, at: NaiveDateTime) -> bool {
        !matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// True during the regular session on a weekday.
    pub fn is_open(&self, at: NaiveDateTime) -> bool {
        let t = at.time();
        self.is_trading_day(at) && t >= self.open && t < self.close
    }

    /// True when `inserted` is a snapshot taken before today's open and
    /// `now` falls inside today's session.
    pub fn is_pre_open_snapshot(&self, inserted: NaiveDateTime, now: NaiveDateTime) -> bool {
        self.is_open(now) && inserted.date() == now.date() && inserted.time() < self.open
    }

    pub fn status(&self, at: NaiveDateTime) -> MarketStatus {
        MarketStatus {
            at,
            is_trading_day: self.is_trading_day(at),
            is_open: self.is_open(at),
            session_open: self.open,
            session_close: self.close,
        }
    }
}

/// Snapshot of the session state at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatus {
    pub at: NaiveDateTime,
    pub is_trading_day: bool,
    pub is_open: bool,
    pub session_open: NaiveTime,
    pub session_close: NaiveTime,
}

/// `"HH:MM"` (de)serialization for session times.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}
