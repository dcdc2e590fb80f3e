//! Alpha Vantage adapter over the time-series API.
//!
//! The API only returns "the latest N periods" (or the full history), so this
//! adapter cannot serve sub-ranges: `supports_partial()` is false and the
//! reconciler asks it for the whole window.

use crate::clock::{Clock, SystemClock};
use crate::data::http;
use crate::data::provider::{DataError, InstrumentInfo, Quote, RawRow, SourceAdapter};
use crate::domain::Interval;
use chrono::NaiveDate;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAME: &str = "alpha_vantage";
pub const API_KEY_ENV: &str = "ALPHA_VANTAGE_API_KEY";
const BASE_URL: &str = "https://www.alphavantage.co/query";
/// Compact responses hold the latest 100 periods; ask for full history beyond
/// this many calendar days back.
const COMPACT_CALENDAR_DAYS: i64 = 140;

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(rename = "Time Series (Daily)")]
    daily: Option<BTreeMap<String, SeriesBar>>,
    #[serde(rename = "Weekly Time Series")]
    weekly: Option<BTreeMap<String, SeriesBar>>,
    #[serde(flatten)]
    notice: Notice,
}

/// Throttle and error messages arrive as 200 responses with these keys.
#[derive(Debug, Default, Deserialize)]
struct Notice {
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeriesBar {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

#[derive(Debug, Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    quote: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    notice: Notice,
}

#[derive(Debug, Deserialize)]
struct OverviewResponse {
    #[serde(rename = "Symbol")]
    symbol: Option<String>,
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Exchange")]
    exchange: Option<String>,
    #[serde(rename = "Currency")]
    currency: Option<String>,
    #[serde(rename = "AssetType")]
    asset_type: Option<String>,
    #[serde(rename = "Sector")]
    sector: Option<String>,
    #[serde(rename = "MarketCapitalization")]
    market_cap: Option<String>,
    #[serde(flatten)]
    notice: Notice,
}

impl Notice {
    fn check(&self, symbol: &str) -> Result<(), DataError> {
        if self.note.is_some() || self.information.is_some() {
            return Err(DataError::RateLimited {
                provider: NAME.into(),
                retry_after_secs: Some(60),
            });
        }
        if self.error_message.is_some() {
            return Err(invalid_symbol(symbol));
        }
        Ok(())
    }
}

fn invalid_symbol(symbol: &str) -> DataError {
    DataError::InvalidSymbol {
        provider: NAME.into(),
        symbol: symbol.to_string(),
    }
}

pub struct AlphaVantageAdapter {
    client: Client,
    api_key: String,
    clock: Arc<dyn Clock>,
}

impl AlphaVantageAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, DataError> {
        Ok(Self {
            client: http::client(NAME)?,
            api_key: api_key.into(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Date source for the compact/full history decision.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn output_size(&self, start: NaiveDate) -> &'static str {
        let days_back = (self.clock.now().date() - start).num_days();
        if days_back > COMPACT_CALENDAR_DAYS {
            "full"
        } else {
            "compact"
        }
    }

    /// Build from `ALPHA_VANTAGE_API_KEY`; `None` when the variable is unset or empty.
    pub fn from_env() -> Option<Result<Self, DataError>> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Self::new)
    }

    fn query<T: serde::de::DeserializeOwned>(
        &self,
        symbol: &str,
        params: &[(&str, &str)],
    ) -> Result<T, DataError> {
        let mut q = params.to_vec();
        q.push(("symbol", symbol));
        q.push(("apikey", self.api_key.as_str()));
        http::get_json(&self.client, NAME, symbol, BASE_URL, &q)
    }
}

fn parse_series(
    symbol: &str,
    interval: Interval,
    resp: SeriesResponse,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<RawRow>, DataError> {
    resp.notice.check(symbol)?;
    let series = match interval {
        Interval::Daily => resp.daily,
        Interval::Weekly => resp.weekly,
    }
    .ok_or_else(|| DataError::InvalidData(format!("{NAME}: response has no time series")))?;

    let mut rows = Vec::new();
    for (day, bar) in series {
        let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
            .map_err(|_| DataError::InvalidData(format!("{NAME}: bad date '{day}'")))?;
        if date < start || date > end {
            continue;
        }
        rows.push(RawRow {
            date,
            open: http::parse_number(NAME, "open", &bar.open)?,
            high: http::parse_number(NAME, "high", &bar.high)?,
            low: http::parse_number(NAME, "low", &bar.low)?,
            close: http::parse_number(NAME, "close", &bar.close)?,
            volume: http::parse_number(NAME, "volume", &bar.volume)?,
        });
    }
    rows.sort_by_key(|r| r.date);
    Ok(rows)
}

fn parse_quote(symbol: &str, resp: GlobalQuoteResponse) -> Result<Quote, DataError> {
    resp.notice.check(symbol)?;
    let fields = resp
        .quote
        .filter(|q| !q.is_empty())
        .ok_or_else(|| invalid_symbol(symbol))?;
    let number = |key: &str| -> Result<Option<f64>, DataError> {
        fields
            .get(key)
            .map(|v| http::parse_number(NAME, key, v.trim_end_matches('%')))
            .transpose()
    };

    let price = number("05. price")?
        .ok_or_else(|| DataError::InvalidData(format!("{NAME}: quote has no price")))?;
    Ok(Quote {
        symbol: symbol.to_string(),
        source: NAME.into(),
        price,
        previous_close: number("08. previous close")?,
        change_percent: number("10. change percent")?,
        volume: number("06. volume")?,
        as_of: fields
            .get("07. latest trading day")
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
    })
}

fn parse_overview(symbol: &str, resp: OverviewResponse) -> Result<InstrumentInfo, DataError> {
    resp.notice.check(symbol)?;
    if resp.symbol.is_none() {
        return Err(invalid_symbol(symbol));
    }
    Ok(InstrumentInfo {
        symbol: symbol.to_string(),
        source: NAME.into(),
        name: resp.name,
        exchange: resp.exchange,
        currency: resp.currency,
        instrument_type: resp.asset_type,
        sector: resp.sector,
        market_cap: resp.market_cap.and_then(|m| m.parse().ok()),
    })
}

impl SourceAdapter for AlphaVantageAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn fetch_raw(
        &self,
        symbol: &str,
        interval: Interval,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, DataError> {
        let function = match interval {
            Interval::Daily => "TIME_SERIES_DAILY",
            Interval::Weekly => "TIME_SERIES_WEEKLY",
        };
        let size = self.output_size(start);
        let resp: SeriesResponse =
            self.query(symbol, &[("function", function), ("outputsize", size)])?;
        parse_series(symbol, interval, resp, start, end)
    }

    fn supports_partial(&self) -> bool {
        false
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn real_time_quote(&self, symbol: &str) -> Result<Quote, DataError> {
        let resp: GlobalQuoteResponse = self.query(symbol, &[("function", "GLOBAL_QUOTE")])?;
        parse_quote(symbol, resp)
    }

    fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, DataError> {
        let resp: OverviewResponse = self.query(symbol, &[("function", "OVERVIEW")])?;
        parse_overview(symbol, resp)
    }
}
