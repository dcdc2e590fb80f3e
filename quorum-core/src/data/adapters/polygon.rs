//! Polygon.io adapter over the aggregates range API.

use crate::data::http;
use crate::data::provider::{DataError, InstrumentInfo, Quote, RawRow, SourceAdapter};
use crate::domain::Interval;
use chrono::{DateTime, NaiveDate};
use reqwest::blocking::Client;
use serde::Deserialize;

pub const NAME: &str = "polygon";
pub const API_KEY_ENV: &str = "POLYGON_API_KEY";
const BASE_URL: &str = "https://api.polygon.io";

#[derive(Debug, Deserialize)]
struct AggsResponse {
    status: Option<String>,
    #[serde(default)]
    results: Vec<Agg>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Agg {
    /// Window start, epoch milliseconds.
    t: i64,
    o: Option<f64>,
    h: Option<f64>,
    l: Option<f64>,
    c: Option<f64>,
    v: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    results: Option<TickerDetails>,
}

#[derive(Debug, Deserialize)]
struct TickerDetails {
    name: Option<String>,
    primary_exchange: Option<String>,
    currency_name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    sic_description: Option<String>,
    market_cap: Option<f64>,
}

pub struct PolygonAdapter {
    client: Client,
    api_key: String,
}

impl PolygonAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, DataError> {
        Ok(Self {
            client: http::client(NAME)?,
            api_key: api_key.into(),
        })
    }

    /// Build from `POLYGON_API_KEY`; `None` when the variable is unset or empty.
    pub fn from_env() -> Option<Result<Self, DataError>> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Self::new)
    }

    fn aggs(&self, symbol: &str, path: &str, query: &[(&str, &str)]) -> Result<AggsResponse, DataError> {
        let url = format!("{BASE_URL}{path}");
        let mut q = query.to_vec();
        q.push(("apiKey", self.api_key.as_str()));
        let resp: AggsResponse = http::get_json(&self.client, NAME, symbol, &url, &q)?;
        check_status(symbol, &resp)?;
        Ok(resp)
    }
}

fn check_status(symbol: &str, resp: &AggsResponse) -> Result<(), DataError> {
    let detail = || {
        resp.error
            .clone()
            .or_else(|| resp.message.clone())
            .unwrap_or_default()
    };
    match resp.status.as_deref() {
        Some("ERROR") if detail().to_lowercase().contains("exceeded") => Err(DataError::RateLimited {
            provider: NAME.into(),
            retry_after_secs: None,
        }),
        Some("NOT_AUTHORIZED") | Some("ERROR") => Err(DataError::SourceUnavailable {
            provider: NAME.into(),
            reason: detail(),
        }),
        Some("NOT_FOUND") => Err(DataError::InvalidSymbol {
            provider: NAME.into(),
            symbol: symbol.to_string(),
        }),
        _ => Ok(()),
    }
}

fn agg_date(ms: i64) -> Result<NaiveDate, DataError> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc().date())
        .ok_or_else(|| DataError::InvalidData(format!("{NAME}: invalid timestamp {ms}")))
}

fn to_rows(aggs: Vec<Agg>) -> Result<Vec<RawRow>, DataError> {
    let mut rows = aggs
        .into_iter()
        .map(|a| {
            Ok(RawRow {
                date: agg_date(a.t)?,
                open: a.o.unwrap_or(f64::NAN),
                high: a.h.unwrap_or(f64::NAN),
                low: a.l.unwrap_or(f64::NAN),
                close: a.c.unwrap_or(f64::NAN),
                volume: a.v.unwrap_or(f64::NAN),
            })
        })
        .collect::<Result<Vec<_>, DataError>>()?;
    rows.sort_by_key(|r| r.date);
    Ok(rows)
}

impl SourceAdapter for PolygonAdapter {
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
        let timespan = match interval {
            Interval::Daily => "day",
            Interval::Weekly => "week",
        };
        let path = format!("/v2/aggs/ticker/{symbol}/range/1/{timespan}/{start}/{end}");
        let resp = self.aggs(
            symbol,
            &path,
            &[("adjusted", "true"), ("sort", "asc"), ("limit", "50000")],
        )?;
        to_rows(resp.results)
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn real_time_quote(&self, symbol: &str) -> Result<Quote, DataError> {
        let path = format!("/v2/aggs/ticker/{symbol}/prev");
        let resp = self.aggs(symbol, &path, &[("adjusted", "true")])?;
        let prev = resp.results.into_iter().next().ok_or_else(|| DataError::InvalidSymbol {
            provider: NAME.into(),
            symbol: symbol.to_string(),
        })?;
        let price = prev
            .c
            .ok_or_else(|| DataError::InvalidData(format!("{NAME}: previous bar has no close")))?;
        let mut quote = Quote {
            symbol: symbol.to_string(),
            source: NAME.into(),
            price,
            previous_close: prev.o,
            change_percent: None,
            volume: prev.v,
            as_of: DateTime::from_timestamp_millis(prev.t).map(|dt| dt.naive_utc()),
        };
        quote.change_percent = quote.derived_change_percent();
        Ok(quote)
    }

    fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, DataError> {
        let url = format!("{BASE_URL}/v3/reference/tickers/{symbol}");
        let resp: TickerResponse = http::get_json(
            &self.client,
            NAME,
            symbol,
            &url,
            &[("apiKey", self.api_key.as_str())],
        )?;
        let details = resp.results.ok_or_else(|| DataError::InvalidSymbol {
            provider: NAME.into(),
            symbol: symbol.to_string(),
        })?;
        Ok(InstrumentInfo {
            symbol: symbol.to_string(),
            source: NAME.into(),
            name: details.name,
            exchange: details.primary_exchange,
            currency: details.currency_name.map(|c| c.to_uppercase()),
            instrument_type: details.kind,
            sector: details.sic_description,
            market_cap: details.market_cap,
        })
    }
}
