//! Yahoo Finance adapter over the v8 chart API.
//!
//! Yahoo has no official API and changes its format without notice. Sub-range
//! requests are supported; quote and instrument info come from the chart
//! metadata block.

use crate::data::http;
use crate::data::provider::{DataError, InstrumentInfo, Quote, RawRow, SourceAdapter};
use crate::domain::Interval;
use chrono::{DateTime, NaiveDate};
use reqwest::blocking::Client;
use serde::Deserialize;

pub const NAME: &str = "yfinance";
const CHART_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Option<Indicators>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    currency: Option<String>,
    exchange_name: Option<String>,
    instrument_type: Option<String>,
    long_name: Option<String>,
    short_name: Option<String>,
    regular_market_price: Option<f64>,
    chart_previous_close: Option<f64>,
    regular_market_volume: Option<f64>,
    regular_market_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

pub struct YahooAdapter {
    client: Client,
}

impl YahooAdapter {
    pub fn new() -> Result<Self, DataError> {
        Ok(Self {
            client: http::client(NAME)?,
        })
    }

    fn chart(&self, symbol: &str, query: &[(&str, &str)]) -> Result<ChartData, DataError> {
        let url = format!("{CHART_URL}/{symbol}");
        let resp: ChartResponse = http::get_json(&self.client, NAME, symbol, &url, query)?;
        first_result(symbol, resp)
    }
}

fn bad_format(what: impl Into<String>) -> DataError {
    DataError::InvalidData(format!("{NAME}: {}", what.into()))
}

fn first_result(symbol: &str, resp: ChartResponse) -> Result<ChartData, DataError> {
    let results = match (resp.chart.result, resp.chart.error) {
        (_, Some(err)) if err.code == "Not Found" => {
            return Err(DataError::InvalidSymbol {
                provider: NAME.into(),
                symbol: symbol.to_string(),
            })
        }
        (_, Some(err)) => return Err(bad_format(format!("{}: {}", err.code, err.description))),
        (Some(results), None) => results,
        (None, None) => return Err(bad_format("empty result with no error")),
    };
    results
        .into_iter()
        .next()
        .ok_or_else(|| bad_format("result array is empty"))
}

fn parse_rows(data: ChartData) -> Result<Vec<RawRow>, DataError> {
    // No timestamps means no sessions in the requested range.
    let Some(timestamps) = data.timestamp else {
        return Ok(Vec::new());
    };
    let quote = data
        .indicators
        .and_then(|i| i.quote.into_iter().next())
        .ok_or_else(|| bad_format("no quote data"))?;

    let cell = |col: &[Option<f64>], i: usize| col.get(i).copied().flatten();
    let mut rows = Vec::with_capacity(timestamps.len());

    for (i, &ts) in timestamps.iter().enumerate() {
        let date = DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.naive_utc().date())
            .ok_or_else(|| bad_format(format!("invalid timestamp: {ts}")))?;

        let open = cell(&quote.open, i);
        let high = cell(&quote.high, i);
        let low = cell(&quote.low, i);
        let close = cell(&quote.close, i);
        let volume = cell(&quote.volume, i);
        if [open, high, low, close, volume].iter().all(Option::is_none) {
            continue;
        }

        rows.push(RawRow {
            date,
            open: open.unwrap_or(f64::NAN),
            high: high.unwrap_or(f64::NAN),
            low: low.unwrap_or(f64::NAN),
            close: close.unwrap_or(f64::NAN),
            volume: volume.unwrap_or(f64::NAN),
        });
    }

    rows.sort_by_key(|r| r.date);
    Ok(rows)
}

fn yahoo_interval(interval: Interval) -> &'static str {
    match interval {
        Interval::Daily => "1d",
        Interval::Weekly => "1wk",
    }
}

impl SourceAdapter for YahooAdapter {
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
        let period1 = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        let period2 = end
            .succ_opt()
            .unwrap_or(end)
            .and_time(chrono::NaiveTime::MIN)
            .and_utc()
            .timestamp();
        let (p1, p2) = (period1.to_string(), period2.to_string());
        let data = self.chart(
            symbol,
            &[
                ("period1", p1.as_str()),
                ("period2", p2.as_str()),
                ("interval", yahoo_interval(interval)),
                ("includeAdjustedClose", "true"),
            ],
        )?;
        let rows = parse_rows(data)?;
        Ok(rows
            .into_iter()
            .filter(|r| r.date >= start && r.date <= end)
            .collect())
    }

    fn real_time_quote(&self, symbol: &str) -> Result<Quote, DataError> {
        let data = self.chart(symbol, &[("range", "1d"), ("interval", "1d")])?;
        let meta = data.meta.unwrap_or_default();
        let price = meta
            .regular_market_price
            .ok_or_else(|| bad_format("quote has no regularMarketPrice"))?;
        let mut quote = Quote {
            symbol: symbol.to_string(),
            source: NAME.into(),
            price,
            previous_close: meta.chart_previous_close,
            change_percent: None,
            volume: meta.regular_market_volume,
            as_of: meta
                .regular_market_time
                .and_then(|t| DateTime::from_timestamp(t, 0))
                .map(|dt| dt.naive_utc()),
        };
        quote.change_percent = quote.derived_change_percent();
        Ok(quote)
    }

    fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, DataError> {
        let data = self.chart(symbol, &[("range", "1d"), ("interval", "1d")])?;
        let meta = data.meta.unwrap_or_default();
        Ok(InstrumentInfo {
            symbol: symbol.to_string(),
            source: NAME.into(),
            name: meta.long_name.or(meta.short_name),
            exchange: meta.exchange_name,
            currency: meta.currency,
            instrument_type: meta.instrument_type,
            ..InstrumentInfo::default()
        })
    }
}
