//! Shared HTTP plumbing for the bundled adapters: client construction and
//! mapping vendor status codes onto the error taxonomy.

use super::provider::DataError;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn client(provider: &str) -> Result<Client, DataError> {
    Client::builder()
        .timeout(TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| DataError::SourceUnavailable {
            provider: provider.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })
}

/// Error for a non-success status, `None` when the status is fine.
pub(crate) fn status_error(
    provider: &str,
    symbol: &str,
    status: StatusCode,
    retry_after: Option<&str>,
) -> Option<DataError> {
    if status.is_success() {
        return None;
    }
    let provider = provider.to_string();
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => DataError::RateLimited {
            provider,
            retry_after_secs: retry_after.and_then(parse_retry_after),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DataError::SourceUnavailable {
            provider,
            reason: format!("HTTP {status}: not authorized"),
        },
        StatusCode::NOT_FOUND => DataError::InvalidSymbol {
            provider,
            symbol: symbol.to_string(),
        },
        _ => DataError::SourceUnavailable {
            provider,
            reason: format!("HTTP {status} for {symbol}"),
        },
    })
}

/// `Retry-After` as whole seconds. HTTP-date forms are ignored.
pub(crate) fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

/// GET `url` with `query` and decode the JSON body.
pub(crate) fn get_json<T: DeserializeOwned>(
    client: &Client,
    provider: &str,
    symbol: &str,
    url: &str,
    query: &[(&str, &str)],
) -> Result<T, DataError> {
    let resp = client
        .get(url)
        .query(query)
        .send()
        .map_err(|e| DataError::SourceUnavailable {
            provider: provider.to_string(),
            reason: if e.is_timeout() {
                format!("request timed out: {e}")
            } else {
                e.to_string()
            },
        })?;

    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if let Some(e) = status_error(provider, symbol, resp.status(), retry_after.as_deref()) {
        return Err(e);
    }

    resp.json().map_err(|e| {
        DataError::InvalidData(format!("{provider}: failed to decode response for {symbol}: {e}"))
    })
}

/// Parse a numeric field that the vendor sends as a string.
pub(crate) fn parse_number(provider: &str, field: &str, raw: &str) -> Result<f64, DataError> {
    let value: f64 = raw.trim().parse().map_err(|_| {
        DataError::InvalidData(format!("{provider}: {field} is not numeric: '{raw}'"))
    })?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DataError::InvalidData(format!("{provider}: {field} is not finite: '{raw}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_not_an_error() {
        assert!(status_error("p", "X", StatusCode::OK, None).is_none());
    }

    #[test]
    fn too_many_requests_is_rate_limit_with_hint() {
        let e = status_error("p", "X", StatusCode::TOO_MANY_REQUESTS, Some("30")).unwrap();
        assert_eq!(
            e,
            DataError::RateLimited {
                provider: "p".into(),
                retry_after_secs: Some(30)
            }
        );
        let e = status_error("p", "X", StatusCode::TOO_MANY_REQUESTS, Some("Wed, 21 Oct 2015")).unwrap();
        assert!(matches!(e, DataError::RateLimited { retry_after_secs: None, .. }));
    }

    #[test]
    fn auth_and_not_found() {
        assert!(matches!(
            status_error("p", "X", StatusCode::FORBIDDEN, None),
            Some(DataError::SourceUnavailable { .. })
        ));
        assert!(matches!(
            status_error("p", "ZZZZ", StatusCode::NOT_FOUND, None),
            Some(DataError::InvalidSymbol { symbol, .. }) if symbol == "ZZZZ"
        ));
        assert!(matches!(
            status_error("p", "X", StatusCode::BAD_GATEWAY, None),
            Some(DataError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn numbers_must_parse() {
        assert_eq!(parse_number("p", "open", " 12.5 ").unwrap(), 12.5);
        assert!(matches!(
            parse_number("p", "open", "n/a"),
            Err(DataError::InvalidData(_))
        ));
        assert!(parse_number("p", "open", "inf").is_err());
    }
}
