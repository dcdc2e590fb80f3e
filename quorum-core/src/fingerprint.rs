//! Request fingerprinting: deterministic cache keys for bar requests.
//!
//! A fingerprint identifies `(symbol, interval, period, ordered source list)`.
//! Source order is part of the identity: the same sources in a different
//! order can select a different provider, so they must not share an entry.

use crate::domain::{Interval, Period};
use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 hex digest of a canonical request description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn new(symbol: &str, interval: Interval, period: Period, sources: &[String]) -> Self {
        // Unit separator keeps "AB"+"C" distinct from "A"+"BC".
        let canonical = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            symbol.to_ascii_uppercase(),
            interval.as_str(),
            period.as_str(),
            sources.join("\u{1e}"),
        );
        Self::from_bytes(canonical.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for logs.
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// BLAKE3 digest over the serialized bars, used for store integrity sidecars.
pub fn dataset_hash<T: Serialize>(rows: &[T]) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(rows)?;
    Ok(blake3::hash(&json).to_hex().to_string())
}
