//! Engine configuration.
//!
//! Every recognized option is an explicit field with a default. A config is
//! loaded from TOML (any table or key may be omitted) and must pass
//! [`EngineConfig::validate`] before an engine accepts it.

use crate::domain::{Interval, Period};
use crate::market::MarketHours;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Static limits for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base number of in-flight requests.
    pub max_concurrent: usize,
    /// Starting (and floor) delay between dispatches.
    pub base_delay_ms: u64,
    /// Symbols per chunk when batch fetching.
    pub batch_size: usize,
    /// Lower number = consulted earlier in batch fetches.
    pub priority: u32,
}

impl ProviderSettings {
    /// Built-in limits for the bundled adapters.
    pub fn builtin(name: &str) -> Self {
        match name {
            "yfinance" => Self {
                max_concurrent: 15,
                base_delay_ms: 50,
                batch_size: 20,
                priority: 1,
            },
            "polygon" => Self {
                max_concurrent: 3,
                base_delay_ms: 200,
                batch_size: 10,
                priority: 2,
            },
            "alpha_vantage" => Self {
                max_concurrent: 1,
                base_delay_ms: 1000,
                batch_size: 5,
                priority: 3,
            },
            _ => Self {
                max_concurrent: 5,
                base_delay_ms: 100,
                batch_size: 10,
                priority: 5,
            },
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Adaptive delay tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateSettings {
    pub max_delay_ms: u64,
    /// Multiplier applied on a rate-limit failure.
    pub backoff_factor: f64,
    /// Multiplier applied every `recovery_every` consecutive successes.
    pub recovery_factor: f64,
    pub recovery_every: u32,
    /// Rolling success rate above which the delay snaps back to base.
    pub reset_success_rate: f64,
    pub reset_min_samples: usize,
    /// Number of recent calls kept for the rolling success rate.
    pub history_window: usize,
    /// Longest provider `Retry-After` hint the throttle will wait out.
    pub max_retry_after_secs: u64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            max_delay_ms: 2_000,
            backoff_factor: 1.5,
            recovery_factor: 0.9,
            recovery_every: 10,
            reset_success_rate: 0.95,
            reset_min_samples: 20,
            history_window: 100,
            max_retry_after_secs: 60,
        }
    }
}

impl RateSettings {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }
}

/// Adaptive concurrency tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    pub min: usize,
    pub max: usize,
    pub high_water: f64,
    pub low_water: f64,
    pub factor: f64,
    /// Calls observed before any scaling decision is made.
    pub min_samples: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            min: 1,
            max: 20,
            high_water: 0.9,
            low_water: 0.7,
            factor: 1.2,
            min_samples: 5,
        }
    }
}

/// Retry budget for one logical fetch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Scale each backoff by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Backoff before attempt `attempt` (1-based): `base * 2^(attempt-2)`,
    /// zero before the first attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exp))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Symbols warmed per warming pass, taken from the front of the list.
    pub warm_top_n: usize,
    /// Hours of the day (0-23) during which warming is allowed.
    pub low_traffic_hours: Vec<u32>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            warm_top_n: 20,
            low_traffic_hours: vec![2, 3, 4, 5, 6, 22, 23],
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    /// Composite score a dataset needs to be used at all.
    pub min_composite: f64,
    /// Composite score below which a usable dataset is logged as weak.
    pub warn_composite: f64,
    pub min_data_points: usize,
    pub anomaly_z: f64,
    /// Absolute day-over-day close change reported as suspicious.
    pub max_price_change: f64,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            min_composite: 0.5,
            warn_composite: 0.7,
            min_data_points: 10,
            anomaly_z: 3.0,
            max_price_change: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Write merged datasets back to the store.
    pub persist: bool,
    /// Only weekdays count as expected dates.
    pub weekdays_only: bool,
    /// Fetch from different providers on parallel workers.
    pub parallel_providers: bool,
    /// Skip fetching for a provider whose stored rows were updated this recently.
    pub fresh_within_days: Option<u32>,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            persist: true,
            weekdays_only: false,
            parallel_providers: true,
            fresh_within_days: None,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Candidate providers, in the order used for fingerprints and warming.
    pub sources: Vec<String>,
    pub interval: Interval,
    pub period: Period,
    /// Overrides for [`ProviderSettings::builtin`].
    pub providers: BTreeMap<String, ProviderSettings>,
    pub rate: RateSettings,
    pub concurrency: ConcurrencySettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub market_hours: MarketHours,
    pub quality: QualitySettings,
    pub reconcile: ReconcileSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                "yfinance".to_string(),
                "polygon".to_string(),
                "alpha_vantage".to_string(),
            ],
            interval: Interval::Daily,
            period: Period::SixMonths,
            providers: BTreeMap::new(),
            rate: RateSettings::default(),
            concurrency: ConcurrencySettings::default(),
            retry: RetrySettings::default(),
            cache: CacheSettings::default(),
            market_hours: MarketHours::default(),
            quality: QualitySettings::default(),
            reconcile: ReconcileSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Effective limits for a provider: explicit override, else built-in.
    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.providers
            .get(name)
            .copied()
            .unwrap_or_else(|| ProviderSettings::builtin(name))
    }

    /// Configured sources sorted by ascending priority (stable for ties).
    pub fn sources_by_priority(&self) -> Vec<String> {
        let mut sources = self.sources.clone();
        sources.sort_by_key(|s| self.provider(s).priority);
        sources
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.sources.is_empty() {
            return invalid("at least one source is required".into());
        }
        let mut seen = HashSet::new();
        for s in &self.sources {
            if s.trim().is_empty() {
                return invalid("source names must not be empty".into());
            }
            if !seen.insert(s.as_str()) {
                return invalid(format!("duplicate source '{s}'"));
            }
        }
        for (name, p) in &self.providers {
            if p.max_concurrent == 0 {
                return invalid(format!("providers.{name}.max_concurrent must be >= 1"));
            }
            if p.batch_size == 0 {
                return invalid(format!("providers.{name}.batch_size must be >= 1"));
            }
            if p.base_delay_ms > self.rate.max_delay_ms {
                return invalid(format!(
                    "providers.{name}.base_delay_ms exceeds rate.max_delay_ms"
                ));
            }
        }

        let r = &self.rate;
        if r.backoff_factor <= 1.0 {
            return invalid("rate.backoff_factor must be > 1".into());
        }
        if !(r.recovery_factor > 0.0 && r.recovery_factor <= 1.0) {
            return invalid("rate.recovery_factor must be in (0, 1]".into());
        }
        if r.recovery_every == 0 {
            return invalid("rate.recovery_every must be >= 1".into());
        }
        if !in_unit(r.reset_success_rate) {
            return invalid("rate.reset_success_rate must be in [0, 1]".into());
        }
        if r.history_window == 0 || r.reset_min_samples > r.history_window {
            return invalid("rate.history_window must be >= rate.reset_min_samples and > 0".into());
        }

        let c = &self.concurrency;
        if c.min == 0 {
            return invalid("concurrency.min must be >= 1".into());
        }
        if c.min > c.max {
            return invalid("concurrency.min must not exceed concurrency.max".into());
        }
        if !in_unit(c.high_water) || !in_unit(c.low_water) || c.low_water >= c.high_water {
            return invalid("concurrency watermarks must satisfy 0 <= low < high <= 1".into());
        }
        if c.factor < 1.0 {
            return invalid("concurrency.factor must be >= 1".into());
        }

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be >= 1".into());
        }

        if self.cache.ttl_secs == 0 {
            return invalid("cache.ttl_secs must be > 0".into());
        }
        if let Some(h) = self.cache.low_traffic_hours.iter().find(|h| **h > 23) {
            return invalid(format!("cache.low_traffic_hours contains invalid hour {h}"));
        }

        if self.market_hours.open >= self.market_hours.close {
            return invalid("market_hours.open must be before market_hours.close".into());
        }

        let q = &self.quality;
        if !in_unit(q.min_composite) || !in_unit(q.warn_composite) {
            return invalid("quality thresholds must be in [0, 1]".into());
        }
        if q.anomaly_z <= 0.0 {
            return invalid("quality.anomaly_z must be > 0".into());
        }
        if q.max_price_change <= 0.0 {
            return invalid("quality.max_price_change must be > 0".into());
        }

        Ok(())
    }
}

fn in_unit(x: f64) -> bool {
    (0.0..=1.0).contains(&x)
}
