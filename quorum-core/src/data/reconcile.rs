//! Incremental reconciliation of stored history against provider deltas.
//!
//! For each candidate provider: load what the store already holds, work out
//! which slots of the window are missing, fetch only that range (or the whole
//! window for adapters that cannot serve sub-ranges), merge, persist and
//! score. The best dataset that passes validation is selected.

use super::canonicalize::{coverage, merge, normalize};
use super::provider::{DataError, SourceAdapter};
use super::quality::{QualityAnalyzer, QualityReport};
use super::rate_control::RateController;
use super::store::BarStore;
use crate::clock::Clock;
use crate::config::{QualitySettings, ReconcileSettings};
use crate::domain::{Bar, DateWindow, Interval};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registered adapters by provider name.
pub type AdapterMap = BTreeMap<String, Arc<dyn SourceAdapter>>;

const COMPLETENESS_WEIGHT: f64 = 0.7;
const RECENCY_WEIGHT: f64 = 0.3;

/// What happened to one provider during a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Stored rows already covered the window; nothing fetched.
    Complete,
    /// Stored rows were recent enough to skip the fetch.
    Fresh,
    /// New rows were fetched and merged.
    Fetched,
    /// The fetch succeeded but returned nothing new.
    Empty,
    /// The provider throttled us; stored rows only.
    RateLimited,
    /// The fetch failed; stored rows only.
    Failed,
}

/// Per-provider result of a reconciliation.
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub provider: String,
    pub status: ProviderStatus,
    /// Stored bars inside the window before fetching.
    pub existing: usize,
    /// Bars returned by the adapter (after normalization).
    pub fetched: usize,
    /// Completion of the window before fetching.
    pub completion: f64,
    /// Merged bars inside the window, ascending.
    pub bars: Vec<Bar>,
    /// `0.7 × completeness + 0.3 × recency` of `bars`.
    pub score: f64,
    pub quality: QualityReport,
    /// Why the fetch did not contribute, if it didn't.
    pub error: Option<DataError>,
    /// Why the dataset is not eligible for selection.
    pub rejection: Option<DataError>,
}

impl ProviderOutcome {
    pub fn is_usable(&self) -> bool {
        self.rejection.is_none() && !self.bars.is_empty()
    }
}

/// Every provider's outcome plus the selected one.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub symbol: String,
    pub interval: Interval,
    pub window: DateWindow,
    /// In processing order: richest stored coverage first.
    pub outcomes: Vec<ProviderOutcome>,
    pub selected: Option<String>,
}

impl Reconciliation {
    pub fn outcome(&self, provider: &str) -> Option<&ProviderOutcome> {
        self.outcomes.iter().find(|o| o.provider == provider)
    }

    pub fn selected_outcome(&self) -> Option<&ProviderOutcome> {
        self.selected.as_deref().and_then(|p| self.outcome(p))
    }

    /// Datasets that passed validation, in processing order.
    pub fn usable(&self) -> impl Iterator<Item = &ProviderOutcome> {
        self.outcomes.iter().filter(|o| o.is_usable())
    }

    /// The selected outcome, or `NoDataAvailable`.
    pub fn into_selected(self) -> Result<ProviderOutcome, DataError> {
        let Reconciliation {
            symbol,
            outcomes,
            selected,
            ..
        } = self;
        selected
            .and_then(|p| outcomes.into_iter().find(|o| o.provider == p))
            .ok_or(DataError::NoDataAvailable { symbol })
    }
}

struct Plan {
    provider: String,
    stored: Vec<Bar>,
    existing: usize,
    completion: f64,
    missing: Option<(chrono::NaiveDate, chrono::NaiveDate)>,
}

/// Borrowed view over the engine's collaborators for one reconciliation.
pub struct Reconciler<'a> {
    store: &'a dyn BarStore,
    adapters: &'a AdapterMap,
    rates: &'a RateController,
    analyzer: QualityAnalyzer,
    clock: &'a dyn Clock,
    settings: ReconcileSettings,
    quality: QualitySettings,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a dyn BarStore,
        adapters: &'a AdapterMap,
        rates: &'a RateController,
        clock: &'a dyn Clock,
        settings: ReconcileSettings,
        quality: QualitySettings,
    ) -> Self {
        Self {
            store,
            adapters,
            rates,
            analyzer: QualityAnalyzer::new(&quality),
            clock,
            settings,
            quality,
        }
    }

    /// Reconcile `symbol` over `window` across `sources`.
    ///
    /// Per-provider failures never escape; they are recorded on the outcome.
    pub fn reconcile(
        &self,
        symbol: &str,
        interval: Interval,
        window: DateWindow,
        sources: &[String],
    ) -> Reconciliation {
        let mut plans: Vec<Plan> = sources
            .iter()
            .map(|p| self.plan(symbol, p, interval, window))
            .collect();
        // Richest coverage first; stable so configured order breaks ties.
        plans.sort_by(|a, b| b.completion.total_cmp(&a.completion));

        let outcomes: Vec<ProviderOutcome> = if self.settings.parallel_providers {
            plans
                .into_par_iter()
                .map(|plan| self.process(symbol, interval, window, plan))
                .collect()
        } else {
            plans
                .into_iter()
                .map(|plan| self.process(symbol, interval, window, plan))
                .collect()
        };

        let selected = select(&outcomes).map(|o| o.provider.clone());
        match &selected {
            Some(provider) => info!(symbol, provider = %provider, "dataset selected"),
            None => warn!(symbol, providers = outcomes.len(), "no provider yielded a usable dataset"),
        }

        Reconciliation {
            symbol: symbol.to_string(),
            interval,
            window,
            outcomes,
            selected,
        }
    }

    fn plan(&self, symbol: &str, provider: &str, interval: Interval, window: DateWindow) -> Plan {
        let stored = self.store.load_rows(symbol, provider).unwrap_or_else(|e| {
            warn!(symbol, provider, error = %e, "store load failed, treating as empty");
            Vec::new()
        });
        let in_window: Vec<Bar> = stored
            .iter()
            .filter(|b| window.covers(interval, b.date))
            .cloned()
            .collect();
        let cov = coverage(&in_window, window, interval, self.settings.weekdays_only);
        debug!(
            symbol,
            provider,
            existing = in_window.len(),
            missing = cov.missing.len(),
            completion = cov.completion(),
            "coverage computed"
        );

        Plan {
            provider: provider.to_string(),
            existing: in_window.len(),
            completion: cov.completion(),
            missing: cov.missing_range(interval),
            stored,
        }
    }

    fn process(&self, symbol: &str, interval: Interval, window: DateWindow, plan: Plan) -> ProviderOutcome {
        let Plan {
            provider,
            stored,
            existing,
            completion,
            missing,
        } = plan;

        let (status, fetched, error) = match missing {
            None => (ProviderStatus::Complete, Vec::new(), None),
            Some(range) => self.fetch_missing(symbol, &provider, interval, window, range),
        };

        let merged = if fetched.is_empty() {
            stored
        } else {
            let outcome = merge(&stored, &fetched);
            if outcome.fell_back {
                warn!(symbol, provider = %provider, "merge lost rows, keeping stored data");
            } else if self.settings.persist {
                if let Err(e) = self.store.store_rows(symbol, &provider, &outcome.bars) {
                    warn!(symbol, provider = %provider, error = %e, "persisting merged rows failed");
                }
            }
            outcome.bars
        };

        let bars: Vec<Bar> = merged
            .into_iter()
            .filter(|b| window.covers(interval, b.date))
            .collect();
        let score = self.score(&bars, interval, window);
        let quality = self.analyzer.analyze(symbol, interval, &bars);
        let rejection = self.validate(symbol, &bars, &quality);

        if quality.composite_score < self.quality.warn_composite && !bars.is_empty() {
            warn!(
                symbol,
                provider = %provider,
                composite = quality.composite_score,
                "low dataset quality"
            );
        }

        ProviderOutcome {
            provider,
            status,
            existing,
            fetched: fetched.len(),
            completion,
            bars,
            score,
            quality,
            error,
            rejection,
        }
    }

    fn fetch_missing(
        &self,
        symbol: &str,
        provider: &str,
        interval: Interval,
        window: DateWindow,
        (from, to): (chrono::NaiveDate, chrono::NaiveDate),
    ) -> (ProviderStatus, Vec<Bar>, Option<DataError>) {
        if let Some(days) = self.settings.fresh_within_days {
            if let Ok(true) = self.store.is_fresh(symbol, provider, days, self.clock.now()) {
                debug!(symbol, provider, days, "stored data is fresh, skipping fetch");
                return (ProviderStatus::Fresh, Vec::new(), None);
            }
        }

        let Some(adapter) = self.adapters.get(provider) else {
            let e = DataError::UnknownSource(provider.to_string());
            warn!(symbol, provider, "no adapter registered");
            return (ProviderStatus::Failed, Vec::new(), Some(e));
        };
        if !adapter.is_available() {
            let e = DataError::SourceUnavailable {
                provider: provider.to_string(),
                reason: "adapter reports unavailable".into(),
            };
            return (ProviderStatus::Failed, Vec::new(), Some(e));
        }

        // Weekly bars are keyed by Monday, which can precede the window start.
        let first_slot = interval.slot(window.start);
        let (start, end) = if adapter.supports_partial() {
            (from.max(first_slot), to.min(window.end))
        } else {
            (first_slot, window.end)
        };
        info!(symbol, provider, %start, %end, "fetching missing range");

        let result = self
            .rates
            .execute(provider, || adapter.fetch_raw(symbol, interval, start, end))
            .and_then(|rows| normalize(symbol, provider, rows, self.clock.now()));

        match result {
            Ok(bars) if bars.is_empty() => {
                info!(symbol, provider, "provider returned no new rows");
                (ProviderStatus::Empty, bars, None)
            }
            Ok(bars) => {
                info!(symbol, provider, rows = bars.len(), "fetched rows");
                (ProviderStatus::Fetched, bars, None)
            }
            Err(e) if e.is_rate_limit() => {
                warn!(
                    symbol,
                    provider,
                    delay_ms = self.rates.current_delay(provider).as_millis() as u64,
                    "rate limited, using stored rows only"
                );
                (ProviderStatus::RateLimited, Vec::new(), Some(e))
            }
            Err(e) => {
                warn!(symbol, provider, error = %e, "fetch failed, using stored rows only");
                (ProviderStatus::Failed, Vec::new(), Some(e))
            }
        }
    }

    fn score(&self, bars: &[Bar], interval: Interval, window: DateWindow) -> f64 {
        let Some(last) = bars.last() else {
            return 0.0;
        };
        let completeness = coverage(bars, window, interval, self.settings.weekdays_only).completion();
        let recency = if interval.slot(last.date) >= interval.slot(window.end) {
            1.0
        } else {
            0.5
        };
        completeness * COMPLETENESS_WEIGHT + recency * RECENCY_WEIGHT
    }

    fn validate(&self, symbol: &str, bars: &[Bar], quality: &QualityReport) -> Option<DataError> {
        if bars.is_empty() {
            return Some(DataError::NoDataAvailable {
                symbol: symbol.to_string(),
            });
        }
        if bars.len() < self.quality.min_data_points {
            return Some(DataError::InsufficientHistory {
                symbol: symbol.to_string(),
                found: bars.len(),
                required: self.quality.min_data_points,
            });
        }
        if quality.composite_score < self.quality.min_composite {
            return Some(DataError::InvalidData(format!(
                "composite score {:.3} below {:.2}",
                quality.composite_score, self.quality.min_composite
            )));
        }
        None
    }
}

/// Highest score among usable outcomes; earlier outcomes win ties.
fn select(outcomes: &[ProviderOutcome]) -> Option<&ProviderOutcome> {
    outcomes
        .iter()
        .filter(|o| o.is_usable())
        .fold(None, |best: Option<&ProviderOutcome>, o| match best {
            Some(b) if b.score >= o.score => Some(b),
            _ => Some(o),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EngineConfig, ProviderSettings, RetrySettings};
    use crate::data::provider::RawRow;
    use crate::data::store::MemoryStore;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::Mutex;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn now() -> NaiveDateTime {
        d(20).and_hms_opt(12, 0, 0).unwrap()
    }

    fn window() -> DateWindow {
        DateWindow::new(d(1), d(12)).unwrap()
    }

    fn stored(source: &str, day: u32) -> Bar {
        let close = 100.0 + day as f64;
        Bar {
            symbol: "AAPL".into(),
            source: source.into(),
            date: d(day),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_000.0,
            updated_at: d(1).and_hms_opt(0, 0, 0).unwrap(),
        }
    }

    fn raw(day: u32) -> RawRow {
        let close = 100.0 + day as f64;
        RawRow {
            date: d(day),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 2_000.0,
        }
    }

    struct Scripted {
        name: String,
        partial: bool,
        rows: Vec<RawRow>,
        error: Option<DataError>,
        calls: Mutex<Vec<(NaiveDate, NaiveDate)>>,
    }

    impl Scripted {
        fn serving(name: &str, days: impl IntoIterator<Item = u32>) -> Self {
            Self {
                name: name.into(),
                partial: true,
                rows: days.into_iter().map(raw).collect(),
                error: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(name: &str, error: DataError) -> Self {
            Self {
                error: Some(error),
                ..Self::serving(name, [])
            }
        }

        fn calls(&self) -> Vec<(NaiveDate, NaiveDate)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SourceAdapter for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch_raw(
            &self,
            _symbol: &str,
            _interval: Interval,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<Vec<RawRow>, DataError> {
            self.calls.lock().unwrap().push((start, end));
            if let Some(e) = &self.error {
                return Err(e.clone());
            }
            Ok(self
                .rows
                .iter()
                .filter(|r| r.date >= start && r.date <= end)
                .cloned()
                .collect())
        }

        fn supports_partial(&self) -> bool {
            self.partial
        }
    }

    struct Fixture {
        store: MemoryStore,
        adapters: AdapterMap,
        rates: RateController,
        clock: Arc<ManualClock>,
        config: EngineConfig,
    }

    impl Fixture {
        fn new(adapters: Vec<Arc<Scripted>>) -> Self {
            let mut config = EngineConfig {
                sources: adapters.iter().map(|a| a.name.clone()).collect(),
                ..EngineConfig::default()
            };
            for (i, a) in adapters.iter().enumerate() {
                config.providers.insert(
                    a.name.clone(),
                    ProviderSettings {
                        max_concurrent: 2,
                        base_delay_ms: 0,
                        batch_size: 10,
                        priority: i as u32 + 1,
                    },
                );
            }
            config.retry = RetrySettings {
                max_attempts: 1,
                base_delay_ms: 0,
                jitter: false,
            };
            let clock = Arc::new(ManualClock::new(now()));
            let rates = RateController::with_clock(&config, clock.clone());
            let adapters = adapters
                .into_iter()
                .map(|a| (a.name.clone(), a as Arc<dyn SourceAdapter>))
                .collect();
            Self {
                store: MemoryStore::new(),
                adapters,
                rates,
                clock,
                config,
            }
        }

        fn seed(&self, source: &str, days: impl IntoIterator<Item = u32>) {
            let bars: Vec<Bar> = days.into_iter().map(|day| stored(source, day)).collect();
            self.store.store_rows("AAPL", source, &bars).unwrap();
        }

        fn run(&self) -> Reconciliation {
            self.run_for(Interval::Daily, window())
        }

        fn run_for(&self, interval: Interval, window: DateWindow) -> Reconciliation {
            Reconciler::new(
                &self.store,
                &self.adapters,
                &self.rates,
                self.clock.as_ref(),
                self.config.reconcile,
                self.config.quality,
            )
            .reconcile("AAPL", interval, window, &self.config.sources)
        }
    }

    #[test]
    fn fills_single_missing_day_from_provider() {
        let yf = Arc::new(Scripted::serving("yfinance", 1..=12));
        let fx = Fixture::new(vec![yf.clone()]);
        fx.seed("yfinance", (1..=8).chain(10..=12));

        let rec = fx.run();
        assert_eq!(yf.calls(), vec![(d(9), d(9))]);

        let out = rec.into_selected().unwrap();
        assert_eq!(out.status, ProviderStatus::Fetched);
        assert_eq!(out.existing, 11);
        assert_eq!(out.fetched, 1);
        let dates: Vec<NaiveDate> = out.bars.iter().map(|b| b.date).collect();
        assert_eq!(dates, (1..=12).map(d).collect::<Vec<_>>());
        assert_eq!(out.bars[8].updated_at, now());
        assert_eq!(out.bars[8].volume, 2_000.0);
        assert!(out.bars.iter().filter(|b| b.date != d(9)).all(|b| b.volume == 1_000.0));
        assert!((out.score - 1.0).abs() < 1e-12);

        assert_eq!(fx.store.load_rows("AAPL", "yfinance").unwrap().len(), 12);
    }

    #[test]
    fn weekly_window_starting_mid_week_completes() {
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows: Vec<RawRow> = (0..13)
            .map(|w| {
                let close = 100.0 + w as f64;
                RawRow {
                    date: monday + chrono::Duration::weeks(w),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 5_000.0,
                }
            })
            .collect();
        let yf = Arc::new(Scripted {
            rows,
            ..Scripted::serving("yfinance", [])
        });
        let fx = Fixture::new(vec![yf.clone()]);
        // Wednesday to Wednesday
        let window = DateWindow::new(d(3), NaiveDate::from_ymd_opt(2024, 3, 27).unwrap()).unwrap();

        let first = fx.run_for(Interval::Weekly, window);
        assert_eq!(yf.calls()[0].0, monday);
        let out = first.outcome("yfinance").unwrap();
        assert_eq!(out.status, ProviderStatus::Fetched);
        assert_eq!(out.bars.len(), 13);
        assert_eq!(out.bars[0].date, monday);

        let second = fx.run_for(Interval::Weekly, window);
        assert_eq!(yf.calls().len(), 1);
        let out = second.outcome("yfinance").unwrap();
        assert_eq!(out.status, ProviderStatus::Complete);
        assert_eq!(out.existing, 13);
        assert_eq!(out.completion, 1.0);
        assert!((out.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn complete_coverage_skips_fetch() {
        let yf = Arc::new(Scripted::serving("yfinance", 1..=12));
        let fx = Fixture::new(vec![yf.clone()]);
        fx.seed("yfinance", 1..=12);

        let rec = fx.run();
        assert!(yf.calls().is_empty());
        assert_eq!(rec.outcomes[0].status, ProviderStatus::Complete);
        assert_eq!(rec.selected.as_deref(), Some("yfinance"));
    }

    #[test]
    fn non_partial_adapter_gets_full_window() {
        let mut av = Scripted::serving("alpha_vantage", 1..=12);
        av.partial = false;
        let av = Arc::new(av);
        let fx = Fixture::new(vec![av.clone()]);
        fx.seed("alpha_vantage", (1..=5).chain(7..=12));

        let rec = fx.run();
        assert_eq!(av.calls(), vec![(d(1), d(12))]);
        assert_eq!(rec.outcomes[0].bars.len(), 12);
    }

    #[test]
    fn failed_fetch_keeps_stored_rows() {
        let err = DataError::SourceUnavailable {
            provider: "polygon".into(),
            reason: "connection reset".into(),
        };
        let fx = Fixture::new(vec![Arc::new(Scripted::failing("polygon", err))]);
        fx.seed("polygon", (1..=8).chain(10..=12));

        let rec = fx.run();
        let out = rec.outcome("polygon").unwrap();
        assert_eq!(out.status, ProviderStatus::Failed);
        assert_eq!(out.bars.len(), 11);
        assert!(out.error.is_some());
        assert_eq!(rec.selected.as_deref(), Some("polygon"));
    }

    #[test]
    fn rate_limited_provider_contributes_stored_rows_only() {
        let err = DataError::RateLimited {
            provider: "yfinance".into(),
            retry_after_secs: None,
        };
        let fx = Fixture::new(vec![Arc::new(Scripted::failing("yfinance", err))]);
        fx.seed("yfinance", 1..=11);

        let rec = fx.run();
        let out = rec.outcome("yfinance").unwrap();
        assert_eq!(out.status, ProviderStatus::RateLimited);
        assert_eq!(out.bars.len(), 11);
        assert_eq!(fx.rates.stats("yfinance").unwrap().rate_limited_count, 1);
        assert!(fx.rates.current_delay("yfinance") > std::time::Duration::ZERO);
    }

    #[test]
    fn providers_ranked_by_stored_coverage() {
        let a = Arc::new(Scripted::serving("a", []));
        let b = Arc::new(Scripted::serving("b", []));
        let fx = Fixture::new(vec![a, b]);
        fx.seed("a", 1..=3);
        fx.seed("b", 1..=11);

        let rec = fx.run();
        let order: Vec<&str> = rec.outcomes.iter().map(|o| o.provider.as_str()).collect();
        assert_eq!(order, ["b", "a"]);
        assert_eq!(rec.outcomes[0].status, ProviderStatus::Empty);
    }

    #[test]
    fn highest_score_wins() {
        let full = Arc::new(Scripted::serving("full", 1..=12));
        let stale = Arc::new(Scripted::serving("stale", []));
        let fx = Fixture::new(vec![stale, full]);
        fx.seed("stale", 1..=11);

        let rec = fx.run();
        assert_eq!(rec.selected.as_deref(), Some("full"));
        let stale = rec.outcome("stale").unwrap();
        assert!(stale.is_usable());
        assert!(stale.score < rec.selected_outcome().unwrap().score);
    }

    #[test]
    fn too_little_history_is_rejected() {
        let fx = Fixture::new(vec![Arc::new(Scripted::serving("yfinance", 1..=4))]);

        let rec = fx.run();
        let out = rec.outcome("yfinance").unwrap();
        assert!(matches!(
            out.rejection,
            Some(DataError::InsufficientHistory { found: 4, required: 10, .. })
        ));
        assert!(matches!(
            rec.into_selected(),
            Err(DataError::NoDataAvailable { .. })
        ));
    }

    #[test]
    fn nothing_anywhere_is_no_data() {
        let fx = Fixture::new(vec![
            Arc::new(Scripted::serving("a", [])),
            Arc::new(Scripted::serving("b", [])),
        ]);
        let rec = fx.run();
        assert!(rec.selected.is_none());
        assert_eq!(rec.usable().count(), 0);
    }

    #[test]
    fn fresh_store_skips_fetch() {
        let yf = Arc::new(Scripted::serving("yfinance", 1..=12));
        let mut fx = Fixture::new(vec![yf.clone()]);
        fx.config.reconcile.fresh_within_days = Some(30);
        fx.seed("yfinance", 1..=11);

        let rec = fx.run();
        assert!(yf.calls().is_empty());
        assert_eq!(rec.outcomes[0].status, ProviderStatus::Fresh);
    }

    #[test]
    fn sequential_mode_matches_parallel() {
        let yf = Arc::new(Scripted::serving("yfinance", 1..=12));
        let mut fx = Fixture::new(vec![yf]);
        fx.config.reconcile.parallel_providers = false;
        fx.seed("yfinance", 2..=12);

        let out = fx.run().into_selected().unwrap();
        assert_eq!(out.bars.len(), 12);
    }
}
