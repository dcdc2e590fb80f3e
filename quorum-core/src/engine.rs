//! The data engine: one instance owns its config, adapters, store, cache,
//! rate controller and clock. Nothing is process-global, so several engines
//! can run side by side (and tests stay isolated).

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::data::cache::{BarCache, CacheAnalytics, CachedDataset, WarmReport};
use crate::data::download::{run_batch, BatchProgress, BatchProvider, BatchSummary};
use crate::data::provider::{DataError, InstrumentInfo, Quote, SourceAdapter};
use crate::data::quality::{QualityAnalyzer, QualityReport};
use crate::data::rate_control::{RateController, SourceStats};
use crate::data::reconcile::{AdapterMap, Reconciler, Reconciliation};
use crate::data::store::BarStore;
use crate::domain::{Bar, DateWindow, Interval, Period};
use crate::fingerprint::RequestFingerprint;
use crate::market::MarketStatus;
use std::sync::Arc;
use tracing::{debug, info};

/// Bars handed back to a caller.
#[derive(Debug, Clone)]
pub struct EngineDataset {
    pub symbol: String,
    pub source: String,
    pub interval: Interval,
    pub period: Period,
    pub bars: Arc<Vec<Bar>>,
    pub composite_score: Option<f64>,
    /// Served from the cache without touching the reconciler.
    pub from_cache: bool,
}

pub struct DataEngine {
    config: EngineConfig,
    adapters: AdapterMap,
    store: Arc<dyn BarStore>,
    cache: BarCache,
    rates: RateController,
    analyzer: QualityAnalyzer,
    clock: Arc<dyn Clock>,
}

impl DataEngine {
    /// Build an engine on the system clock. Fails if `config` is invalid.
    pub fn new(config: EngineConfig, store: Arc<dyn BarStore>) -> Result<Self, ConfigError> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EngineConfig,
        store: Arc<dyn BarStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            cache: BarCache::new(&config.cache, config.market_hours, Arc::clone(&clock)),
            rates: RateController::with_clock(&config, Arc::clone(&clock)),
            analyzer: QualityAnalyzer::new(&config.quality),
            adapters: AdapterMap::new(),
            store,
            clock,
            config,
        })
    }

    /// Register (or replace) the adapter for its provider name.
    pub fn register_adapter(&mut self, adapter: Arc<dyn SourceAdapter>) {
        debug!(provider = adapter.name(), "adapter registered");
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register_adapter(adapter);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapter(&self, source: &str) -> Option<&Arc<dyn SourceAdapter>> {
        self.adapters.get(source)
    }

    pub fn store(&self) -> &dyn BarStore {
        self.store.as_ref()
    }

    pub fn rate_controller(&self) -> &RateController {
        &self.rates
    }

    pub fn analyzer(&self) -> &QualityAnalyzer {
        &self.analyzer
    }

    /// The window `period` covers, ending today.
    pub fn window(&self, period: Period) -> DateWindow {
        period.window_ending(self.clock.now().date())
    }

    /// Bars for `symbol` using the configured interval, period and sources.
    pub fn get_bars(&self, symbol: &str) -> Result<EngineDataset, DataError> {
        self.get_bars_for(symbol, self.config.interval, self.config.period, &self.config.sources)
    }

    /// Cache → reconciler → cache. Only `NoDataAvailable` escapes.
    pub fn get_bars_for(
        &self,
        symbol: &str,
        interval: Interval,
        period: Period,
        sources: &[String],
    ) -> Result<EngineDataset, DataError> {
        let symbol = symbol.trim().to_uppercase();
        let key = RequestFingerprint::new(&symbol, interval, period, sources);

        if self.config.cache.enabled {
            if let Some(hit) = self.cache.get(&key) {
                debug!(symbol = %symbol, fingerprint = %key, "cache hit");
                return Ok(dataset(hit, interval, period, true));
            }
        }

        let rec = self.reconcile(&symbol, interval, self.window(period), sources);
        let chosen = rec.into_selected()?;
        let cached = CachedDataset {
            symbol: symbol.clone(),
            source: chosen.provider,
            bars: Arc::new(chosen.bars),
            composite_score: Some(chosen.quality.composite_score),
        };
        if self.config.cache.enabled {
            self.cache.insert(key, cached.clone());
        }
        Ok(dataset(cached, interval, period, false))
    }

    /// Run the reconciler over `sources` and report every provider's outcome.
    pub fn reconcile(
        &self,
        symbol: &str,
        interval: Interval,
        window: DateWindow,
        sources: &[String],
    ) -> Reconciliation {
        Reconciler::new(
            self.store.as_ref(),
            &self.adapters,
            &self.rates,
            self.clock.as_ref(),
            self.config.reconcile,
            self.config.quality,
        )
        .reconcile(symbol, interval, window, sources)
    }

    /// Fetch many symbols, consulting providers in ascending priority.
    /// A satisfied symbol is cached under the single-provider request that
    /// produced it, so a later multi-provider request still reconciles.
    pub fn fetch_batch(&self, symbols: &[String], progress: &dyn BatchProgress) -> BatchSummary {
        let interval = self.config.interval;
        let period = self.config.period;
        let window = self.window(period);
        let providers: Vec<BatchProvider> = self
            .config
            .sources_by_priority()
            .into_iter()
            .map(|name| BatchProvider {
                batch_size: self.config.provider(&name).batch_size,
                name,
            })
            .collect();
        let symbols: Vec<String> = symbols.iter().map(|s| s.trim().to_uppercase()).collect();

        info!(symbols = symbols.len(), providers = providers.len(), "starting batch fetch");
        run_batch(
            &symbols,
            &providers,
            &self.rates,
            |symbol, provider| {
                let chosen = self
                    .reconcile(symbol, interval, window, &[provider.to_string()])
                    .into_selected()?;
                if self.config.cache.enabled {
                    let key = RequestFingerprint::new(symbol, interval, period, &[provider.to_string()]);
                    self.cache.insert(
                        key,
                        CachedDataset {
                            symbol: symbol.to_string(),
                            source: chosen.provider,
                            bars: Arc::new(chosen.bars),
                            composite_score: Some(chosen.quality.composite_score),
                        },
                    );
                }
                Ok(())
            },
            progress,
        )
    }

    /// Preload `symbols` (highest priority first) from the store if the
    /// current hour is a low-traffic hour.
    pub fn warm_cache(&self, symbols: &[String]) -> WarmReport {
        self.cache.warm(
            symbols,
            &self.config.sources,
            self.config.interval,
            self.config.period,
            self.store.as_ref(),
        )
    }

    /// True during a configured low-traffic hour.
    pub fn in_warming_window(&self) -> bool {
        self.cache.in_warming_window()
    }

    pub fn market_status(&self) -> MarketStatus {
        self.config.market_hours.status(self.clock.now())
    }

    pub fn source_statistics(&self) -> Vec<SourceStats> {
        self.rates.snapshot()
    }

    pub fn cache_analytics(&self) -> CacheAnalytics {
        self.cache.analytics()
    }

    /// Drop every cached request shape for `symbol`.
    pub fn invalidate_symbol(&self, symbol: &str) -> usize {
        self.cache.invalidate_symbol(&symbol.trim().to_uppercase())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn real_time_quote(&self, symbol: &str, source: &str) -> Result<Quote, DataError> {
        let adapter = self.require_adapter(source)?;
        self.rates.execute(source, || adapter.real_time_quote(symbol))
    }

    pub fn instrument_info(&self, symbol: &str, source: &str) -> Result<InstrumentInfo, DataError> {
        let adapter = self.require_adapter(source)?;
        self.rates.execute(source, || adapter.instrument_info(symbol))
    }

    /// Quality report over whatever the store holds for `(symbol, source)`
    /// inside the configured period.
    pub fn stored_quality(&self, symbol: &str, source: &str) -> Result<QualityReport, DataError> {
        let symbol = symbol.trim().to_uppercase();
        let window = self.window(self.config.period);
        let bars: Vec<Bar> = self
            .store
            .load_rows(&symbol, source)?
            .into_iter()
            .filter(|b| window.covers(self.config.interval, b.date))
            .collect();
        Ok(self.analyzer.analyze(&symbol, self.config.interval, &bars))
    }

    fn require_adapter(&self, source: &str) -> Result<&Arc<dyn SourceAdapter>, DataError> {
        self.adapters
            .get(source)
            .ok_or_else(|| DataError::UnknownSource(source.to_string()))
    }
}

fn dataset(cached: CachedDataset, interval: Interval, period: Period, from_cache: bool) -> EngineDataset {
    EngineDataset {
        symbol: cached.symbol,
        source: cached.source,
        interval,
        period,
        bars: cached.bars,
        composite_score: cached.composite_score,
        from_cache,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ProviderSettings, RetrySettings};
    use crate::data::provider::RawRow;
    use crate::data::store::MemoryStore;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> NaiveDateTime {
        // Saturday: market closed, outside warming hours.
        NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    /// Serves a synthetic daily series for any range and counts calls.
    struct Synthetic {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl SourceAdapter for Synthetic {
        fn name(&self) -> &str {
            self.name
        }

        fn fetch_raw(
            &self,
            _symbol: &str,
            _interval: Interval,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<Vec<RawRow>, DataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(start
                .iter_days()
                .take_while(|d| *d <= end)
                .enumerate()
                .map(|(i, date)| {
                    let close = 100.0 + (i % 3) as f64;
                    RawRow {
                        date,
                        open: close,
                        high: close + 1.0,
                        low: close - 1.0,
                        close,
                        volume: 1_000.0,
                    }
                })
                .collect())
        }

        fn real_time_quote(&self, symbol: &str) -> Result<Quote, DataError> {
            Ok(Quote {
                symbol: symbol.into(),
                source: self.name.into(),
                price: 101.0,
                previous_close: Some(100.0),
                change_percent: Some(1.0),
                volume: None,
                as_of: None,
            })
        }
    }

    fn engine(sources: &[&'static str]) -> (DataEngine, Vec<Arc<Synthetic>>, Arc<ManualClock>) {
        let mut config = EngineConfig {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            period: Period::OneMonth,
            ..EngineConfig::default()
        };
        for (i, s) in sources.iter().enumerate() {
            config.providers.insert(
                s.to_string(),
                ProviderSettings {
                    max_concurrent: 4,
                    base_delay_ms: 0,
                    batch_size: 2,
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
        let mut engine =
            DataEngine::with_clock(config, Arc::new(MemoryStore::new()), clock.clone()).unwrap();
        let adapters: Vec<Arc<Synthetic>> = sources
            .iter()
            .map(|&name| {
                Arc::new(Synthetic {
                    name,
                    calls: AtomicUsize::new(0),
                })
            })
            .collect();
        for a in &adapters {
            engine.register_adapter(a.clone());
        }
        (engine, adapters, clock)
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = EngineConfig {
            sources: Vec::new(),
            ..EngineConfig::default()
        };
        assert!(DataEngine::new(config, Arc::new(MemoryStore::new())).is_err());
    }

    #[test]
    fn second_request_is_served_from_cache() {
        let (engine, adapters, _clock) = engine(&["yfinance"]);

        let first = engine.get_bars("aapl").unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.symbol, "AAPL");
        assert_eq!(first.bars.len(), 31);

        let second = engine.get_bars("AAPL").unwrap();
        assert!(second.from_cache);
        assert_eq!(adapters[0].calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.cache_analytics().hits, 1);
    }

    #[test]
    fn expired_entry_goes_back_to_store_not_network() {
        let (engine, adapters, clock) = engine(&["yfinance"]);
        engine.get_bars("AAPL").unwrap();
        clock.advance(Duration::seconds(301));

        let again = engine.get_bars("AAPL").unwrap();
        assert!(!again.from_cache);
        // Window fully persisted on the first call.
        assert_eq!(adapters[0].calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidation_forces_reconcile() {
        let (engine, _adapters, _clock) = engine(&["yfinance"]);
        engine.get_bars("AAPL").unwrap();
        assert_eq!(engine.invalidate_symbol("aapl"), 1);
        assert!(!engine.get_bars("AAPL").unwrap().from_cache);
    }

    #[test]
    fn unknown_source_yields_no_data() {
        let (engine, _adapters, _clock) = engine(&["yfinance"]);
        let err = engine
            .get_bars_for("AAPL", Interval::Daily, Period::OneMonth, &["nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, DataError::NoDataAvailable { .. }));
    }

    #[test]
    fn batch_uses_highest_priority_provider() {
        let (engine, adapters, _clock) = engine(&["yfinance", "polygon"]);
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string(), "GOOG".to_string()];
        let summary = engine.fetch_batch(&symbols, &crate::data::download::NoProgress);

        assert!(summary.all_succeeded());
        assert!(summary.sources.values().all(|p| p == "yfinance"));
        assert_eq!(adapters[1].calls.load(Ordering::SeqCst), 0);

        let yf_only = ["yfinance".to_string()];
        let hit = engine
            .get_bars_for("MSFT", Interval::Daily, Period::OneMonth, &yf_only)
            .unwrap();
        assert!(hit.from_cache);

        // The full source list was never reconciled, so it is not a hit.
        let full = engine.get_bars("MSFT").unwrap();
        assert!(!full.from_cache);
        assert_eq!(adapters[1].calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quotes_go_through_the_named_adapter() {
        let (engine, _adapters, _clock) = engine(&["yfinance"]);
        assert_eq!(engine.real_time_quote("AAPL", "yfinance").unwrap().price, 101.0);
        assert!(matches!(
            engine.real_time_quote("AAPL", "nope"),
            Err(DataError::UnknownSource(_))
        ));
        assert!(engine.instrument_info("AAPL", "yfinance").is_err());
    }

    #[test]
    fn status_and_statistics() {
        let (engine, _adapters, _clock) = engine(&["yfinance", "polygon"]);
        let status = engine.market_status();
        assert!(!status.is_trading_day);
        assert!(!status.is_open);
        let stats = engine.source_statistics();
        assert_eq!(stats.len(), 2);
        assert!(!engine.in_warming_window());
        assert!(!engine.warm_cache(&["AAPL".to_string()]).ran);
    }

    #[test]
    fn stored_quality_reads_the_store() {
        let (engine, _adapters, _clock) = engine(&["yfinance"]);
        engine.get_bars("AAPL").unwrap();
        let report = engine.stored_quality("AAPL", "yfinance").unwrap();
        assert_eq!(report.data_points, 31);
        assert!(report.composite_score > 0.9);
    }
}
