//! Multi-source analysis: reconcile every provider for a symbol, run the
//! strategy set on each usable dataset, and fold the votes into a consensus.
//!
//! Symbols are independent and run on a bounded worker pool. A symbol for
//! which no provider produced usable data is counted as failed; it never
//! aborts the run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use quorum_core::config::ConfigError;
use quorum_core::domain::SignalType;
use quorum_core::{
    ConsensusAggregator, ConsensusMode, ConsensusResult, DataEngine, DataError, SignalVote,
    Strategy,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RunConfig;

/// Current schema version for exported summaries.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("no symbols provided")]
    NoSymbols,
    #[error("no strategies provided")]
    NoStrategies,
}

/// Knobs for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub consensus: ConsensusMode,
    /// Symbols analyzed at once. 1 runs on the calling thread.
    pub max_parallel_symbols: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            consensus: ConsensusMode::default(),
            max_parallel_symbols: 4,
        }
    }
}

impl From<&RunConfig> for AnalysisOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            consensus: config.consensus,
            max_parallel_symbols: config.max_parallel_symbols,
        }
    }
}

/// Progress event, one per finished symbol.
#[derive(Debug, Clone)]
pub struct AnalysisProgress {
    pub completed: usize,
    pub total: usize,
    pub symbol: String,
    /// `None` when the symbol failed.
    pub signal: Option<SignalType>,
}

/// Buy/sell signal occurrences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalCounts {
    pub buy: usize,
    pub sell: usize,
}

impl SignalCounts {
    fn add(&mut self, votes: &[SignalVote]) {
        for v in votes {
            match v.signal {
                SignalType::Buy => self.buy += 1,
                SignalType::Sell => self.sell += 1,
                SignalType::Hold => {}
            }
        }
    }

    pub fn total(&self) -> usize {
        self.buy + self.sell
    }
}

/// Result for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolAnalysis {
    pub symbol: String,
    /// Providers whose dataset passed validation, in reconcile order.
    pub sources_analyzed: Vec<String>,
    /// Composite quality score per analyzed provider.
    pub quality_scores: BTreeMap<String, f64>,
    /// Buy/sell votes per analyzed provider. Holds are not recorded.
    pub signals_by_source: BTreeMap<String, Vec<SignalVote>>,
    pub consensus: Option<ConsensusResult>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl SymbolAnalysis {
    pub fn succeeded(&self) -> bool {
        self.consensus.is_some()
    }
}

/// Aggregate of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: Option<String>,
    pub consensus_mode: ConsensusMode,
    pub strategies: Vec<String>,
    pub symbols_processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Signal occurrences over every provider and strategy.
    pub signals: SignalCounts,
    pub signals_by_source: BTreeMap<String, SignalCounts>,
    pub consensus_buy: usize,
    pub consensus_sell: usize,
    pub consensus_hold: usize,
    /// In input symbol order.
    pub results: Vec<SymbolAnalysis>,
    pub elapsed_ms: u64,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl AnalysisSummary {
    fn from_results(
        results: Vec<SymbolAnalysis>,
        strategies: &[Arc<dyn Strategy>],
        mode: ConsensusMode,
        elapsed_ms: u64,
    ) -> Self {
        let mut summary = AnalysisSummary {
            schema_version: SCHEMA_VERSION,
            run_id: None,
            consensus_mode: mode,
            strategies: strategies.iter().map(|s| s.name().to_string()).collect(),
            symbols_processed: results.len(),
            succeeded: 0,
            failed: 0,
            signals: SignalCounts::default(),
            signals_by_source: BTreeMap::new(),
            consensus_buy: 0,
            consensus_sell: 0,
            consensus_hold: 0,
            results: Vec::new(),
            elapsed_ms,
        };

        for r in &results {
            let Some(consensus) = &r.consensus else {
                summary.failed += 1;
                continue;
            };
            summary.succeeded += 1;
            match consensus.signal {
                SignalType::Buy => summary.consensus_buy += 1,
                SignalType::Sell => summary.consensus_sell += 1,
                SignalType::Hold => summary.consensus_hold += 1,
            }
            for (source, votes) in &r.signals_by_source {
                summary.signals.add(votes);
                summary
                    .signals_by_source
                    .entry(source.clone())
                    .or_default()
                    .add(votes);
            }
        }
        summary.results = results;
        summary
    }

    pub fn result(&self, symbol: &str) -> Option<&SymbolAnalysis> {
        self.results.iter().find(|r| r.symbol == symbol)
    }
}

/// Build the engine's strategies from `config` and run it.
pub fn run_configured(
    engine: &DataEngine,
    config: &RunConfig,
    progress: Option<&(dyn Fn(&AnalysisProgress) + Sync)>,
    cancel: Option<&AtomicBool>,
) -> Result<AnalysisSummary, AnalysisError> {
    config.validate()?;
    let strategies = config.build_strategies()?;
    let mut summary = run_analysis(
        engine,
        &strategies,
        &config.normalized_symbols(),
        &AnalysisOptions::from(config),
        progress,
        cancel,
    )?;
    summary.run_id = Some(config.run_id());
    Ok(summary)
}

/// Analyze `symbols` with `strategies` over the engine's configured sources.
///
/// Symbols not started before `cancel` is raised are left out of the summary.
pub fn run_analysis(
    engine: &DataEngine,
    strategies: &[Arc<dyn Strategy>],
    symbols: &[String],
    opts: &AnalysisOptions,
    progress: Option<&(dyn Fn(&AnalysisProgress) + Sync)>,
    cancel: Option<&AtomicBool>,
) -> Result<AnalysisSummary, AnalysisError> {
    let symbols: Vec<String> = symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(AnalysisError::NoSymbols);
    }
    if strategies.is_empty() {
        return Err(AnalysisError::NoStrategies);
    }

    let start = Instant::now();
    let aggregator = ConsensusAggregator::new(opts.consensus);
    let completed = AtomicUsize::new(0);
    let total = symbols.len();
    info!(
        symbols = total,
        strategies = strategies.len(),
        mode = ?opts.consensus,
        "starting multi-source analysis"
    );

    let analyze = |symbol: &String| -> Option<SymbolAnalysis> {
        if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return None;
        }
        let result = analyze_symbol(engine, strategies, &aggregator, symbol);
        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(cb) = progress {
            cb(&AnalysisProgress {
                completed: done,
                total,
                symbol: symbol.clone(),
                signal: result.consensus.as_ref().map(|c| c.signal),
            });
        }
        Some(result)
    };

    let workers = opts.max_parallel_symbols.max(1).min(total);
    let pool = if workers > 1 {
        match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(error = %e, "failed to build worker pool, analyzing sequentially");
                None
            }
        }
    } else {
        None
    };

    let results: Vec<SymbolAnalysis> = match pool {
        Some(pool) => pool.install(|| symbols.par_iter().filter_map(analyze).collect()),
        None => symbols.iter().filter_map(analyze).collect(),
    };

    let summary = AnalysisSummary::from_results(
        results,
        strategies,
        opts.consensus,
        start.elapsed().as_millis() as u64,
    );
    info!(
        processed = summary.symbols_processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        buy = summary.consensus_buy,
        sell = summary.consensus_sell,
        hold = summary.consensus_hold,
        signals = summary.signals.total(),
        "analysis finished"
    );
    Ok(summary)
}

fn analyze_symbol(
    engine: &DataEngine,
    strategies: &[Arc<dyn Strategy>],
    aggregator: &ConsensusAggregator,
    symbol: &str,
) -> SymbolAnalysis {
    let started = Instant::now();
    let config = engine.config();
    let window = engine.window(config.period);
    let rec = engine.reconcile(symbol, config.interval, window, &config.sources);

    let mut sources_analyzed = Vec::new();
    let mut quality_scores = BTreeMap::new();
    let mut signals_by_source = BTreeMap::new();

    for outcome in rec.usable() {
        let composite = outcome.quality.composite_score;
        if composite < config.quality.warn_composite {
            warn!(
                symbol,
                provider = %outcome.provider,
                composite,
                recommendations = ?outcome.quality.recommendations,
                "low quality dataset"
            );
        }

        let votes: Vec<SignalVote> = strategies
            .iter()
            .filter_map(|s| match s.evaluate(&outcome.bars) {
                SignalType::Hold => None,
                signal => Some(SignalVote::new(signal, s.name())),
            })
            .collect();
        debug!(
            symbol,
            provider = %outcome.provider,
            bars = outcome.bars.len(),
            votes = votes.len(),
            "strategies evaluated"
        );

        sources_analyzed.push(outcome.provider.clone());
        quality_scores.insert(outcome.provider.clone(), composite);
        signals_by_source.insert(outcome.provider.clone(), votes);
    }

    for outcome in rec.outcomes.iter().filter(|o| !o.is_usable()) {
        let reason = outcome
            .rejection
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "no data".to_string());
        debug!(symbol, provider = %outcome.provider, reason = %reason, "provider skipped");
    }

    let (consensus, error) = if sources_analyzed.is_empty() {
        let err = DataError::NoDataAvailable {
            symbol: symbol.to_string(),
        };
        warn!(symbol, "no provider produced usable data");
        (None, Some(err.to_string()))
    } else {
        let result = aggregator.aggregate(symbol, &signals_by_source);
        info!(
            symbol,
            signal = %result.signal,
            confidence = result.confidence,
            buy = result.buy_count,
            sell = result.sell_count,
            sources = result.total_sources,
            "consensus"
        );
        (Some(result), None)
    };

    SymbolAnalysis {
        symbol: symbol.to_string(),
        sources_analyzed,
        quality_scores,
        signals_by_source,
        consensus,
        error,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
