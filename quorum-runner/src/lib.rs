//! Quorum runner: multi-source analysis runs on top of `quorum-core`.
//!
//! - Built-in strategies (SMA and EMA crossovers, MACD, RSI, Bollinger)
//! - Run configuration with a tagged strategy list and an embedded engine table
//! - Per-symbol pipeline: reconcile every provider, vote, reach consensus
//! - JSON and CSV export of run summaries

pub mod analysis;
pub mod config;
pub mod export;
pub mod strategies;

pub use analysis::{
    run_analysis, run_configured, AnalysisError, AnalysisOptions, AnalysisProgress,
    AnalysisSummary, SignalCounts, SymbolAnalysis,
};
pub use config::{RunConfig, RunId, StrategySpec};
pub use export::{export_consensus_csv, export_json, import_json, write_artifacts};
pub use strategies::{
    BollingerReversion, EmaCrossover, MacdCrossover, RsiReversion, SmaCrossover,
};
