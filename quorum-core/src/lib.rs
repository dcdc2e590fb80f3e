//! Quorum core: multi-provider OHLCV ingestion.
//!
//! - Domain types (bars, intervals, periods, signals)
//! - Source adapter contract plus Yahoo, Polygon and Alpha Vantage adapters
//! - Incremental reconciler merging stored history with fetched deltas
//! - Adaptive per-provider delay and concurrency control
//! - Fingerprint-keyed dataset cache with market-hours invalidation
//! - Quality analyzer (completeness, consistency, anomalies)
//! - Cross-provider signal consensus
//! - Bar stores (in-memory and partitioned Parquet)

pub mod clock;
pub mod config;
pub mod consensus;
pub mod data;
pub mod domain;
pub mod engine;
pub mod fingerprint;
pub mod market;
pub mod strategy;

pub use config::{ConfigError, EngineConfig};
pub use consensus::{ConsensusAggregator, ConsensusMode, ConsensusResult, SignalVote};
pub use data::DataError;
pub use engine::{DataEngine, EngineDataset};
pub use strategy::Strategy;
