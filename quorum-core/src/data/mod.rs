//! Ingestion: adapters, canonicalization, reconciliation, throttling,
//! caching, quality scoring and storage.

pub mod adapters;
pub mod cache;
pub mod canonicalize;
pub mod download;
pub(crate) mod http;
pub mod parquet_store;
pub mod provider;
pub mod quality;
pub mod rate_control;
pub mod reconcile;
pub mod store;

pub use cache::{BarCache, CacheAnalytics, CachedDataset, WarmReport};
pub use canonicalize::{coverage, merge, normalize, Coverage, MergeOutcome};
pub use download::{BatchProgress, BatchSummary, LogProgress, NoProgress};
pub use parquet_store::{ParquetStore, StoreMeta};
pub use provider::{DataError, InstrumentInfo, Quote, RawRow, SourceAdapter};
pub use quality::{remove_outliers, OutlierMethod, QualityAnalyzer, QualityReport};
pub use rate_control::{RateController, SourceStats};
pub use reconcile::{AdapterMap, ProviderOutcome, ProviderStatus, Reconciler, Reconciliation};
pub use store::{BarStore, MemoryStore};
