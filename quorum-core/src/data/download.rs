//! Batch fetching across providers with progress reporting.
//!
//! Providers are consulted in ascending priority so cheap, reliable sources
//! are exhausted before fragile ones are touched. Each provider works through
//! the symbols still unsatisfied, `batch_size` at a time, with in-chunk
//! parallelism bounded by its current concurrency.

use super::provider::DataError;
use super::rate_control::RateController;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Progress callbacks for multi-symbol fetches.
pub trait BatchProgress: Send + Sync {
    /// A provider is about to process one chunk of symbols.
    fn on_chunk(&self, _provider: &str, _chunk: usize, _symbols: &[String]) {}

    /// A symbol is settled: `Ok(provider)` that satisfied it, or the last error.
    fn on_complete(&self, symbol: &str, index: usize, total: usize, result: &Result<String, DataError>);

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize);
}

/// Reports through `tracing`.
pub struct LogProgress;

impl BatchProgress for LogProgress {
    fn on_chunk(&self, provider: &str, chunk: usize, symbols: &[String]) {
        info!(provider, chunk, size = symbols.len(), "fetching chunk");
    }

    fn on_complete(&self, symbol: &str, index: usize, total: usize, result: &Result<String, DataError>) {
        match result {
            Ok(provider) => info!(symbol, provider = %provider, "[{}/{}] ok", index + 1, total),
            Err(e) => warn!(symbol, error = %e, "[{}/{}] failed", index + 1, total),
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
        info!(succeeded, failed, total, "batch complete");
    }
}

/// Discards every event.
pub struct NoProgress;

impl BatchProgress for NoProgress {
    fn on_complete(&self, _: &str, _: usize, _: usize, _: &Result<String, DataError>) {}
    fn on_batch_complete(&self, _: usize, _: usize, _: usize) {}
}

/// Outcome of a batch fetch. The batch always completes.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Symbol → provider that satisfied it.
    pub sources: BTreeMap<String, String>,
    #[serde(serialize_with = "errors_as_text")]
    pub errors: Vec<(String, DataError)>,
}

fn errors_as_text<S: serde::Serializer>(
    errors: &[(String, DataError)],
    s: S,
) -> Result<S::Ok, S::Error> {
    s.collect_map(errors.iter().map(|(sym, e)| (sym, e.to_string())))
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// One provider's place in the batch.
#[derive(Debug, Clone)]
pub struct BatchProvider {
    pub name: String,
    pub batch_size: usize,
}

/// Run `fetch_one(symbol, provider)` until every symbol is satisfied or every
/// provider has been tried. Providers must already be in priority order.
pub fn run_batch<F>(
    symbols: &[String],
    providers: &[BatchProvider],
    rates: &RateController,
    fetch_one: F,
    progress: &dyn BatchProgress,
) -> BatchSummary
where
    F: Fn(&str, &str) -> Result<(), DataError> + Sync,
{
    let total = symbols.len();
    let mut sources: BTreeMap<String, String> = BTreeMap::new();
    let mut last_error: BTreeMap<String, DataError> = BTreeMap::new();

    for provider in providers {
        let pending: Vec<String> = symbols
            .iter()
            .filter(|s| !sources.contains_key(*s))
            .cloned()
            .collect();
        if pending.is_empty() {
            break;
        }

        for (chunk_index, chunk) in pending.chunks(provider.batch_size.max(1)).enumerate() {
            progress.on_chunk(&provider.name, chunk_index, chunk);
            let workers = rates.current_concurrency(&provider.name).min(chunk.len());
            let results = run_chunk(chunk, workers, |symbol| fetch_one(symbol, &provider.name));

            for (symbol, result) in results {
                match result {
                    Ok(()) => {
                        last_error.remove(&symbol);
                        sources.insert(symbol, provider.name.clone());
                    }
                    Err(e) => {
                        last_error.insert(symbol, e);
                    }
                }
            }
        }
    }

    let mut errors = Vec::new();
    for (index, symbol) in symbols.iter().enumerate() {
        let result = match sources.get(symbol) {
            Some(p) => Ok(p.clone()),
            None => Err(last_error
                .remove(symbol)
                .unwrap_or_else(|| DataError::NoDataAvailable {
                    symbol: symbol.clone(),
                })),
        };
        progress.on_complete(symbol, index, total, &result);
        if let Err(e) = result {
            errors.push((symbol.clone(), e));
        }
    }

    let succeeded = total - errors.len();
    progress.on_batch_complete(succeeded, errors.len(), total);

    BatchSummary {
        total,
        succeeded,
        failed: errors.len(),
        sources,
        errors,
    }
}

fn run_chunk<F>(chunk: &[String], workers: usize, job: F) -> Vec<(String, Result<(), DataError>)>
where
    F: Fn(&str) -> Result<(), DataError> + Sync,
{
    let sequential = |chunk: &[String]| {
        chunk
            .iter()
            .map(|s| (s.clone(), job(s)))
            .collect::<Vec<_>>()
    };
    if workers <= 1 {
        return sequential(chunk);
    }

    match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool.install(|| {
            chunk
                .par_iter()
                .map(|s| (s.clone(), job(s)))
                .collect()
        }),
        Err(e) => {
            warn!(error = %e, "failed to build worker pool, fetching sequentially");
            sequential(chunk)
        }
    }
}
