//! Parquet-backed bar store with Hive-style partitioning.
//!
//! Layout: `{root}/source={SOURCE}/symbol={SYMBOL}/{year}.parquet`
//!
//! - writes are atomic (write `.tmp`, rename into place)
//! - upserts rewrite only the year partitions they touch
//! - corrupt partitions are quarantined as `{file}.quarantined` and skipped
//! - a `meta.json` sidecar per partition records range, count, hash and last update

use super::provider::DataError;
use super::store::BarStore;
use crate::domain::Bar;
use crate::fingerprint::dataset_hash;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const COLUMNS: [&str; 7] = ["date", "open", "high", "low", "close", "volume", "updated_at"];

/// Sidecar describing one `(source, symbol)` partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub symbol: String,
    pub source: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub bar_count: usize,
    pub data_hash: String,
    pub last_updated: NaiveDateTime,
}

pub struct ParquetStore {
    root: PathBuf,
    // Upserts are read-modify-write per partition.
    write_lock: Mutex<()>,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, symbol: &str, source: &str) -> PathBuf {
        self.root
            .join(format!("source={source}"))
            .join(format!("symbol={symbol}"))
    }

    fn year_path(&self, symbol: &str, source: &str, year: i32) -> PathBuf {
        self.partition_dir(symbol, source)
            .join(format!("{year}.parquet"))
    }

    fn meta_path(&self, symbol: &str, source: &str) -> PathBuf {
        self.partition_dir(symbol, source).join("meta.json")
    }

    /// Sidecar for a partition, if present and readable.
    pub fn meta(&self, symbol: &str, source: &str) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(symbol, source)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Sources with a partition for `symbol`.
    pub fn sources_for(&self, symbol: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut sources: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix("source="))
                    .map(str::to_string)
            })
            .filter(|source| self.partition_dir(symbol, source).is_dir())
            .collect();
        sources.sort();
        sources
    }

    fn write_meta(&self, symbol: &str, source: &str, bars: &[Bar]) -> Result<(), DataError> {
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Ok(());
        };
        let meta = StoreMeta {
            symbol: symbol.to_string(),
            source: source.to_string(),
            start_date: first.date,
            end_date: last.date,
            bar_count: bars.len(),
            data_hash: dataset_hash(bars)
                .map_err(|e| DataError::PersistenceError(format!("hash serialization: {e}")))?,
            last_updated: bars.iter().map(|b| b.updated_at).max().unwrap_or(last.updated_at),
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| DataError::PersistenceError(format!("meta serialization: {e}")))?;
        fs::write(self.meta_path(symbol, source), json)
            .map_err(|e| DataError::PersistenceError(format!("meta write: {e}")))
    }
}

impl BarStore for ParquetStore {
    fn load_rows(&self, symbol: &str, source: &str) -> Result<Vec<Bar>, DataError> {
        let dir = self.partition_dir(symbol, source);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir)
            .map_err(|e| DataError::PersistenceError(format!("read dir: {e}")))?;
        let mut by_date: BTreeMap<NaiveDate, Bar> = BTreeMap::new();

        for entry in entries {
            let entry =
                entry.map_err(|e| DataError::PersistenceError(format!("dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }

            match read_partition(&path, symbol, source) {
                Ok(bars) => {
                    for bar in bars {
                        by_date.insert(bar.date, bar);
                    }
                }
                Err(e) => {
                    let quarantine = path.with_extension("parquet.quarantined");
                    warn!(path = %path.display(), error = %e, "quarantining corrupt partition");
                    let _ = fs::rename(&path, &quarantine);
                }
            }
        }

        Ok(by_date.into_values().collect())
    }

    fn store_rows(&self, symbol: &str, source: &str, bars: &[Bar]) -> Result<(), DataError> {
        if bars.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.partition_dir(symbol, source);
        fs::create_dir_all(&dir)
            .map_err(|e| DataError::PersistenceError(format!("failed to create dir: {e}")))?;

        let mut merged: BTreeMap<NaiveDate, Bar> = self
            .load_rows(symbol, source)?
            .into_iter()
            .map(|b| (b.date, b))
            .collect();
        let touched: BTreeSet<i32> = bars.iter().map(|b| b.date.year()).collect();
        for bar in bars {
            merged.insert(bar.date, bar.clone());
        }
        let all: Vec<Bar> = merged.into_values().collect();

        for year in touched {
            let year_bars: Vec<&Bar> = all.iter().filter(|b| b.date.year() == year).collect();
            let df = bars_to_dataframe(&year_bars)?;
            let path = self.year_path(symbol, source, year);
            let tmp_path = path.with_extension("parquet.tmp");

            write_parquet(&df, &tmp_path)?;
            fs::rename(&tmp_path, &path).map_err(|e| {
                let _ = fs::remove_file(&tmp_path);
                DataError::PersistenceError(format!("atomic rename failed: {e}"))
            })?;
        }

        self.write_meta(symbol, source, &all)?;
        debug!(symbol, source, rows = bars.len(), total = all.len(), "stored bars");
        Ok(())
    }

    fn last_updated(
        &self,
        symbol: &str,
        source: &str,
    ) -> Result<Option<NaiveDateTime>, DataError> {
        if let Some(meta) = self.meta(symbol, source) {
            return Ok(Some(meta.last_updated));
        }
        Ok(self
            .load_rows(symbol, source)?
            .iter()
            .map(|b| b.updated_at)
            .max())
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn epoch() -> NaiveDate {
    NaiveDate::default()
}

fn bars_to_dataframe(bars: &[&Bar]) -> Result<DataFrame, DataError> {
    let dates: Vec<i32> = bars
        .iter()
        .map(|b| (b.date - epoch()).num_days() as i32)
        .collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let updated: Vec<i64> = bars
        .iter()
        .map(|b| b.updated_at.and_utc().timestamp_millis())
        .collect();

    DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| DataError::PersistenceError(format!("date cast: {e}")))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("updated_at".into(), updated),
    ])
    .map_err(|e| DataError::PersistenceError(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), DataError> {
    let file = fs::File::create(path)
        .map_err(|e| DataError::PersistenceError(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| DataError::PersistenceError(format!("write parquet: {e}")))?;
    Ok(())
}

fn read_partition(path: &Path, symbol: &str, source: &str) -> Result<Vec<Bar>, DataError> {
    let file = fs::File::open(path)
        .map_err(|e| DataError::PersistenceError(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::PersistenceError(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(DataError::InvalidData("empty parquet partition".into()));
    }
    for col_name in COLUMNS {
        if df.column(col_name).is_err() {
            return Err(DataError::InvalidData(format!("missing column '{col_name}'")));
        }
    }

    dataframe_to_bars(&df, symbol, source)
}

fn dataframe_to_bars(df: &DataFrame, symbol: &str, source: &str) -> Result<Vec<Bar>, DataError> {
    let col_err = |name: &str, e: PolarsError| {
        DataError::PersistenceError(format!("{name} column: {e}"))
    };
    let f64_col = |name: &str| -> Result<Vec<f64>, DataError> {
        let col = df.column(name).map_err(|e| col_err(name, e))?;
        let ca = col.f64().map_err(|e| col_err(name, e))?;
        Ok(ca.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    };

    let date_col = df.column("date").map_err(|e| col_err("date", e))?;
    let date_ca = date_col.date().map_err(|e| col_err("date", e))?;
    let upd_col = df.column("updated_at").map_err(|e| col_err("updated_at", e))?;
    let upd_ca = upd_col.i64().map_err(|e| col_err("updated_at", e))?;

    let opens = f64_col("open")?;
    let highs = f64_col("high")?;
    let lows = f64_col("low")?;
    let closes = f64_col("close")?;
    let volumes = f64_col("volume")?;

    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let days = date_ca
            .get(i)
            .ok_or_else(|| DataError::InvalidData(format!("null date at row {i}")))?;
        let millis = upd_ca
            .get(i)
            .ok_or_else(|| DataError::InvalidData(format!("null updated_at at row {i}")))?;
        let updated_at = DateTime::from_timestamp_millis(millis)
            .map(|dt| dt.naive_utc())
            .ok_or_else(|| DataError::InvalidData(format!("invalid updated_at {millis}")))?;

        bars.push(Bar {
            symbol: symbol.to_string(),
            source: source.to_string(),
            date: epoch() + chrono::Duration::days(i64::from(days)),
            open: opens[i],
            high: highs[i],
            low: lows[i],
            close: closes[i],
            volume: volumes[i],
            updated_at,
        });
    }
    Ok(bars)
}
