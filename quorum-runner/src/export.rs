//! Export of analysis runs.
//!
//! - **JSON**: the full `AnalysisSummary` with a `schema_version` field.
//!   Unknown versions are rejected on load.
//! - **CSV**: one consensus row per symbol, for spreadsheets.

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::analysis::{AnalysisSummary, SCHEMA_VERSION};

/// Serialize a summary to pretty JSON.
pub fn export_json(summary: &AnalysisSummary) -> Result<String> {
    serde_json::to_string_pretty(summary).context("failed to serialize AnalysisSummary to JSON")
}

/// Deserialize a summary, rejecting schema versions newer than this build.
pub fn import_json(json: &str) -> Result<AnalysisSummary> {
    let summary: AnalysisSummary =
        serde_json::from_str(json).context("failed to deserialize AnalysisSummary from JSON")?;
    if summary.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            summary.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(summary)
}

/// Consensus table.
///
/// Columns: symbol, signal, confidence, buy_count, sell_count, total_sources,
/// sources, min_quality, error. Failed symbols have an empty signal.
pub fn export_consensus_csv(summary: &AnalysisSummary) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "symbol",
        "signal",
        "confidence",
        "buy_count",
        "sell_count",
        "total_sources",
        "sources",
        "min_quality",
        "error",
    ])?;

    for r in &summary.results {
        let min_quality = r
            .quality_scores
            .values()
            .copied()
            .reduce(f64::min)
            .map(|q| format!("{q:.4}"))
            .unwrap_or_default();
        let sources = r.sources_analyzed.join(";");
        let (signal, confidence, buy, sell, total) = match &r.consensus {
            Some(c) => (
                c.signal.to_string(),
                format!("{:.4}", c.confidence),
                c.buy_count.to_string(),
                c.sell_count.to_string(),
                c.total_sources.to_string(),
            ),
            None => Default::default(),
        };
        wtr.write_record([
            r.symbol.as_str(),
            signal.as_str(),
            confidence.as_str(),
            buy.as_str(),
            sell.as_str(),
            total.as_str(),
            sources.as_str(),
            min_quality.as_str(),
            r.error.as_deref().unwrap_or(""),
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Write whichever artifacts were asked for, creating parent directories.
pub fn write_artifacts(
    summary: &AnalysisSummary,
    json_path: Option<&Path>,
    csv_path: Option<&Path>,
) -> Result<()> {
    if let Some(path) = json_path {
        write_file(path, &export_json(summary)?)?;
    }
    if let Some(path) = csv_path {
        write_file(path, &export_consensus_csv(summary)?)?;
    }
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{SignalCounts, SymbolAnalysis};
    use quorum_core::domain::SignalType;
    use quorum_core::{ConsensusMode, ConsensusResult, SignalVote};
    use std::collections::BTreeMap;

    fn sample() -> AnalysisSummary {
        let mut quality = BTreeMap::new();
        quality.insert("polygon".to_string(), 0.82);
        quality.insert("yfinance".to_string(), 0.97);
        let mut signals = BTreeMap::new();
        signals.insert(
            "yfinance".to_string(),
            vec![SignalVote::new(SignalType::Buy, "rsi_14")],
        );
        signals.insert("polygon".to_string(), vec![]);

        AnalysisSummary {
            schema_version: SCHEMA_VERSION,
            run_id: Some("abc".into()),
            consensus_mode: ConsensusMode::Occurrences,
            strategies: vec!["rsi_14".into()],
            symbols_processed: 2,
            succeeded: 1,
            failed: 1,
            signals: SignalCounts { buy: 1, sell: 0 },
            signals_by_source: BTreeMap::new(),
            consensus_buy: 0,
            consensus_sell: 0,
            consensus_hold: 1,
            results: vec![
                SymbolAnalysis {
                    symbol: "AAPL".into(),
                    sources_analyzed: vec!["yfinance".into(), "polygon".into()],
                    quality_scores: quality,
                    signals_by_source: signals,
                    consensus: Some(ConsensusResult::from_counts("AAPL", 1, 0, 2)),
                    error: None,
                    elapsed_ms: 12,
                },
                SymbolAnalysis {
                    symbol: "ZZZZ".into(),
                    sources_analyzed: vec![],
                    quality_scores: BTreeMap::new(),
                    signals_by_source: BTreeMap::new(),
                    consensus: None,
                    error: Some("no data available for ZZZZ".into()),
                    elapsed_ms: 3,
                },
            ],
            elapsed_ms: 20,
        }
    }

    #[test]
    fn json_round_trip() {
        let summary = sample();
        let json = export_json(&summary).unwrap();
        assert!(json.contains("\"schema_version\": 1"));
        assert_eq!(import_json(&json).unwrap(), summary);
    }

    #[test]
    fn newer_schema_rejected() {
        let mut summary = sample();
        summary.schema_version = SCHEMA_VERSION + 1;
        let json = export_json(&summary).unwrap();
        let err = import_json(&json).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version"));
    }

    #[test]
    fn csv_has_one_row_per_symbol() {
        let csv = export_consensus_csv(&sample()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("symbol,signal,confidence"));
        // 1 buy of 2 sources is not a majority.
        assert_eq!(lines[1], "AAPL,hold,0.0000,1,0,2,yfinance;polygon,0.8200,");
        assert_eq!(lines[2], "ZZZZ,,,,,,,,no data available for ZZZZ");
    }

    #[test]
    fn artifacts_written_to_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("out/run.json");
        let csv = dir.path().join("out/consensus.csv");
        write_artifacts(&sample(), Some(json.as_path()), Some(csv.as_path())).unwrap();
        assert!(json.exists());
        assert!(std::fs::read_to_string(&csv).unwrap().contains("AAPL"));
    }
}
