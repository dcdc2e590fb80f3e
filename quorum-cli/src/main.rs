//! Quorum CLI. Fetch, analyze, quality, sources and status commands.
//!
//! Commands:
//! - `fetch`: reconcile and persist bars for symbols across providers
//! - `analyze`: run a multi-source consensus analysis from a TOML run config
//! - `quality`: quality report for one provider's dataset
//! - `sources`: configured providers, limits and availability
//! - `status`: market session and cache-warming eligibility
//!
//! Logs go to stderr; stdout carries results only.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quorum_core::data::adapters::{AlphaVantageAdapter, PolygonAdapter, YahooAdapter};
use quorum_core::data::{BarStore, LogProgress, ParquetStore};
use quorum_core::domain::Period;
use quorum_core::{DataEngine, EngineConfig};
use quorum_runner::{run_configured, write_artifacts, AnalysisProgress, AnalysisSummary, RunConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "quorum",
    about = "Quorum CLI: multi-provider OHLCV ingestion and signal consensus"
)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Engine config TOML. Defaults are used when omitted.
    #[arg(long, global = true)]
    engine_config: Option<PathBuf>,

    /// Bar store directory.
    #[arg(long, global = true, default_value = "data")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch missing bars for symbols and persist them.
    Fetch {
        /// Symbols to fetch (e.g., AAPL MSFT SPY).
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Lookback period: 1mo, 3mo, 6mo, 1y, 2y.
        #[arg(long)]
        period: Option<Period>,

        /// Comma-separated providers, replacing the configured list.
        #[arg(long, value_delimiter = ',')]
        sources: Option<Vec<String>>,

        /// Do not write merged datasets back to the store.
        #[arg(long, default_value_t = false)]
        no_persist: bool,
    },
    /// Run a consensus analysis from a TOML run config.
    Analyze {
        /// Path to the run config.
        #[arg(long)]
        config: PathBuf,

        /// Write the full summary as JSON.
        #[arg(long)]
        json: Option<PathBuf>,

        /// Write the consensus table as CSV.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Quality report for one provider's dataset.
    Quality {
        symbol: String,

        /// Provider name (e.g., yfinance).
        #[arg(long)]
        source: String,

        /// Report on stored rows only; never touch the network.
        #[arg(long, default_value_t = false)]
        offline: bool,
    },
    /// List configured providers with their limits and availability.
    Sources,
    /// Market session and cache-warming eligibility.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let engine_config = match &cli.engine_config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Fetch {
            symbols,
            period,
            sources,
            no_persist,
        } => run_fetch(engine_config, &cli.store, symbols, period, sources, no_persist),
        Commands::Analyze { config, json, csv } => {
            run_analyze(&config, &cli.store, json.as_deref(), csv.as_deref())
        }
        Commands::Quality {
            symbol,
            source,
            offline,
        } => run_quality(engine_config, &cli.store, &symbol, &source, offline),
        Commands::Sources => run_sources(engine_config, &cli.store),
        Commands::Status => run_status(engine_config, &cli.store),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Engine over a Parquet store with every adapter whose credentials exist.
fn build_engine(config: EngineConfig, store_dir: &Path) -> Result<DataEngine> {
    let store: Arc<dyn BarStore> = Arc::new(ParquetStore::new(store_dir));
    let mut engine = DataEngine::new(config, store).context("invalid engine config")?;

    engine.register_adapter(Arc::new(
        YahooAdapter::new().context("failed to build Yahoo client")?,
    ));
    match PolygonAdapter::from_env() {
        Some(adapter) => {
            engine.register_adapter(Arc::new(adapter.context("failed to build Polygon client")?))
        }
        None => info!("POLYGON_API_KEY not set, polygon disabled"),
    }
    match AlphaVantageAdapter::from_env() {
        Some(adapter) => engine.register_adapter(Arc::new(
            adapter.context("failed to build Alpha Vantage client")?,
        )),
        None => info!("ALPHA_VANTAGE_API_KEY not set, alpha_vantage disabled"),
    }

    for source in &engine.config().sources {
        if engine.adapter(source).is_none() {
            warn!(provider = %source, "configured source has no adapter and will be skipped");
        }
    }
    Ok(engine)
}

fn run_fetch(
    mut config: EngineConfig,
    store_dir: &Path,
    symbols: Vec<String>,
    period: Option<Period>,
    sources: Option<Vec<String>>,
    no_persist: bool,
) -> Result<()> {
    if let Some(period) = period {
        config.period = period;
    }
    if let Some(sources) = sources {
        config.sources = sources.into_iter().map(|s| s.trim().to_string()).collect();
    }
    if no_persist {
        config.reconcile.persist = false;
    }

    let engine = build_engine(config, store_dir)?;
    let summary = engine.fetch_batch(&symbols, &LogProgress);

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.all_succeeded() {
        for (sym, err) in &summary.errors {
            eprintln!("Error for {sym}: {err}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_analyze(
    config_path: &Path,
    store_dir: &Path,
    json: Option<&Path>,
    csv: Option<&Path>,
) -> Result<()> {
    let run = RunConfig::from_file(config_path)
        .with_context(|| format!("failed to load run config {}", config_path.display()))?;
    let engine = build_engine(run.engine.clone(), store_dir)?;

    let progress = |p: &AnalysisProgress| {
        let signal = p.signal.map_or("failed", |s| s.as_str());
        info!(symbol = %p.symbol, signal, "[{}/{}] analyzed", p.completed, p.total);
    };
    let summary = run_configured(&engine, &run, Some(&progress), None)?;

    print_summary(&summary);
    write_artifacts(&summary, json, csv)?;
    if let Some(path) = json {
        println!("Summary written to: {}", path.display());
    }
    if let Some(path) = csv {
        println!("Consensus table written to: {}", path.display());
    }
    Ok(())
}

fn print_summary(summary: &AnalysisSummary) {
    println!(
        "Symbols: {} ({} ok, {} failed)   Signals: {} buy / {} sell   Consensus: {} buy / {} sell / {} hold",
        summary.symbols_processed,
        summary.succeeded,
        summary.failed,
        summary.signals.buy,
        summary.signals.sell,
        summary.consensus_buy,
        summary.consensus_sell,
        summary.consensus_hold,
    );
    println!();
    println!(
        "{:<8} {:<6} {:>10} {:>5} {:>5} {:>8}  {}",
        "Symbol", "Signal", "Confidence", "Buy", "Sell", "Sources", "Providers"
    );
    println!("{}", "-".repeat(72));
    for r in &summary.results {
        match &r.consensus {
            Some(c) => println!(
                "{:<8} {:<6} {:>10.2} {:>5} {:>5} {:>8}  {}",
                r.symbol,
                c.signal,
                c.confidence,
                c.buy_count,
                c.sell_count,
                c.total_sources,
                r.sources_analyzed.join(", ")
            ),
            None => println!(
                "{:<8} {:<6} {}",
                r.symbol,
                "-",
                r.error.as_deref().unwrap_or("failed")
            ),
        }
    }
}

fn run_quality(
    config: EngineConfig,
    store_dir: &Path,
    symbol: &str,
    source: &str,
    offline: bool,
) -> Result<()> {
    let engine = build_engine(config, store_dir)?;
    let report = if offline {
        engine.stored_quality(symbol, source)?
    } else {
        if engine.adapter(source).is_none() {
            bail!("no adapter registered for source '{source}'");
        }
        let symbol = symbol.trim().to_uppercase();
        let cfg = engine.config();
        let window = engine.window(cfg.period);
        let rec = engine.reconcile(&symbol, cfg.interval, window, &[source.to_string()]);
        let outcome = rec
            .outcome(source)
            .with_context(|| format!("no outcome for {source}"))?;
        if let Some(err) = &outcome.error {
            warn!(provider = source, error = %err, "fetch did not contribute, reporting stored rows");
        }
        outcome.quality.clone()
    };
    print!("{}", report.render_text());
    Ok(())
}

fn run_sources(config: EngineConfig, store_dir: &Path) -> Result<()> {
    let engine = build_engine(config, store_dir)?;
    println!(
        "{:<14} {:>8} {:>10} {:>10} {:>7}  {}",
        "Source", "Priority", "Concurrent", "Delay(ms)", "Batch", "Status"
    );
    println!("{}", "-".repeat(66));
    for name in engine.config().sources_by_priority() {
        let limits = engine.config().provider(&name);
        let status = match engine.adapter(&name) {
            Some(a) if a.is_available() => "available",
            Some(_) => "unavailable",
            None => "no adapter",
        };
        println!(
            "{:<14} {:>8} {:>10} {:>10} {:>7}  {}",
            name,
            limits.priority,
            limits.max_concurrent,
            limits.base_delay_ms,
            limits.batch_size,
            status
        );
    }
    Ok(())
}

fn run_status(config: EngineConfig, store_dir: &Path) -> Result<()> {
    let engine = build_engine(config, store_dir)?;
    let status = engine.market_status();
    let hours = &engine.config().cache.low_traffic_hours;

    println!("Time:            {}", status.at.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "Session:         {} - {}",
        status.session_open.format("%H:%M"),
        status.session_close.format("%H:%M")
    );
    println!("Trading day:     {}", yes_no(status.is_trading_day));
    println!("Market open:     {}", yes_no(status.is_open));
    println!(
        "Cache warming:   {} (low-traffic hours: {:?})",
        if engine.in_warming_window() { "eligible" } else { "not eligible" },
        hours
    );
    println!(
        "Cache TTL:       {}s{}",
        engine.config().cache.ttl_secs,
        if engine.config().cache.enabled { "" } else { " (disabled)" }
    );
    Ok(())
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}
