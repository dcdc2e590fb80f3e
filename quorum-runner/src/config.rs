//! Serializable analysis-run configuration.

use quorum_core::config::ConfigError;
use quorum_core::{ConsensusMode, EngineConfig, Strategy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::strategies::{
    BollingerReversion, EmaCrossover, MacdCrossover, RsiReversion, SmaCrossover,
};

/// Content hash of a run configuration.
pub type RunId = String;

/// Everything needed to reproduce an analysis run.
///
/// ```toml
/// symbols = ["AAPL", "MSFT"]
/// consensus = "providers"
///
/// [[strategies]]
/// type = "SMA_CROSSOVER"
/// short_window = 20
/// long_window = 50
///
/// [engine]
/// sources = ["yfinance", "polygon"]
/// period = "1y"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub symbols: Vec<String>,

    #[serde(default = "StrategySpec::defaults")]
    pub strategies: Vec<StrategySpec>,

    #[serde(default)]
    pub consensus: ConsensusMode,

    /// Symbols analyzed at once.
    #[serde(default = "default_parallel_symbols")]
    pub max_parallel_symbols: usize,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_parallel_symbols() -> usize {
    4
}

impl RunConfig {
    /// A run over `symbols` with the default strategy set and engine.
    pub fn for_symbols(symbols: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            strategies: StrategySpec::defaults(),
            consensus: ConsensusMode::default(),
            max_parallel_symbols: default_parallel_symbols(),
            engine: EngineConfig::default(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid("at least one symbol is required".into()));
        }
        if self.strategies.is_empty() {
            return Err(ConfigError::Invalid("at least one strategy is required".into()));
        }
        if self.max_parallel_symbols == 0 {
            return Err(ConfigError::Invalid("max_parallel_symbols must be >= 1".into()));
        }
        for spec in &self.strategies {
            spec.build()?;
        }
        self.engine.validate()
    }

    /// Trimmed, uppercased, deduplicated symbols in first-seen order.
    pub fn normalized_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for s in &self.symbols {
            let s = s.trim().to_uppercase();
            if !s.is_empty() && !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }

    pub fn build_strategies(&self) -> Result<Vec<Arc<dyn Strategy>>, ConfigError> {
        self.strategies.iter().map(StrategySpec::build).collect()
    }

    /// Deterministic hash of the whole configuration.
    pub fn run_id(&self) -> RunId {
        let bytes = serde_json::to_vec(self).unwrap_or_else(|_| format!("{self:?}").into_bytes());
        blake3::hash(&bytes).to_hex().to_string()
    }
}

/// Strategy configuration (serializable enum).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategySpec {
    /// Short SMA crossing the long SMA.
    SmaCrossover {
        #[serde(default = "default_short_window")]
        short_window: usize,
        #[serde(default = "default_long_window")]
        long_window: usize,
    },

    /// Short EMA crossing the long EMA.
    EmaCrossover {
        #[serde(default = "default_ema_short")]
        short_window: usize,
        #[serde(default = "default_ema_long")]
        long_window: usize,
    },

    /// MACD line crossing its signal line.
    Macd {
        #[serde(default = "default_ema_short")]
        fast: usize,
        #[serde(default = "default_ema_long")]
        slow: usize,
        #[serde(default = "default_macd_signal")]
        signal: usize,
    },

    /// RSI leaving the oversold/overbought zones.
    Rsi {
        #[serde(default = "default_rsi_period")]
        period: usize,
        #[serde(default = "default_oversold")]
        oversold: f64,
        #[serde(default = "default_overbought")]
        overbought: f64,
    },

    /// Close touching a Bollinger band.
    Bollinger {
        #[serde(default = "default_band_period")]
        period: usize,
        #[serde(default = "default_std_dev")]
        std_dev: f64,
    },
}

fn default_short_window() -> usize {
    20
}
fn default_long_window() -> usize {
    50
}
fn default_ema_short() -> usize {
    12
}
fn default_ema_long() -> usize {
    26
}
fn default_macd_signal() -> usize {
    9
}
fn default_rsi_period() -> usize {
    14
}
fn default_oversold() -> f64 {
    30.0
}
fn default_overbought() -> f64 {
    70.0
}
fn default_band_period() -> usize {
    20
}
fn default_std_dev() -> f64 {
    2.0
}

impl StrategySpec {
    /// SMA 20/50, RSI 14 (30/70), Bollinger 20×2.
    pub fn defaults() -> Vec<StrategySpec> {
        vec![
            StrategySpec::SmaCrossover {
                short_window: default_short_window(),
                long_window: default_long_window(),
            },
            StrategySpec::Rsi {
                period: default_rsi_period(),
                oversold: default_oversold(),
                overbought: default_overbought(),
            },
            StrategySpec::Bollinger {
                period: default_band_period(),
                std_dev: default_std_dev(),
            },
        ]
    }

    pub fn build(&self) -> Result<Arc<dyn Strategy>, ConfigError> {
        Ok(match *self {
            StrategySpec::SmaCrossover {
                short_window,
                long_window,
            } => Arc::new(SmaCrossover::new(short_window, long_window)?),
            StrategySpec::EmaCrossover {
                short_window,
                long_window,
            } => Arc::new(EmaCrossover::new(short_window, long_window)?),
            StrategySpec::Macd { fast, slow, signal } => {
                Arc::new(MacdCrossover::new(fast, slow, signal)?)
            }
            StrategySpec::Rsi {
                period,
                oversold,
                overbought,
            } => Arc::new(RsiReversion::new(period, oversold, overbought)?),
            StrategySpec::Bollinger { period, std_dev } => {
                Arc::new(BollingerReversion::new(period, std_dev)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
symbols = ["aapl", " msft ", "AAPL"]
consensus = "providers"
max_parallel_symbols = 2

[[strategies]]
type = "SMA_CROSSOVER"
short_window = 5
long_window = 20

[[strategies]]
type = "RSI"

[engine]
sources = ["yfinance", "polygon"]
period = "1y"
"#;

    #[test]
    fn parses_tagged_strategies_and_engine_table() {
        let config = RunConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.consensus, ConsensusMode::Providers);
        assert_eq!(config.max_parallel_symbols, 2);
        assert_eq!(
            config.strategies[0],
            StrategySpec::SmaCrossover {
                short_window: 5,
                long_window: 20
            }
        );
        assert_eq!(
            config.strategies[1],
            StrategySpec::Rsi {
                period: 14,
                oversold: 30.0,
                overbought: 70.0
            }
        );
        assert_eq!(config.engine.sources, vec!["yfinance", "polygon"]);
        assert_eq!(config.build_strategies().unwrap().len(), 2);
    }

    #[test]
    fn exponential_strategies_parse_with_defaults() {
        let config = RunConfig::from_toml(
            r#"
symbols = ["SPY"]

[[strategies]]
type = "EMA_CROSSOVER"

[[strategies]]
type = "MACD"
signal = 5
"#,
        )
        .unwrap();
        assert_eq!(
            config.strategies,
            vec![
                StrategySpec::EmaCrossover {
                    short_window: 12,
                    long_window: 26
                },
                StrategySpec::Macd {
                    fast: 12,
                    slow: 26,
                    signal: 5
                },
            ]
        );
        let built = config.build_strategies().unwrap();
        assert_eq!(built[0].name(), "ema_crossover_12_26");
        assert_eq!(built[1].name(), "macd_12_26_5");

        let bad = RunConfig::from_toml(
            "symbols = [\"SPY\"]\n[[strategies]]\ntype = \"MACD\"\nfast = 30\n",
        );
        assert!(bad.is_err());
    }

    #[test]
    fn omitted_sections_take_defaults() {
        let config = RunConfig::from_toml(r#"symbols = ["SPY"]"#).unwrap();
        assert_eq!(config.strategies, StrategySpec::defaults());
        assert_eq!(config.consensus, ConsensusMode::Occurrences);
        assert_eq!(config.max_parallel_symbols, 4);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn symbols_are_normalized_and_deduplicated() {
        let config = RunConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.normalized_symbols(), vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(RunConfig::from_toml(r#"symbols = []"#).is_err());
        assert!(RunConfig::from_toml("symbols = [\"SPY\"]\nmax_parallel_symbols = 0").is_err());
        assert!(RunConfig::from_toml("symbols = [\"SPY\"]\nstrategies = []").is_err());

        let bad_strategy = r#"
symbols = ["SPY"]
[[strategies]]
type = "SMA_CROSSOVER"
short_window = 50
long_window = 20
"#;
        assert!(matches!(
            RunConfig::from_toml(bad_strategy),
            Err(ConfigError::Invalid(_))
        ));

        let bad_engine = "symbols = [\"SPY\"]\n[engine]\nsources = []";
        assert!(RunConfig::from_toml(bad_engine).is_err());
    }

    #[test]
    fn unknown_strategy_type_is_a_parse_error() {
        let toml = "symbols = [\"SPY\"]\n[[strategies]]\ntype = \"MACD\"";
        assert!(matches!(RunConfig::from_toml(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn run_id_deterministic_and_sensitive() {
        let a = RunConfig::for_symbols(["SPY"]);
        let mut b = a.clone();
        assert_eq!(a.run_id(), b.run_id());
        assert_eq!(a.run_id().len(), 64);

        b.consensus = ConsensusMode::Providers;
        assert_ne!(a.run_id(), b.run_id());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RunConfig::from_file(Path::new("/nonexistent/run.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/run.toml"));
    }
}
