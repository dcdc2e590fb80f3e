//! Cross-provider consensus over strategy signals.
//!
//! Buy and sell votes are counted and compared against the number of
//! providers that produced data (not the number of signals). Buy wins when it
//! beats sell and clears half of the providers; sell symmetrically; anything
//! else holds with zero confidence.

use crate::domain::SignalType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What counts as one vote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    /// Every buy/sell signal from every strategy on every provider.
    #[default]
    Occurrences,
    /// One vote per provider: the majority of its own strategies.
    Providers,
}

/// One strategy's verdict on one provider's dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalVote {
    pub signal: SignalType,
    pub strategy: String,
}

impl SignalVote {
    pub fn new(signal: SignalType, strategy: impl Into<String>) -> Self {
        Self {
            signal,
            strategy: strategy.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub symbol: String,
    pub signal: SignalType,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub buy_count: usize,
    pub sell_count: usize,
    /// Providers that produced data.
    pub total_sources: usize,
}

impl ConsensusResult {
    /// Apply the majority rule to raw counts.
    pub fn from_counts(symbol: &str, buy_count: usize, sell_count: usize, total_sources: usize) -> Self {
        let half = total_sources as f64 / 2.0;
        let (signal, winning) = if total_sources == 0 {
            (SignalType::Hold, 0)
        } else if buy_count > sell_count && buy_count as f64 > half {
            (SignalType::Buy, buy_count)
        } else if sell_count > buy_count && sell_count as f64 > half {
            (SignalType::Sell, sell_count)
        } else {
            (SignalType::Hold, 0)
        };

        let confidence = if total_sources == 0 {
            0.0
        } else {
            (winning as f64 / total_sources as f64).min(1.0)
        };

        Self {
            symbol: symbol.to_string(),
            signal,
            confidence,
            buy_count,
            sell_count,
            total_sources,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusAggregator {
    mode: ConsensusMode,
}

impl ConsensusAggregator {
    pub fn new(mode: ConsensusMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ConsensusMode {
        self.mode
    }

    /// Fold per-provider votes into one decision. Every key of `votes` is a
    /// provider that produced data, even if its vote list is empty.
    pub fn aggregate(&self, symbol: &str, votes: &BTreeMap<String, Vec<SignalVote>>) -> ConsensusResult {
        let (buy, sell) = match self.mode {
            ConsensusMode::Occurrences => votes.values().flatten().fold((0, 0), |(b, s), v| match v.signal {
                SignalType::Buy => (b + 1, s),
                SignalType::Sell => (b, s + 1),
                SignalType::Hold => (b, s),
            }),
            ConsensusMode::Providers => votes.values().fold((0, 0), |(b, s), list| {
                match provider_majority(list) {
                    SignalType::Buy => (b + 1, s),
                    SignalType::Sell => (b, s + 1),
                    SignalType::Hold => (b, s),
                }
            }),
        };
        ConsensusResult::from_counts(symbol, buy, sell, votes.len())
    }
}

fn provider_majority(votes: &[SignalVote]) -> SignalType {
    let buys = votes.iter().filter(|v| v.signal == SignalType::Buy).count();
    let sells = votes.iter().filter(|v| v.signal == SignalType::Sell).count();
    match buys.cmp(&sells) {
        std::cmp::Ordering::Greater => SignalType::Buy,
        std::cmp::Ordering::Less => SignalType::Sell,
        std::cmp::Ordering::Equal => SignalType::Hold,
    }
}
