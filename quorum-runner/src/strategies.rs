//! Built-in rule strategies.
//!
//! Each strategy looks at the last two points of its indicator and reports a
//! crossing on the most recent bar. Buy is checked before sell; a window too
//! short for the indicator, or one containing missing closes in the lookback,
//! holds.

use quorum_core::config::ConfigError;
use quorum_core::domain::{Bar, SignalType};
use quorum_core::Strategy;

/// Rolling mean of close over `window` bars ending at `end` (inclusive).
fn sma_at(bars: &[Bar], end: usize, window: usize) -> Option<f64> {
    if window == 0 || end + 1 < window {
        return None;
    }
    let slice = &bars[end + 1 - window..=end];
    let mut sum = 0.0;
    for bar in slice {
        if bar.close.is_nan() {
            return None;
        }
        sum += bar.close;
    }
    Some(sum / window as f64)
}

/// Sample standard deviation of close over the same window as [`sma_at`].
fn std_at(bars: &[Bar], end: usize, window: usize) -> Option<f64> {
    if window < 2 {
        return None;
    }
    let mean = sma_at(bars, end, window)?;
    let ss: f64 = bars[end + 1 - window..=end]
        .iter()
        .map(|b| (b.close - mean).powi(2))
        .sum();
    Some((ss / (window - 1) as f64).sqrt())
}

/// Exponentially weighted mean with span `span`, each point normalized by
/// the weights seen so far, so the first value needs no seed.
fn ewm(values: &[f64], span: usize) -> Vec<f64> {
    let decay = 1.0 - 2.0 / (span as f64 + 1.0);
    let mut num = 0.0;
    let mut den = 0.0;
    values
        .iter()
        .map(|&v| {
            num = v + decay * num;
            den = 1.0 + decay * den;
            num / den
        })
        .collect()
}

/// Closes of the last `n` bars, or `None` if any is missing.
fn tail_closes(bars: &[Bar], n: usize) -> Option<Vec<f64>> {
    let tail = &bars[bars.len().saturating_sub(n)..];
    tail.iter()
        .map(|b| (!b.close.is_nan()).then_some(b.close))
        .collect()
}

/// Differences within this fraction of price are ties, not crossings.
const EWM_TIE: f64 = 1e-9;

/// Buy when `fast` moves from below `slow` to above it, sell on the reverse.
/// Gaps no larger than `tie` count as equal.
fn crossing(prev: (f64, f64), curr: (f64, f64), tie: f64) -> SignalType {
    let prev_gap = prev.0 - prev.1;
    let curr_gap = curr.0 - curr.1;
    if prev_gap < -tie && curr_gap > tie {
        SignalType::Buy
    } else if prev_gap > tie && curr_gap < -tie {
        SignalType::Sell
    } else {
        SignalType::Hold
    }
}

// ─── SMA crossover ──────────────────────────────────────────────────

/// Golden cross buys, death cross sells.
#[derive(Debug, Clone)]
pub struct SmaCrossover {
    short_window: usize,
    long_window: usize,
    name: String,
}

impl SmaCrossover {
    pub fn new(short_window: usize, long_window: usize) -> Result<Self, ConfigError> {
        if short_window == 0 || short_window >= long_window {
            return Err(ConfigError::Invalid(format!(
                "sma crossover needs 0 < short_window < long_window, got {short_window}/{long_window}"
            )));
        }
        Ok(Self {
            short_window,
            long_window,
            name: format!("sma_crossover_{short_window}_{long_window}"),
        })
    }
}

impl Strategy for SmaCrossover {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_bars(&self) -> usize {
        self.long_window + 1
    }

    fn evaluate(&self, bars: &[Bar]) -> SignalType {
        if bars.len() < self.min_bars() {
            return SignalType::Hold;
        }
        let last = bars.len() - 1;
        let points = (
            sma_at(bars, last - 1, self.short_window),
            sma_at(bars, last - 1, self.long_window),
            sma_at(bars, last, self.short_window),
            sma_at(bars, last, self.long_window),
        );
        let (Some(short_prev), Some(long_prev), Some(short_curr), Some(long_curr)) = points else {
            return SignalType::Hold;
        };
        crossing((short_prev, long_prev), (short_curr, long_curr), 0.0)
    }
}

// ─── EMA crossover ──────────────────────────────────────────────────

/// EMA lookback in multiples of the slowest span.
const EWM_LOOKBACK: usize = 3;

/// Golden/death cross of two exponential means, computed over the last
/// `3 × long_window` bars.
#[derive(Debug, Clone)]
pub struct EmaCrossover {
    short_window: usize,
    long_window: usize,
    name: String,
}

impl EmaCrossover {
    pub fn new(short_window: usize, long_window: usize) -> Result<Self, ConfigError> {
        if short_window == 0 || short_window >= long_window {
            return Err(ConfigError::Invalid(format!(
                "ema crossover needs 0 < short_window < long_window, got {short_window}/{long_window}"
            )));
        }
        Ok(Self {
            short_window,
            long_window,
            name: format!("ema_crossover_{short_window}_{long_window}"),
        })
    }
}

impl Strategy for EmaCrossover {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_bars(&self) -> usize {
        self.long_window * EWM_LOOKBACK
    }

    fn evaluate(&self, bars: &[Bar]) -> SignalType {
        if bars.len() < self.min_bars() {
            return SignalType::Hold;
        }
        let Some(closes) = tail_closes(bars, self.min_bars()) else {
            return SignalType::Hold;
        };
        let short = ewm(&closes, self.short_window);
        let long = ewm(&closes, self.long_window);
        let n = closes.len();
        let tie = EWM_TIE * closes[n - 1].abs().max(1.0);
        crossing((short[n - 2], long[n - 2]), (short[n - 1], long[n - 1]), tie)
    }
}

// ─── MACD ───────────────────────────────────────────────────────────

/// MACD line (fast EMA − slow EMA) crossing its signal EMA, computed over
/// the last `3 × (slow + signal)` bars.
#[derive(Debug, Clone)]
pub struct MacdCrossover {
    fast: usize,
    slow: usize,
    signal: usize,
    name: String,
}

impl MacdCrossover {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self, ConfigError> {
        if fast == 0 || fast >= slow || signal == 0 {
            return Err(ConfigError::Invalid(format!(
                "macd needs 0 < fast < slow and signal >= 1, got {fast}/{slow}/{signal}"
            )));
        }
        Ok(Self {
            fast,
            slow,
            signal,
            name: format!("macd_{fast}_{slow}_{signal}"),
        })
    }

    /// `(macd, signal)` lines over `closes`.
    fn lines(&self, closes: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let macd: Vec<f64> = ewm(closes, self.fast)
            .into_iter()
            .zip(ewm(closes, self.slow))
            .map(|(f, s)| f - s)
            .collect();
        let signal = ewm(&macd, self.signal);
        (macd, signal)
    }
}

impl Strategy for MacdCrossover {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_bars(&self) -> usize {
        (self.slow + self.signal) * EWM_LOOKBACK
    }

    fn evaluate(&self, bars: &[Bar]) -> SignalType {
        if bars.len() < self.min_bars() {
            return SignalType::Hold;
        }
        let Some(closes) = tail_closes(bars, self.min_bars()) else {
            return SignalType::Hold;
        };
        let (macd, signal) = self.lines(&closes);
        let n = closes.len();
        let tie = EWM_TIE * closes[n - 1].abs().max(1.0);
        crossing((macd[n - 2], signal[n - 2]), (macd[n - 1], signal[n - 1]), tie)
    }
}

// ─── RSI ────────────────────────────────────────────────────────────

/// Buys when RSI climbs back over `oversold`, sells when it drops back under
/// `overbought`. Gains and losses are plain rolling means over `period`.
#[derive(Debug, Clone)]
pub struct RsiReversion {
    period: usize,
    oversold: f64,
    overbought: f64,
    name: String,
}

impl RsiReversion {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> Result<Self, ConfigError> {
        if period == 0 {
            return Err(ConfigError::Invalid("rsi period must be >= 1".into()));
        }
        if !(0.0..=100.0).contains(&oversold)
            || !(0.0..=100.0).contains(&overbought)
            || oversold >= overbought
        {
            return Err(ConfigError::Invalid(format!(
                "rsi thresholds need 0 <= oversold < overbought <= 100, got {oversold}/{overbought}"
            )));
        }
        Ok(Self {
            period,
            oversold,
            overbought,
            name: format!("rsi_{period}"),
        })
    }

    /// RSI at bar `end`, from the `period` close changes ending there.
    ///
    /// No losses gives 100, no gains gives 0, a flat window has no value.
    fn rsi_at(&self, bars: &[Bar], end: usize) -> Option<f64> {
        if end < self.period {
            return None;
        }
        let mut gain = 0.0;
        let mut loss = 0.0;
        for i in (end + 1 - self.period)..=end {
            let change = bars[i].close - bars[i - 1].close;
            if change.is_nan() {
                return None;
            }
            if change > 0.0 {
                gain += change;
            } else {
                loss -= change;
            }
        }
        match (gain > 0.0, loss > 0.0) {
            (false, false) => None,
            (_, false) => Some(100.0),
            (false, true) => Some(0.0),
            (true, true) => Some(100.0 - 100.0 / (1.0 + gain / loss)),
        }
    }
}

impl Strategy for RsiReversion {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_bars(&self) -> usize {
        self.period + 2
    }

    fn evaluate(&self, bars: &[Bar]) -> SignalType {
        if bars.len() < self.min_bars() {
            return SignalType::Hold;
        }
        let last = bars.len() - 1;
        let (Some(prev), Some(curr)) = (self.rsi_at(bars, last - 1), self.rsi_at(bars, last)) else {
            return SignalType::Hold;
        };

        if prev < self.oversold && curr > self.oversold {
            SignalType::Buy
        } else if prev > self.overbought && curr < self.overbought {
            SignalType::Sell
        } else {
            SignalType::Hold
        }
    }
}

// ─── Bollinger bands ────────────────────────────────────────────────

/// Closes within this fraction beyond a band count as touching it.
const BAND_TOLERANCE: f64 = 0.005;

/// Buys on a close at or just under the lower band, sells on a close at or
/// just over the upper band. Bands are `sma ± std_dev × sample std`.
#[derive(Debug, Clone)]
pub struct BollingerReversion {
    period: usize,
    std_dev: f64,
    name: String,
}

impl BollingerReversion {
    pub fn new(period: usize, std_dev: f64) -> Result<Self, ConfigError> {
        if period < 2 || !std_dev.is_finite() || std_dev <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "bollinger needs period >= 2 and std_dev > 0, got {period}/{std_dev}"
            )));
        }
        Ok(Self {
            period,
            std_dev,
            name: format!("bollinger_{period}_{std_dev}"),
        })
    }

    /// `(lower, upper)` at bar `end`. A window with no spread has no bands.
    fn bands_at(&self, bars: &[Bar], end: usize) -> Option<(f64, f64)> {
        let mid = sma_at(bars, end, self.period)?;
        let width = self.std_dev * std_at(bars, end, self.period)?;
        if width <= 0.0 {
            return None;
        }
        Some((mid - width, mid + width))
    }
}

impl Strategy for BollingerReversion {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_bars(&self) -> usize {
        self.period + 1
    }

    fn evaluate(&self, bars: &[Bar]) -> SignalType {
        if bars.len() < self.min_bars() {
            return SignalType::Hold;
        }
        let last = bars.len() - 1;
        let (Some((lower_prev, upper_prev)), Some((lower, upper))) =
            (self.bands_at(bars, last - 1), self.bands_at(bars, last))
        else {
            return SignalType::Hold;
        };
        let prev = bars[last - 1].close;
        let curr = bars[last].close;

        let crossed_lower = prev > lower_prev && curr <= lower;
        let near_lower = curr <= lower && curr >= lower * (1.0 - BAND_TOLERANCE);
        if crossed_lower || near_lower {
            return SignalType::Buy;
        }

        let crossed_upper = prev < upper_prev && curr >= upper;
        let near_upper = curr >= upper && curr <= upper * (1.0 + BAND_TOLERANCE);
        if crossed_upper || near_upper {
            return SignalType::Sell;
        }
        SignalType::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                symbol: "TEST".into(),
                source: "test".into(),
                date: start + chrono::Duration::days(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1_000.0,
                updated_at: start.and_hms_opt(0, 0, 0).unwrap(),
            })
            .collect()
    }

    #[test]
    fn sma_matches_hand_computation() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(sma_at(&bars, 2, 3), Some(2.0));
        assert_eq!(sma_at(&bars, 4, 3), Some(4.0));
        assert_eq!(sma_at(&bars, 1, 3), None);
    }

    #[test]
    fn sample_std_uses_n_minus_one() {
        let bars = bars_from_closes(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let std = std_at(&bars, 7, 8).unwrap();
        assert!((std - 2.138_089_935).abs() < 1e-6);
    }

    #[test]
    fn golden_cross_buys() {
        // Falling then a sharp jump on the last bar pushes the 2-bar mean
        // over the 4-bar mean.
        let bars = bars_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 12.0]);
        let s = SmaCrossover::new(2, 4).unwrap();
        assert_eq!(s.evaluate(&bars), SignalType::Buy);
    }

    #[test]
    fn death_cross_sells() {
        let bars = bars_from_closes(&[5.0, 6.0, 7.0, 8.0, 9.0, 3.0]);
        let s = SmaCrossover::new(2, 4).unwrap();
        assert_eq!(s.evaluate(&bars), SignalType::Sell);
    }

    #[test]
    fn steady_trend_holds() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let s = SmaCrossover::new(2, 4).unwrap();
        assert_eq!(s.evaluate(&bars), SignalType::Hold);
    }

    #[test]
    fn ewm_matches_hand_computation() {
        // span 3: alpha 0.5, weights renormalized at each step
        let out = ewm(&[1.0, 2.0, 3.0], 3);
        assert_eq!(out[0], 1.0);
        assert!((out[1] - 5.0 / 3.0).abs() < 1e-12);
        assert!((out[2] - 17.0 / 7.0).abs() < 1e-12);
    }

    fn falling_then_jump() -> Vec<f64> {
        let mut closes: Vec<f64> = (11..=40).rev().map(f64::from).collect();
        closes.push(40.0);
        closes
    }

    fn rising_then_drop() -> Vec<f64> {
        let mut closes: Vec<f64> = (10..40).map(f64::from).collect();
        closes.push(5.0);
        closes
    }

    #[test]
    fn ema_golden_and_death_cross() {
        let s = EmaCrossover::new(2, 4).unwrap();
        assert_eq!(s.min_bars(), 12);
        assert_eq!(s.evaluate(&bars_from_closes(&falling_then_jump())), SignalType::Buy);
        assert_eq!(s.evaluate(&bars_from_closes(&rising_then_drop())), SignalType::Sell);
    }

    #[test]
    fn macd_crossing_signal_line() {
        let s = MacdCrossover::new(2, 4, 2).unwrap();
        assert_eq!(s.min_bars(), 18);
        assert_eq!(s.evaluate(&bars_from_closes(&falling_then_jump())), SignalType::Buy);
        assert_eq!(s.evaluate(&bars_from_closes(&rising_then_drop())), SignalType::Sell);
    }

    #[test]
    fn flat_series_never_crosses_exponential_means() {
        let flat = bars_from_closes(&[20.0; 40]);
        assert_eq!(EmaCrossover::new(2, 4).unwrap().evaluate(&flat), SignalType::Hold);
        assert_eq!(MacdCrossover::new(2, 4, 2).unwrap().evaluate(&flat), SignalType::Hold);
        assert_eq!(MacdCrossover::new(12, 26, 9).unwrap().evaluate(&flat), SignalType::Hold);
    }

    #[test]
    fn missing_close_in_ema_lookback_holds() {
        let mut bars = bars_from_closes(&falling_then_jump());
        bars[25].close = f64::NAN;
        assert_eq!(EmaCrossover::new(2, 4).unwrap().evaluate(&bars), SignalType::Hold);
        assert_eq!(MacdCrossover::new(2, 4, 2).unwrap().evaluate(&bars), SignalType::Hold);
    }

    #[test]
    fn short_window_holds() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0]);
        assert_eq!(SmaCrossover::new(2, 4).unwrap().evaluate(&bars), SignalType::Hold);
        assert_eq!(RsiReversion::new(14, 30.0, 70.0).unwrap().evaluate(&bars), SignalType::Hold);
        assert_eq!(BollingerReversion::new(20, 2.0).unwrap().evaluate(&bars), SignalType::Hold);
        assert_eq!(SmaCrossover::new(2, 4).unwrap().evaluate(&[]), SignalType::Hold);
    }

    #[test]
    fn nan_close_in_lookback_holds() {
        let mut bars = bars_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 12.0]);
        bars[4].close = f64::NAN;
        assert_eq!(SmaCrossover::new(2, 4).unwrap().evaluate(&bars), SignalType::Hold);
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(SmaCrossover::new(50, 20).is_err());
        assert!(SmaCrossover::new(0, 20).is_err());
        assert!(RsiReversion::new(0, 30.0, 70.0).is_err());
        assert!(RsiReversion::new(14, 70.0, 30.0).is_err());
        assert!(BollingerReversion::new(1, 2.0).is_err());
        assert!(BollingerReversion::new(20, 0.0).is_err());
        assert!(BollingerReversion::new(20, f64::NAN).is_err());
        assert!(EmaCrossover::new(26, 12).is_err());
        assert!(MacdCrossover::new(12, 26, 0).is_err());
        assert!(MacdCrossover::new(26, 26, 9).is_err());
    }

    #[test]
    fn rsi_edges() {
        let s = RsiReversion::new(3, 30.0, 70.0).unwrap();
        let rising = bars_from_closes(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.rsi_at(&rising, 3), Some(100.0));
        let falling = bars_from_closes(&[4.0, 3.0, 2.0, 1.0]);
        assert_eq!(s.rsi_at(&falling, 3), Some(0.0));
        let flat = bars_from_closes(&[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(s.rsi_at(&flat, 3), None);
    }

    #[test]
    fn rsi_recovering_from_oversold_buys() {
        // prev window -1,-1,-1 gives 0; curr window -1,-1,+2 gives 50.
        let bars = bars_from_closes(&[10.0, 9.0, 8.0, 7.0, 9.0]);
        let s = RsiReversion::new(3, 30.0, 70.0).unwrap();
        assert_eq!(s.evaluate(&bars), SignalType::Buy);
    }

    #[test]
    fn rsi_falling_from_overbought_sells() {
        let bars = bars_from_closes(&[7.0, 8.0, 9.0, 10.0, 8.0]);
        let s = RsiReversion::new(3, 30.0, 70.0).unwrap();
        assert_eq!(s.evaluate(&bars), SignalType::Sell);
    }

    #[test]
    fn close_crashing_through_lower_band_buys() {
        let mut closes = vec![100.0, 101.0, 100.0, 101.0, 100.0, 101.0];
        closes.push(90.0);
        let s = BollingerReversion::new(5, 1.0).unwrap();
        assert_eq!(s.evaluate(&bars_from_closes(&closes)), SignalType::Buy);
    }

    #[test]
    fn close_spiking_through_upper_band_sells() {
        let mut closes = vec![100.0, 101.0, 100.0, 101.0, 100.0, 101.0];
        closes.push(112.0);
        let s = BollingerReversion::new(5, 1.0).unwrap();
        assert_eq!(s.evaluate(&bars_from_closes(&closes)), SignalType::Sell);
    }

    #[test]
    fn flat_series_has_no_bands() {
        let s = BollingerReversion::new(5, 2.0).unwrap();
        assert_eq!(s.evaluate(&bars_from_closes(&[100.0; 8])), SignalType::Hold);
    }

    #[test]
    fn close_inside_bands_holds() {
        let closes = [100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.5];
        let s = BollingerReversion::new(5, 2.0).unwrap();
        assert_eq!(s.evaluate(&bars_from_closes(&closes)), SignalType::Hold);
    }
}
