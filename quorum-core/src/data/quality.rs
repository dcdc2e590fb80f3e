//! Dataset quality analysis: completeness, consistency and anomaly scoring.
//!
//! Composite = `0.3 × completeness + 0.4 × consistency + 0.3 × anomaly`,
//! clamped to `[0, 1]`. An empty dataset scores `0.0` everywhere.

use crate::config::QualitySettings;
use crate::domain::{Bar, DateWindow, Interval};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

const COMPLETENESS_WEIGHT: f64 = 0.3;
const CONSISTENCY_WEIGHT: f64 = 0.4;
const ANOMALY_WEIGHT: f64 = 0.3;
const OHLCV_CELLS: usize = 5;

/// Numeric series inspected for anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Open,
    High,
    Low,
    Close,
    Volume,
    /// Day-over-day percentage change of close.
    Returns,
}

impl Field {
    const PRICE_AND_VOLUME: [Field; 5] =
        [Field::Open, Field::High, Field::Low, Field::Close, Field::Volume];

    fn value(&self, bar: &Bar) -> f64 {
        match self {
            Field::Open => bar.open,
            Field::High => bar.high,
            Field::Low => bar.low,
            Field::Close => bar.close,
            Field::Volume => bar.volume,
            Field::Returns => f64::NAN,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Open => "open",
            Field::High => "high",
            Field::Low => "low",
            Field::Close => "close",
            Field::Volume => "volume",
            Field::Returns => "returns",
        }
    }
}

/// A point whose z-score exceeds the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub field: Field,
    pub index: usize,
    pub date: NaiveDate,
    pub value: f64,
    pub z_score: f64,
}

/// Consecutive bars further apart than the interval allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateGap {
    pub after: NaiveDate,
    pub before: NaiveDate,
    pub days: i64,
}

/// Close-to-close move larger than the configured maximum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LargeMove {
    pub date: NaiveDate,
    pub change: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletenessDetail {
    pub missing_cells: usize,
    pub total_cells: usize,
    pub missing_percentage: f64,
    pub date_gaps: Vec<DateGap>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyDetail {
    pub ohlc_violations: usize,
    pub non_positive_prices: usize,
    pub negative_volume: usize,
    /// Reported only; zero volume is legal.
    pub zero_volume: usize,
    pub checks_passed: usize,
    pub checks_total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub symbol: String,
    pub data_points: usize,
    pub date_range: Option<DateWindow>,
    pub completeness: CompletenessDetail,
    pub consistency: ConsistencyDetail,
    pub anomalies: Vec<Anomaly>,
    pub large_moves: Vec<LargeMove>,
    pub statistics: BTreeMap<Field, ColumnStats>,
    pub completeness_score: f64,
    pub consistency_score: f64,
    pub anomaly_score: f64,
    pub composite_score: f64,
    pub recommendations: Vec<String>,
}

impl QualityReport {
    fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            data_points: 0,
            date_range: None,
            completeness: CompletenessDetail::default(),
            consistency: ConsistencyDetail::default(),
            anomalies: Vec::new(),
            large_moves: Vec::new(),
            statistics: BTreeMap::new(),
            completeness_score: 0.0,
            consistency_score: 0.0,
            anomaly_score: 0.0,
            composite_score: 0.0,
            recommendations: vec!["No data available; try another provider or period".into()],
        }
    }

    /// Human-readable multi-line report.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(60);
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "DATA QUALITY REPORT: {}", self.symbol);
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Data points: {}", self.data_points);
        if let Some(range) = &self.date_range {
            let _ = writeln!(out, "Date range:  {} to {}", range.start, range.end);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Composite score:    {:.3}", self.composite_score);
        let _ = writeln!(out, "  completeness:     {:.3}", self.completeness_score);
        let _ = writeln!(out, "  consistency:      {:.3}", self.consistency_score);
        let _ = writeln!(out, "  anomaly:          {:.3}", self.anomaly_score);
        let _ = writeln!(out);

        let c = &self.completeness;
        let _ = writeln!(out, "COMPLETENESS");
        let _ = writeln!(
            out,
            "  missing cells: {} of {} ({:.2}%)",
            c.missing_cells, c.total_cells, c.missing_percentage
        );
        let _ = writeln!(out, "  date gaps:     {}", c.date_gaps.len());

        let k = &self.consistency;
        let _ = writeln!(out, "CONSISTENCY ({}/{} checks passed)", k.checks_passed, k.checks_total);
        let _ = writeln!(out, "  OHLC violations:     {}", k.ohlc_violations);
        let _ = writeln!(out, "  non-positive prices: {}", k.non_positive_prices);
        let _ = writeln!(out, "  negative volume:     {}", k.negative_volume);
        let _ = writeln!(out, "  zero volume:         {}", k.zero_volume);

        let _ = writeln!(out, "ANOMALIES ({})", self.anomalies.len());
        let mut per_field: BTreeMap<Field, usize> = BTreeMap::new();
        for a in &self.anomalies {
            *per_field.entry(a.field).or_default() += 1;
        }
        for (field, n) in per_field {
            let _ = writeln!(out, "  {:<8} {n}", field.as_str());
        }
        if !self.large_moves.is_empty() {
            let _ = writeln!(out, "  large moves: {}", self.large_moves.len());
        }

        if !self.statistics.is_empty() {
            let _ = writeln!(out, "STATISTICS");
            for (field, s) in &self.statistics {
                let _ = writeln!(
                    out,
                    "  {:<8} mean {:>12.4} std {:>12.4} min {:>12.4} max {:>12.4}",
                    field.as_str(),
                    s.mean,
                    s.std,
                    s.min,
                    s.max
                );
            }
        }

        let _ = writeln!(out, "RECOMMENDATIONS");
        for r in &self.recommendations {
            let _ = writeln!(out, "  - {r}");
        }
        out
    }
}

/// Stateless analyzer; thresholds come from [`QualitySettings`].
#[derive(Debug, Clone, Copy)]
pub struct QualityAnalyzer {
    anomaly_z: f64,
    max_price_change: f64,
}

impl Default for QualityAnalyzer {
    fn default() -> Self {
        Self::new(&QualitySettings::default())
    }
}

impl QualityAnalyzer {
    pub fn new(settings: &QualitySettings) -> Self {
        Self {
            anomaly_z: settings.anomaly_z,
            max_price_change: settings.max_price_change,
        }
    }

    /// Analyze `bars` (expected ascending by date).
    pub fn analyze(&self, symbol: &str, interval: Interval, bars: &[Bar]) -> QualityReport {
        if bars.is_empty() {
            return QualityReport::empty(symbol);
        }

        let completeness = completeness(bars, interval);
        let consistency = consistency(bars);
        let anomalies = self.anomalies(bars);
        let large_moves = self.large_moves(bars);

        let completeness_score = 1.0 - completeness.missing_percentage / 100.0;
        let consistency_score = if consistency.checks_total == 0 {
            1.0
        } else {
            consistency.checks_passed as f64 / consistency.checks_total as f64
        };
        let anomaly_score = (1.0 - anomalies.len() as f64 / bars.len() as f64).max(0.0);
        let composite_score = (completeness_score * COMPLETENESS_WEIGHT
            + consistency_score * CONSISTENCY_WEIGHT
            + anomaly_score * ANOMALY_WEIGHT)
            .clamp(0.0, 1.0);

        let mut report = QualityReport {
            symbol: symbol.to_string(),
            data_points: bars.len(),
            date_range: date_range(bars),
            completeness,
            consistency,
            anomalies,
            large_moves,
            statistics: statistics(bars),
            completeness_score,
            consistency_score,
            anomaly_score,
            composite_score,
            recommendations: Vec::new(),
        };
        report.recommendations = self.recommendations(&report);
        report
    }

    fn anomalies(&self, bars: &[Bar]) -> Vec<Anomaly> {
        let mut out = Vec::new();

        for field in Field::PRICE_AND_VOLUME {
            let points: Vec<(usize, f64)> = bars
                .iter()
                .enumerate()
                .map(|(i, b)| (i, field.value(b)))
                .filter(|(_, v)| v.is_finite())
                .collect();
            self.flag(field, &points, bars, &mut out);
        }

        let returns: Vec<(usize, f64)> = bars
            .windows(2)
            .enumerate()
            .filter_map(|(i, w)| pct_change(w[0].close, w[1].close).map(|r| (i + 1, r)))
            .collect();
        self.flag(Field::Returns, &returns, bars, &mut out);

        out
    }

    fn flag(&self, field: Field, points: &[(usize, f64)], bars: &[Bar], out: &mut Vec<Anomaly>) {
        let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        let Some((mean, std)) = mean_std(&values) else {
            return;
        };
        if std <= 0.0 || !std.is_finite() {
            return;
        }
        for &(index, value) in points {
            let z = (value - mean).abs() / std;
            if z > self.anomaly_z {
                out.push(Anomaly {
                    field,
                    index,
                    date: bars[index].date,
                    value,
                    z_score: z,
                });
            }
        }
    }

    fn large_moves(&self, bars: &[Bar]) -> Vec<LargeMove> {
        bars.windows(2)
            .filter_map(|w| {
                pct_change(w[0].close, w[1].close)
                    .filter(|r| r.abs() > self.max_price_change)
                    .map(|change| LargeMove {
                        date: w[1].date,
                        change,
                    })
            })
            .collect()
    }

    fn recommendations(&self, report: &QualityReport) -> Vec<String> {
        let mut recs = Vec::new();
        let c = &report.completeness;
        let k = &report.consistency;

        if c.missing_percentage > 5.0 {
            recs.push(format!(
                "Missing data is {:.1}% of cells; consider a provider with better coverage",
                c.missing_percentage
            ));
        }
        if !c.date_gaps.is_empty() {
            recs.push(format!(
                "{} date gaps detected; consider a different period or provider",
                c.date_gaps.len()
            ));
        }
        if k.ohlc_violations > 0 {
            recs.push(format!(
                "{} OHLC ordering violations; clean the dataset before use",
                k.ohlc_violations
            ));
        }
        if k.non_positive_prices > 0 {
            recs.push(format!(
                "{} bars with non-positive prices; verify the provider's adjustments",
                k.non_positive_prices
            ));
        }
        if k.negative_volume > 0 {
            recs.push(format!(
                "{} bars with negative volume; likely a provider issue",
                k.negative_volume
            ));
        }
        let anomaly_rate = report.anomalies.len() as f64 / report.data_points.max(1) as f64;
        if anomaly_rate > 0.05 {
            recs.push(format!(
                "High anomaly rate ({:.1}%); consider outlier removal",
                anomaly_rate * 100.0
            ));
        }
        if !report.large_moves.is_empty() {
            recs.push(format!(
                "{} close-to-close moves above {:.0}%; check for splits or bad ticks",
                report.large_moves.len(),
                self.max_price_change * 100.0
            ));
        }

        let score = report.composite_score;
        recs.push(if score < 0.7 {
            format!("Low overall quality ({score:.2}); use with caution")
        } else if score < 0.9 {
            format!("Acceptable quality ({score:.2}); minor issues present")
        } else {
            format!("Excellent data quality ({score:.2})")
        });
        recs
    }
}

fn completeness(bars: &[Bar], interval: Interval) -> CompletenessDetail {
    let total_cells = bars.len() * OHLCV_CELLS;
    let missing_cells: usize = bars.iter().map(Bar::missing_cells).sum();
    let date_gaps = bars
        .windows(2)
        .filter_map(|w| {
            let days = (w[1].date - w[0].date).num_days();
            (days > interval.step_days()).then(|| DateGap {
                after: w[0].date,
                before: w[1].date,
                days,
            })
        })
        .collect();

    CompletenessDetail {
        missing_cells,
        total_cells,
        missing_percentage: missing_cells as f64 / total_cells as f64 * 100.0,
        date_gaps,
    }
}

fn consistency(bars: &[Bar]) -> ConsistencyDetail {
    let ohlc_violations = bars
        .iter()
        .filter(|b| b.high < b.open.max(b.close) || b.low > b.open.min(b.close))
        .count();
    let non_positive_prices = bars
        .iter()
        .filter(|b| [b.open, b.high, b.low, b.close].iter().any(|p| *p <= 0.0))
        .count();
    let negative_volume = bars.iter().filter(|b| b.volume < 0.0).count();
    let zero_volume = bars.iter().filter(|b| b.volume == 0.0).count();

    let checks = [ohlc_violations, non_positive_prices, negative_volume];
    ConsistencyDetail {
        ohlc_violations,
        non_positive_prices,
        negative_volume,
        zero_volume,
        checks_passed: checks.iter().filter(|n| **n == 0).count(),
        checks_total: checks.len(),
    }
}

fn date_range(bars: &[Bar]) -> Option<DateWindow> {
    let first = bars.iter().map(|b| b.date).min()?;
    let last = bars.iter().map(|b| b.date).max()?;
    DateWindow::new(first, last)
}

fn statistics(bars: &[Bar]) -> BTreeMap<Field, ColumnStats> {
    let mut stats = BTreeMap::new();
    for field in Field::PRICE_AND_VOLUME {
        let mut values: Vec<f64> = bars
            .iter()
            .map(|b| field.value(b))
            .filter(|v| v.is_finite())
            .collect();
        let Some((mean, std)) = mean_std(&values) else {
            continue;
        };
        values.sort_by(f64::total_cmp);
        stats.insert(
            field,
            ColumnStats {
                count: values.len(),
                mean,
                std,
                min: values[0],
                max: values[values.len() - 1],
                median: quantile(&values, 0.5),
            },
        );
    }
    stats
}

fn pct_change(prev: f64, curr: f64) -> Option<f64> {
    (prev.is_finite() && curr.is_finite() && prev != 0.0).then(|| curr / prev - 1.0)
}

/// Mean and sample standard deviation (n - 1). `None` for empty input;
/// the deviation is 0 for a single value.
fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return Some((mean, 0.0));
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, var.sqrt()))
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// How [`remove_outliers`] decides what to drop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OutlierMethod {
    /// Keep closes within `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]`.
    Iqr,
    /// Keep closes whose z-score is at most `threshold`.
    ZScore { threshold: f64 },
}

/// Drop bars whose close is an outlier. Bars with a missing close are dropped too.
pub fn remove_outliers(bars: &[Bar], method: OutlierMethod) -> Vec<Bar> {
    let mut closes: Vec<f64> = bars
        .iter()
        .map(|b| b.close)
        .filter(|c| c.is_finite())
        .collect();
    if closes.is_empty() {
        return Vec::new();
    }

    let keep: Box<dyn Fn(f64) -> bool> = match method {
        OutlierMethod::Iqr => {
            closes.sort_by(f64::total_cmp);
            let q1 = quantile(&closes, 0.25);
            let q3 = quantile(&closes, 0.75);
            let iqr = q3 - q1;
            let (lo, hi) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
            Box::new(move |c| c >= lo && c <= hi)
        }
        OutlierMethod::ZScore { threshold } => match mean_std(&closes) {
            Some((mean, std)) if std > 0.0 => {
                Box::new(move |c| (c - mean).abs() / std <= threshold)
            }
            _ => Box::new(|_| true),
        },
    };

    bars.iter()
        .filter(|b| b.close.is_finite() && keep(b.close))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn series(closes: &[f64]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: "AAPL".into(),
                source: "yfinance".into(),
                date: start + Duration::days(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000.0,
                updated_at: start.and_hms_opt(0, 0, 0).unwrap(),
            })
            .collect()
    }

    fn wavy(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + (i % 2) as f64).collect()
    }

    fn analyze(bars: &[Bar]) -> QualityReport {
        QualityAnalyzer::default().analyze("AAPL", Interval::Daily, bars)
    }

    #[test]
    fn empty_dataset_scores_zero() {
        let r = analyze(&[]);
        assert_eq!(r.composite_score, 0.0);
        assert_eq!(r.data_points, 0);
        assert!(!r.recommendations.is_empty());
    }

    #[test]
    fn clean_series_is_excellent() {
        let r = analyze(&series(&wavy(30)));
        assert_eq!(r.completeness_score, 1.0);
        assert_eq!(r.consistency_score, 1.0);
        assert!(r.anomalies.is_empty());
        assert!((r.composite_score - 1.0).abs() < 1e-12);
        assert!(r.recommendations.last().unwrap().starts_with("Excellent"));
        assert_eq!(r.date_range.unwrap().calendar_days(), 30);
    }

    #[test]
    fn missing_cells_reduce_completeness() {
        let mut bars = series(&wavy(10));
        bars[3].volume = f64::NAN;
        let r = analyze(&bars);
        assert_eq!(r.completeness.missing_cells, 1);
        assert!((r.completeness_score - 0.98).abs() < 1e-12);
    }

    #[test]
    fn ohlc_violation_fails_one_check() {
        let mut bars = series(&wavy(10));
        bars[2].high = bars[2].close - 5.0;
        let r = analyze(&bars);
        assert_eq!(r.consistency.ohlc_violations, 1);
        assert!((r.consistency_score - 2.0 / 3.0).abs() < 1e-12);
        assert!(r.recommendations.iter().any(|s| s.contains("OHLC")));
    }

    #[test]
    fn negative_volume_and_prices_are_flagged() {
        let mut bars = series(&wavy(10));
        bars[1].volume = -10.0;
        bars[4].low = -1.0;
        let r = analyze(&bars);
        assert_eq!(r.consistency.negative_volume, 1);
        assert_eq!(r.consistency.non_positive_prices, 1);
        assert_eq!(r.consistency.checks_passed, 1);
    }

    #[test]
    fn zero_volume_is_reported_not_failed() {
        let mut bars = series(&wavy(10));
        bars[0].volume = 0.0;
        let r = analyze(&bars);
        assert_eq!(r.consistency.zero_volume, 1);
        assert_eq!(r.consistency_score, 1.0);
    }

    #[test]
    fn spike_is_detected_as_anomaly() {
        let mut closes = wavy(30);
        closes[20] = 200.0;
        let r = analyze(&series(&closes));
        let hit = r
            .anomalies
            .iter()
            .find(|a| a.field == Field::Close && a.index == 20)
            .expect("close spike flagged");
        assert!(hit.z_score > 3.0);
        assert_eq!(hit.value, 200.0);
        assert!(r.anomalies.iter().any(|a| a.field == Field::Returns));
        assert!(r.composite_score < 1.0 && r.composite_score >= 0.0);
        assert_eq!(r.large_moves.len(), 1);
    }

    #[test]
    fn gaps_beyond_interval_step() {
        let mut bars = series(&wavy(5));
        bars[3].date += Duration::days(3);
        bars[4].date += Duration::days(3);
        let r = analyze(&bars);
        assert_eq!(r.completeness.date_gaps.len(), 1);
        assert_eq!(r.completeness.date_gaps[0].days, 4);

        let weekly = QualityAnalyzer::default().analyze("AAPL", Interval::Weekly, &bars);
        assert!(weekly.completeness.date_gaps.is_empty());
    }

    #[test]
    fn statistics_cover_price_columns() {
        let r = analyze(&series(&[1.0, 2.0, 3.0]));
        let close = r.statistics[&Field::Close];
        assert_eq!(close.count, 3);
        assert_eq!(close.mean, 2.0);
        assert_eq!(close.median, 2.0);
        assert_eq!(close.std, 1.0);
        assert_eq!(close.min, 1.0);
    }

    #[test]
    fn text_report_mentions_scores() {
        let text = analyze(&series(&wavy(12))).render_text();
        assert!(text.contains("DATA QUALITY REPORT: AAPL"));
        assert!(text.contains("Composite score"));
        assert!(text.contains("RECOMMENDATIONS"));
    }

    #[test]
    fn iqr_drops_spike() {
        let mut closes = wavy(20);
        closes[7] = 500.0;
        let bars = series(&closes);
        let kept = remove_outliers(&bars, OutlierMethod::Iqr);
        assert_eq!(kept.len(), 19);
        assert!(kept.iter().all(|b| b.close < 500.0));
    }

    #[test]
    fn zscore_outlier_removal() {
        let mut closes = wavy(30);
        closes[3] = 300.0;
        let bars = series(&closes);
        let kept = remove_outliers(&bars, OutlierMethod::ZScore { threshold: 3.0 });
        assert_eq!(kept.len(), 29);
    }

    #[test]
    fn quantile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&v, 0.5), 2.5);
        assert_eq!(quantile(&v, 0.0), 1.0);
        assert_eq!(quantile(&v, 1.0), 4.0);
    }
}
