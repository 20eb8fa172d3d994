//! Indicator engine
//!
//! Augments an OHLCV series with named indicator columns:
//! - SMA 20 / SMA 50
//! - RSI 14 (Wilder smoothing)
//! - MACD 12/26 with a 9-period signal line and histogram
//! - ATR 14 (Wilder smoothing)
//! - Bollinger bands 20 / 2 standard deviations
//!
//! An indicator that cannot be computed (too few bars, bad data) is skipped
//! with a log line; the remaining columns are still produced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::utils::Bar;

pub const SMA_SHORT: usize = 20;
pub const SMA_LONG: usize = 50;
pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const ATR_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_WIDTH: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("{indicator} needs {needed} bars, have {available}")]
    InsufficientData {
        indicator: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{0} encountered a non-finite input")]
    NonFinite(&'static str),
}

/// Indicator columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Indicator {
    Sma20,
    Sma50,
    Rsi,
    Macd,
    MacdSignal,
    MacdHist,
    Atr,
    BollingerUpper,
    BollingerMiddle,
    BollingerLower,
}

impl Indicator {
    pub fn column_name(&self) -> &'static str {
        match self {
            Indicator::Sma20 => "SMA_20",
            Indicator::Sma50 => "SMA_50",
            Indicator::Rsi => "RSI",
            Indicator::Macd => "MACD",
            Indicator::MacdSignal => "MACD_Signal",
            Indicator::MacdHist => "MACD_Hist",
            Indicator::Atr => "ATR",
            Indicator::BollingerUpper => "BB_Upper",
            Indicator::BollingerMiddle => "BB_Middle",
            Indicator::BollingerLower => "BB_Lower",
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

type Column = Vec<Option<f64>>;

/// One row of the augmented series, as shown to the advisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub close: f64,
    pub values: BTreeMap<String, f64>,
}

/// Bars plus whichever indicator columns could be computed
#[derive(Debug, Clone, Default)]
pub struct IndicatorFrame {
    bars: Vec<Bar>,
    columns: BTreeMap<Indicator, Column>,
}

impl IndicatorFrame {
    pub fn compute(bars: Vec<Bar>) -> Self {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut frame = Self {
            bars,
            columns: BTreeMap::new(),
        };

        frame.insert(Indicator::Sma20, sma(&closes, SMA_SHORT));
        frame.insert(Indicator::Sma50, sma(&closes, SMA_LONG));
        frame.insert(Indicator::Rsi, rsi(&closes, RSI_PERIOD));
        match macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL) {
            Ok((line, signal, hist)) => {
                frame.columns.insert(Indicator::Macd, line);
                frame.columns.insert(Indicator::MacdSignal, signal);
                frame.columns.insert(Indicator::MacdHist, hist);
            }
            Err(e) => debug!("Skipping MACD: {}", e),
        }
        let atr_column = atr(&frame.bars, ATR_PERIOD);
        frame.insert(Indicator::Atr, atr_column);
        match bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_WIDTH) {
            Ok((upper, middle, lower)) => {
                frame.columns.insert(Indicator::BollingerUpper, upper);
                frame.columns.insert(Indicator::BollingerMiddle, middle);
                frame.columns.insert(Indicator::BollingerLower, lower);
            }
            Err(e) => debug!("Skipping Bollinger bands: {}", e),
        }

        frame
    }

    fn insert(&mut self, indicator: Indicator, column: Result<Column, IndicatorError>) {
        match column {
            Ok(values) => {
                self.columns.insert(indicator, values);
            }
            Err(e) => debug!("Skipping {}: {}", indicator, e),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn has(&self, indicator: Indicator) -> bool {
        self.columns.contains_key(&indicator)
    }

    pub fn column(&self, indicator: Indicator) -> Option<&[Option<f64>]> {
        self.columns.get(&indicator).map(|c| c.as_slice())
    }

    pub fn at(&self, indicator: Indicator, index: usize) -> Option<f64> {
        self.columns.get(&indicator)?.get(index).copied().flatten()
    }

    pub fn latest(&self, indicator: Indicator) -> Option<f64> {
        self.at(indicator, self.len().checked_sub(1)?)
    }

    pub fn previous(&self, indicator: Indicator) -> Option<f64> {
        self.at(indicator, self.len().checked_sub(2)?)
    }

    pub fn latest_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }

    /// The last `n` rows with every available indicator value
    pub fn recent_rows(&self, n: usize) -> Vec<IndicatorRow> {
        let start = self.len().saturating_sub(n);
        (start..self.len())
            .map(|i| IndicatorRow {
                timestamp: self.bars[i].timestamp,
                close: self.bars[i].close,
                values: self
                    .columns
                    .iter()
                    .filter_map(|(ind, col)| col[i].map(|v| (ind.column_name().to_string(), v)))
                    .collect(),
            })
            .collect()
    }
}

fn ensure_len(indicator: &'static str, values_len: usize, needed: usize) -> Result<(), IndicatorError> {
    if values_len < needed || needed == 0 {
        return Err(IndicatorError::InsufficientData {
            indicator,
            needed,
            available: values_len,
        });
    }
    Ok(())
}

fn ensure_finite(indicator: &'static str, values: &[f64]) -> Result<(), IndicatorError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(IndicatorError::NonFinite(indicator))
    }
}

pub fn sma(values: &[f64], period: usize) -> Result<Column, IndicatorError> {
    ensure_len("SMA", values.len(), period)?;
    ensure_finite("SMA", values)?;
    let mut out = vec![None; values.len()];
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / period as f64);
    }
    Ok(out)
}

/// EMA seeded with the SMA of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Result<Column, IndicatorError> {
    ensure_len("EMA", values.len(), period)?;
    ensure_finite("EMA", values)?;
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = vec![None; values.len()];
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(prev);
    for i in period..values.len() {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = Some(prev);
    }
    Ok(out)
}

/// Wilder smoothing seeded with the plain average of the first `period` values
fn wilder(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len().saturating_sub(period) + 1);
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    out.push(prev);
    for v in &values[period..] {
        prev = (prev * (period as f64 - 1.0) + v) / period as f64;
        out.push(prev);
    }
    out
}

pub fn rsi(closes: &[f64], period: usize) -> Result<Column, IndicatorError> {
    ensure_len("RSI", closes.len(), period + 1)?;
    ensure_finite("RSI", closes)?;
    let (gains, losses): (Vec<f64>, Vec<f64>) = closes
        .windows(2)
        .map(|w| {
            let change = w[1] - w[0];
            (change.max(0.0), (-change).max(0.0))
        })
        .unzip();
    let avg_gain = wilder(&gains, period);
    let avg_loss = wilder(&losses, period);

    let mut out = vec![None; closes.len()];
    for (k, (g, l)) in avg_gain.iter().zip(avg_loss.iter()).enumerate() {
        let value = if *l == 0.0 {
            if *g == 0.0 { 50.0 } else { 100.0 }
        } else {
            100.0 - 100.0 / (1.0 + g / l)
        };
        out[period + k] = Some(value);
    }
    Ok(out)
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Result<(Column, Column, Column), IndicatorError> {
    ensure_len("MACD", closes.len(), slow + signal - 1)?;
    let fast_ema = ema(closes, fast)?;
    let slow_ema = ema(closes, slow)?;
    let line: Column = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    let first = slow - 1;
    let defined: Vec<f64> = line[first..].iter().flatten().copied().collect();
    let signal_tail = ema(&defined, signal)?;
    let mut signal_line = vec![None; closes.len()];
    for (k, v) in signal_tail.into_iter().enumerate() {
        signal_line[first + k] = v;
    }
    let hist = line
        .iter()
        .zip(signal_line.iter())
        .map(|(m, s)| Some((*m)? - (*s)?))
        .collect();
    Ok((line, signal_line, hist))
}

pub fn atr(bars: &[Bar], period: usize) -> Result<Column, IndicatorError> {
    ensure_len("ATR", bars.len(), period + 1)?;
    let true_ranges: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let bar = &w[1];
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .collect();
    ensure_finite("ATR", &true_ranges)?;
    let mut out = vec![None; bars.len()];
    for (k, v) in wilder(&true_ranges, period).into_iter().enumerate() {
        out[period + k] = Some(v);
    }
    Ok(out)
}

pub fn bollinger(closes: &[f64], period: usize, width: f64) -> Result<(Column, Column, Column), IndicatorError> {
    let middle = sma(closes, period)?;
    let mut upper = vec![None; closes.len()];
    let mut lower = vec![None; closes.len()];
    for i in (period - 1)..closes.len() {
        if let Some(mean) = middle[i] {
            let window = &closes[i + 1 - period..=i];
            let variance = window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
            let band = width * variance.sqrt();
            upper[i] = Some(mean + band);
            lower[i] = Some(mean - band);
        }
    }
    Ok((upper, middle, lower))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    pub(crate) fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                timestamp: start + Duration::days(i as i64),
                open: *c,
                high: c + 1.0,
                low: c - 1.0,
                close: *c,
                volume: 1_000.0,
            })
            .collect()
    }

    #[test]
    fn test_sma() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0], 2).unwrap();
        assert_eq!(out, vec![None, Some(1.5), Some(2.5), Some(3.5)]);
        assert!(sma(&[1.0], 2).is_err());
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&rising, 14).unwrap().last().copied().flatten(), Some(100.0));
        let flat = vec![50.0; 30];
        assert_eq!(rsi(&flat, 14).unwrap().last().copied().flatten(), Some(50.0));
        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let value = rsi(&falling, 14).unwrap().last().copied().flatten().unwrap();
        assert!(value < 1e-9);
    }

    #[test]
    fn test_atr_constant_range() {
        let bars = bars_from_closes(&vec![100.0; 20]);
        let out = atr(&bars, 14).unwrap();
        assert_eq!(out[13], None);
        assert!((out[19].unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_bollinger_flat_series_has_zero_width() {
        let (upper, middle, lower) = bollinger(&vec![10.0; 25], 20, 2.0).unwrap();
        assert_eq!(upper[24], Some(10.0));
        assert_eq!(middle[24], Some(10.0));
        assert_eq!(lower[24], Some(10.0));
    }

    #[test]
    fn test_short_series_skips_long_indicators() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let frame = IndicatorFrame::compute(bars_from_closes(&closes));
        assert!(frame.has(Indicator::Sma20));
        assert!(frame.has(Indicator::Rsi));
        assert!(!frame.has(Indicator::Sma50));
        assert!(!frame.has(Indicator::Macd));
        assert_eq!(frame.latest(Indicator::Sma50), None);
    }

    #[test]
    fn test_full_series_has_every_column() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        let frame = IndicatorFrame::compute(bars_from_closes(&closes));
        for ind in [Indicator::Sma50, Indicator::Macd, Indicator::MacdSignal, Indicator::Atr, Indicator::BollingerUpper] {
            assert!(frame.latest(ind).is_some(), "{} missing", ind);
        }
        let rows = frame.recent_rows(5);
        assert_eq!(rows.len(), 5);
        assert!(rows[4].values.contains_key("RSI"));
    }

    #[test]
    fn test_empty_frame() {
        let frame = IndicatorFrame::compute(Vec::new());
        assert!(frame.is_empty());
        assert_eq!(frame.latest_close(), None);
        assert_eq!(frame.previous(Indicator::Rsi), None);
    }
}
