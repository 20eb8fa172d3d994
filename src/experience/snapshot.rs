//! Market state snapshot used as the similarity key

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::indicators::{Indicator, IndicatorFrame};
use crate::utils::helpers::{relative_difference, RELATIVE_EPSILON};

/// Bars spanned by the short-term price change
pub const PRICE_CHANGE_BARS: usize = 5;

/// MACD line relative to its signal line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacdCross {
    BullishCross,
    BearishCross,
    Bullish,
    Bearish,
    Neutral,
}

impl MacdCross {
    /// Classify from the latest and previous (line, signal) pairs
    pub fn classify(latest: (f64, f64), previous: Option<(f64, f64)>) -> Self {
        let (macd, signal) = latest;
        let crossed_up = previous.is_some_and(|(m, s)| m <= s);
        let crossed_down = previous.is_some_and(|(m, s)| m >= s);
        if macd > signal && crossed_up {
            MacdCross::BullishCross
        } else if macd < signal && crossed_down {
            MacdCross::BearishCross
        } else if macd > signal {
            MacdCross::Bullish
        } else if macd < signal {
            MacdCross::Bearish
        } else {
            MacdCross::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MacdCross::BullishCross => "bullish_cross",
            MacdCross::BearishCross => "bearish_cross",
            MacdCross::Bullish => "bullish",
            MacdCross::Bearish => "bearish",
            MacdCross::Neutral => "neutral",
        }
    }
}

impl fmt::Display for MacdCross {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicator values at decision time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStateSnapshot {
    pub symbol: String,
    pub current_price: f64,
    #[serde(default)]
    pub rsi: Option<f64>,
    #[serde(default)]
    pub macd_signal: Option<MacdCross>,
    /// Fractional change over the last five bars
    #[serde(default)]
    pub price_change_5d: Option<f64>,
}

impl MarketStateSnapshot {
    /// Build from the latest rows of an indicator frame. `None` for an empty frame.
    pub fn from_frame(symbol: &str, frame: &IndicatorFrame) -> Option<Self> {
        let bars = frame.bars();
        let current_price = frame.latest_close()?;

        let macd_signal = match (frame.latest(Indicator::Macd), frame.latest(Indicator::MacdSignal)) {
            (Some(line), Some(signal)) => {
                let previous = frame
                    .previous(Indicator::Macd)
                    .zip(frame.previous(Indicator::MacdSignal));
                Some(MacdCross::classify((line, signal), previous))
            }
            _ => None,
        };

        let price_change_5d = if bars.len() >= PRICE_CHANGE_BARS {
            let base = bars[bars.len() - PRICE_CHANGE_BARS].close;
            (base != 0.0).then(|| (current_price - base) / base)
        } else {
            Some(0.0)
        };

        Some(Self {
            symbol: symbol.to_string(),
            current_price,
            rsi: frame.latest(Indicator::Rsi),
            macd_signal,
            price_change_5d,
        })
    }

    /// All three similarity keys are present
    pub fn is_complete(&self) -> bool {
        self.rsi.is_some() && self.macd_signal.is_some() && self.price_change_5d.is_some()
    }

    /// Same symbol, identical MACD label, RSI and price change within
    /// `tolerance` relative difference. Incomplete snapshots never match.
    pub fn is_similar(&self, other: &MarketStateSnapshot, tolerance: f64) -> bool {
        let (Some(rsi), Some(macd), Some(change)) = (self.rsi, self.macd_signal, self.price_change_5d) else {
            return false;
        };
        let (Some(other_rsi), Some(other_macd), Some(other_change)) =
            (other.rsi, other.macd_signal, other.price_change_5d)
        else {
            return false;
        };
        if self.symbol != other.symbol || macd != other_macd {
            return false;
        }
        rsi_difference(rsi, other_rsi) <= tolerance && relative_difference(change, other_change) <= tolerance
    }
}

/// RSI lives in [0, 100] so the larger raw value is the scale
fn rsi_difference(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.max(b).max(RELATIVE_EPSILON)
}
