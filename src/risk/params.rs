//! Risk parameter catalogue
//!
//! Every adaptable threshold is identified by a [`ParamKey`] and carries a
//! [`ParamSpec`]: its documented default, the admissible closed interval, and
//! how the adaptive controller is allowed to treat it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Names of the live risk parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKey {
    MaxRiskPerTradePercent,
    MinSentimentForBuy,
    MinSentimentForSell,
    MaxPositionPerAssetPercent,
    MinSentimentForSizeIncrease,
    SentimentSizingFactor,
    AtrStopMultiplier,
}

impl ParamKey {
    pub const ALL: [ParamKey; 7] = [
        ParamKey::MaxRiskPerTradePercent,
        ParamKey::MinSentimentForBuy,
        ParamKey::MinSentimentForSell,
        ParamKey::MaxPositionPerAssetPercent,
        ParamKey::MinSentimentForSizeIncrease,
        ParamKey::SentimentSizingFactor,
        ParamKey::AtrStopMultiplier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKey::MaxRiskPerTradePercent => "max_risk_per_trade_percent",
            ParamKey::MinSentimentForBuy => "min_sentiment_for_buy",
            ParamKey::MinSentimentForSell => "min_sentiment_for_sell",
            ParamKey::MaxPositionPerAssetPercent => "max_position_per_asset_percent",
            ParamKey::MinSentimentForSizeIncrease => "min_sentiment_for_size_increase",
            ParamKey::SentimentSizingFactor => "sentiment_sizing_factor",
            ParamKey::AtrStopMultiplier => "atr_stop_multiplier",
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParamKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| format!("Unknown risk parameter: {}", s))
    }
}

/// Static description of one risk parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Documented default, also the decay target
    pub default: f64,
    /// Lower bound of the admissible interval
    pub min: f64,
    /// Upper bound of the admissible interval
    pub max: f64,
    /// Whether the advisor may propose values for it
    #[serde(default)]
    pub exposed: bool,
    /// Absolute change above which a proposal is shadow-tested first
    #[serde(default)]
    pub shadow_threshold: Option<f64>,
    /// Swing between consecutive samples that counts as volatile
    #[serde(default)]
    pub volatility_delta: Option<f64>,
    /// Whether impact samples are recorded for rollback/decay/anomalies
    #[serde(default)]
    pub tracked: bool,
}

impl ParamSpec {
    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn is_at_bound(&self, value: f64) -> bool {
        value == self.min || value == self.max
    }
}

/// Built-in parameter table
pub fn default_specs() -> BTreeMap<ParamKey, ParamSpec> {
    let mut specs = BTreeMap::new();
    specs.insert(
        ParamKey::MaxRiskPerTradePercent,
        ParamSpec {
            default: 0.05,
            min: 0.01,
            max: 0.10,
            exposed: true,
            shadow_threshold: Some(0.03),
            volatility_delta: Some(0.05),
            tracked: true,
        },
    );
    specs.insert(
        ParamKey::MinSentimentForBuy,
        ParamSpec {
            default: 40.0,
            min: 10.0,
            max: 80.0,
            exposed: true,
            shadow_threshold: None,
            volatility_delta: Some(20.0),
            tracked: true,
        },
    );
    specs.insert(
        ParamKey::MinSentimentForSell,
        ParamSpec {
            default: -40.0,
            min: -80.0,
            max: -10.0,
            exposed: true,
            shadow_threshold: None,
            volatility_delta: Some(20.0),
            tracked: false,
        },
    );
    specs.insert(
        ParamKey::MaxPositionPerAssetPercent,
        ParamSpec {
            default: 0.05,
            min: 0.01,
            max: 0.20,
            exposed: true,
            shadow_threshold: Some(0.03),
            volatility_delta: Some(0.05),
            tracked: true,
        },
    );
    specs.insert(
        ParamKey::MinSentimentForSizeIncrease,
        ParamSpec {
            default: 50.0,
            min: 0.0,
            max: 100.0,
            exposed: true,
            shadow_threshold: None,
            volatility_delta: None,
            tracked: false,
        },
    );
    specs.insert(
        ParamKey::SentimentSizingFactor,
        ParamSpec {
            default: 0.005,
            min: 0.0,
            max: 0.05,
            exposed: true,
            shadow_threshold: None,
            volatility_delta: None,
            tracked: false,
        },
    );
    specs.insert(
        ParamKey::AtrStopMultiplier,
        ParamSpec {
            default: 2.0,
            min: 0.5,
            max: 5.0,
            exposed: false,
            shadow_threshold: None,
            volatility_delta: None,
            tracked: false,
        },
    );
    specs
}
