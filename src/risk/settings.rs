//! Live risk settings
//!
//! `RiskSettings` owns one [`RiskParameter`] per [`ParamKey`]. The only way
//! to change a value is [`RiskSettings::set`], which clamps into the
//! parameter's admissible interval, so no code path can store an
//! out-of-range value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

use super::params::{default_specs, ParamKey, ParamSpec};

/// Rejected risk writes
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("non-finite value {value} proposed for {key}")]
    NonFinite { key: ParamKey, value: f64 },
    #[error("parameter {0} is not configured")]
    Unconfigured(ParamKey),
}

/// One named parameter with its current value and bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskParameter {
    pub key: ParamKey,
    pub value: f64,
    pub spec: ParamSpec,
}

impl RiskParameter {
    pub fn min(&self) -> f64 {
        self.spec.min
    }

    pub fn max(&self) -> f64 {
        self.spec.max
    }

    pub fn exposed(&self) -> bool {
        self.spec.exposed
    }

    pub fn is_at_bound(&self) -> bool {
        self.spec.is_at_bound(self.value)
    }
}

/// Result of a clamped write
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampedWrite {
    pub key: ParamKey,
    pub previous: f64,
    pub proposed: f64,
    pub applied: f64,
}

impl ClampedWrite {
    pub fn was_clamped(&self) -> bool {
        self.proposed != self.applied
    }

    pub fn changed(&self) -> bool {
        self.previous != self.applied
    }
}

/// Complete parameter set consulted by sizing and decisions
#[derive(Debug, Clone, PartialEq)]
pub struct RiskSettings {
    params: BTreeMap<ParamKey, RiskParameter>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self::from_specs(&default_specs())
    }
}

impl RiskSettings {
    /// Build settings at their defaults. Keys absent from `specs` fall back
    /// to the built-in table so the set is always complete.
    pub fn from_specs(specs: &BTreeMap<ParamKey, ParamSpec>) -> Self {
        let builtin = default_specs();
        let params = ParamKey::ALL
            .iter()
            .map(|key| {
                let spec = specs.get(key).or_else(|| builtin.get(key)).copied().unwrap_or_default();
                (*key, RiskParameter { key: *key, value: spec.clamp(spec.default), spec })
            })
            .collect();
        Self { params }
    }

    /// Restore persisted values on top of `specs`. Each value is clamped to
    /// the current bounds; non-finite values keep the default.
    pub fn with_values(specs: &BTreeMap<ParamKey, ParamSpec>, values: &BTreeMap<ParamKey, f64>) -> Self {
        let mut settings = Self::from_specs(specs);
        for (key, value) in values {
            if let Err(e) = settings.set(*key, *value) {
                warn!(param = %key, "Persisted value ignored, keeping {}: {}", settings.get(*key), e);
            }
        }
        settings
    }

    pub fn param(&self, key: ParamKey) -> &RiskParameter {
        &self.params[&key]
    }

    pub fn get(&self, key: ParamKey) -> f64 {
        self.param(key).value
    }

    pub fn spec(&self, key: ParamKey) -> &ParamSpec {
        &self.param(key).spec
    }

    /// Clamp `proposed` into the admissible interval and store it
    pub fn set(&mut self, key: ParamKey, proposed: f64) -> Result<ClampedWrite, RiskError> {
        if !proposed.is_finite() {
            return Err(RiskError::NonFinite { key, value: proposed });
        }
        let Some(param) = self.params.get_mut(&key) else {
            return Err(RiskError::Unconfigured(key));
        };
        let previous = param.value;
        let applied = param.spec.clamp(proposed);
        param.value = applied;
        Ok(ClampedWrite { key, previous, proposed, applied })
    }

    pub fn iter(&self) -> impl Iterator<Item = &RiskParameter> {
        self.params.values()
    }

    /// Plain key/value view used for persistence and reporting
    pub fn values(&self) -> BTreeMap<ParamKey, f64> {
        self.params.iter().map(|(k, p)| (*k, p.value)).collect()
    }

    pub fn max_risk_per_trade_percent(&self) -> f64 {
        self.get(ParamKey::MaxRiskPerTradePercent)
    }

    pub fn min_sentiment_for_buy(&self) -> f64 {
        self.get(ParamKey::MinSentimentForBuy)
    }

    pub fn min_sentiment_for_sell(&self) -> f64 {
        self.get(ParamKey::MinSentimentForSell)
    }

    pub fn max_position_per_asset_percent(&self) -> f64 {
        self.get(ParamKey::MaxPositionPerAssetPercent)
    }

    pub fn min_sentiment_for_size_increase(&self) -> f64 {
        self.get(ParamKey::MinSentimentForSizeIncrease)
    }

    pub fn sentiment_sizing_factor(&self) -> f64 {
        self.get(ParamKey::SentimentSizingFactor)
    }

    pub fn atr_stop_multiplier(&self) -> f64 {
        self.get(ParamKey::AtrStopMultiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_loaded() {
        let settings = RiskSettings::default();
        assert_eq!(settings.max_risk_per_trade_percent(), 0.05);
        assert_eq!(settings.min_sentiment_for_sell(), -40.0);
        assert_eq!(settings.atr_stop_multiplier(), 2.0);
    }

    #[test]
    fn test_set_clamps_to_ceiling() {
        let mut settings = RiskSettings::default();
        let write = settings.set(ParamKey::MaxRiskPerTradePercent, 0.5).unwrap();
        assert_eq!(write.applied, 0.10);
        assert_eq!(write.proposed, 0.5);
        assert!(write.was_clamped());
        assert!(settings.param(ParamKey::MaxRiskPerTradePercent).is_at_bound());
    }

    #[test]
    fn test_set_rejects_nan() {
        let mut settings = RiskSettings::default();
        assert!(settings.set(ParamKey::MinSentimentForBuy, f64::NAN).is_err());
        assert_eq!(settings.min_sentiment_for_buy(), 40.0);
    }

    #[test]
    fn test_with_values_clamps_persisted_state() {
        let mut values = BTreeMap::new();
        values.insert(ParamKey::MinSentimentForBuy, 95.0);
        values.insert(ParamKey::SentimentSizingFactor, 0.01);
        let settings = RiskSettings::with_values(&default_specs(), &values);
        assert_eq!(settings.min_sentiment_for_buy(), 80.0);
        assert_eq!(settings.sentiment_sizing_factor(), 0.01);
    }

    #[test]
    fn test_with_values_skips_non_finite() {
        let mut values = BTreeMap::new();
        values.insert(ParamKey::MaxRiskPerTradePercent, f64::NAN);
        values.insert(ParamKey::MinSentimentForSell, f64::NEG_INFINITY);
        values.insert(ParamKey::MinSentimentForBuy, 55.0);
        let settings = RiskSettings::with_values(&default_specs(), &values);
        assert_eq!(settings.max_risk_per_trade_percent(), 0.05);
        assert_eq!(settings.min_sentiment_for_sell(), -40.0);
        assert_eq!(settings.min_sentiment_for_buy(), 55.0);
    }

    #[test]
    fn test_partial_specs_are_completed() {
        let mut specs = BTreeMap::new();
        specs.insert(
            ParamKey::MaxRiskPerTradePercent,
            ParamSpec {
                default: 0.01,
                min: 0.005,
                max: 0.02,
                exposed: true,
                shadow_threshold: None,
                volatility_delta: None,
                tracked: true,
            },
        );
        let settings = RiskSettings::from_specs(&specs);
        assert_eq!(settings.max_risk_per_trade_percent(), 0.01);
        assert_eq!(settings.values().len(), ParamKey::ALL.len());
    }
}
