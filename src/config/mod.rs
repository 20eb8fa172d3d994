//! Configuration module
//!
//! Handles loading and validation of the application configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::risk::{default_specs, ParamKey, ParamSpec};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub trading: TradingConfig,
    /// Per-parameter overrides of the built-in risk table
    #[serde(default)]
    pub risk: BTreeMap<ParamKey, ParamOverride>,
    #[serde(default)]
    pub experience: ExperienceConfig,
    #[serde(default)]
    pub adaptation: AdaptationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default = "default_true")]
    pub paper_trading: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            risk: BTreeMap::new(),
            experience: ExperienceConfig::default(),
            adaptation: AdaptationConfig::default(),
            persistence: PersistenceConfig::default(),
            telemetry: TelemetryConfig::default(),
            paper_trading: true,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("No config file at {:?}, using defaults", path);
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.trading.symbols.is_empty(), "at least one symbol is required");
        anyhow::ensure!(self.trading.cycle_interval_secs > 0, "cycle_interval_secs must be positive");
        anyhow::ensure!(
            self.trading.reflection_interval_cycles > 0,
            "reflection_interval_cycles must be positive"
        );
        anyhow::ensure!(self.trading.lookback_bars > 0, "lookback_bars must be positive");
        anyhow::ensure!(self.trading.starting_cash > 0.0, "starting_cash must be positive");
        anyhow::ensure!(
            self.experience.similarity_tolerance > 0.0 && self.experience.similarity_tolerance <= 1.0,
            "similarity_tolerance must be between 0 and 1"
        );

        let a = &self.adaptation;
        anyhow::ensure!(a.window > 0, "adaptation.window must be positive");
        anyhow::ensure!(
            a.step_fraction > 0.0 && a.step_fraction < 1.0,
            "adaptation.step_fraction must be between 0 and 1"
        );
        anyhow::ensure!(
            a.decay_fraction > 0.0 && a.decay_fraction <= 1.0,
            "adaptation.decay_fraction must be between 0 and 1"
        );
        anyhow::ensure!(a.shadow_cycles > 0, "adaptation.shadow_cycles must be positive");
        anyhow::ensure!(
            a.impact_history >= a.rollback_run && a.impact_history >= a.decay_run,
            "adaptation.impact_history must cover rollback_run and decay_run"
        );
        anyhow::ensure!(a.audit_capacity > 0, "adaptation.audit_capacity must be positive");

        for (key, spec) in self.param_specs() {
            anyhow::ensure!(
                spec.min.is_finite() && spec.max.is_finite() && spec.min < spec.max,
                "{}: min must be below max",
                key
            );
            anyhow::ensure!(spec.contains(spec.default), "{}: default outside [{}, {}]", key, spec.min, spec.max);
        }
        for (key, value) in self.initial_values() {
            let spec = self.param_specs()[&key];
            anyhow::ensure!(spec.contains(value), "{}: value {} outside [{}, {}]", key, value, spec.min, spec.max);
        }
        Ok(())
    }

    /// Built-in parameter table with the configured bound overrides applied
    pub fn param_specs(&self) -> BTreeMap<ParamKey, ParamSpec> {
        let mut specs = default_specs();
        for (key, o) in &self.risk {
            if let Some(spec) = specs.get_mut(key) {
                if let Some(min) = o.min {
                    spec.min = min;
                }
                if let Some(max) = o.max {
                    spec.max = max;
                }
                if let Some(exposed) = o.exposed {
                    spec.exposed = exposed;
                }
            }
        }
        specs
    }

    /// Configured starting values, for parameters that override one
    pub fn initial_values(&self) -> BTreeMap<ParamKey, f64> {
        self.risk
            .iter()
            .filter_map(|(key, o)| o.value.map(|v| (*key, v)))
            .collect()
    }

    pub fn agent_state_path(&self) -> PathBuf {
        Path::new(&self.persistence.state_dir).join("agent_state.json")
    }

    pub fn experience_log_path(&self) -> PathBuf {
        Path::new(&self.persistence.state_dir).join("experience_log.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Controller runs every this many cycles
    #[serde(default = "default_reflection_interval")]
    pub reflection_interval_cycles: u64,
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: usize,
    /// Directory of `<SYMBOL>.json` bar files for the replay feed
    #[serde(default = "default_bars_dir")]
    pub bars_dir: String,
    #[serde(default = "default_starting_cash")]
    pub starting_cash: f64,
}

fn default_symbols() -> Vec<String> { vec!["SPY".to_string()] }
fn default_cycle_interval() -> u64 { 1800 }
fn default_reflection_interval() -> u64 { 7 }
fn default_lookback_bars() -> usize { 60 }
fn default_bars_dir() -> String { "data/bars".to_string() }
fn default_starting_cash() -> f64 { 10_000.0 }

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            cycle_interval_secs: default_cycle_interval(),
            reflection_interval_cycles: default_reflection_interval(),
            lookback_bars: default_lookback_bars(),
            bars_dir: default_bars_dir(),
            starting_cash: default_starting_cash(),
        }
    }
}

/// Override of one risk parameter; unset fields keep the built-in value
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ParamOverride {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub exposed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceConfig {
    #[serde(default = "default_similarity_tolerance")]
    pub similarity_tolerance: f64,
    #[serde(default = "default_max_similar_records")]
    pub max_similar_records: usize,
}

fn default_similarity_tolerance() -> f64 { 0.10 }
fn default_max_similar_records() -> usize { 5 }

impl Default for ExperienceConfig {
    fn default() -> Self {
        Self {
            similarity_tolerance: default_similarity_tolerance(),
            max_similar_records: default_max_similar_records(),
        }
    }
}

/// Adaptive controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationConfig {
    /// Resolved trades averaged per run
    #[serde(default = "default_window")]
    pub window: usize,
    /// Performance nudge as a fraction of the current risk value
    #[serde(default = "default_step_fraction")]
    pub step_fraction: f64,
    /// Buy threshold increment after losses
    #[serde(default = "default_sentiment_step")]
    pub sentiment_step: f64,
    /// Buy threshold is not tightened past this
    #[serde(default = "default_sentiment_cap")]
    pub sentiment_cap: f64,
    /// Impact samples kept per parameter
    #[serde(default = "default_impact_history")]
    pub impact_history: usize,
    #[serde(default = "default_run")]
    pub rollback_run: usize,
    #[serde(default = "default_run")]
    pub decay_run: usize,
    #[serde(default = "default_decay_fraction")]
    pub decay_fraction: f64,
    #[serde(default = "default_reinforcement_window")]
    pub reinforcement_window: usize,
    #[serde(default = "default_shadow_cycles")]
    pub shadow_cycles: usize,
    #[serde(default = "default_run_u64")]
    pub digest_every: u64,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
    #[serde(default = "default_run")]
    pub frequent_window: usize,
    #[serde(default = "default_frequent_limit")]
    pub frequent_limit: usize,
    #[serde(default = "default_window")]
    pub stagnation_window: usize,
    #[serde(default = "default_error_streak_limit")]
    pub error_streak_limit: usize,
}

fn default_window() -> usize { 20 }
fn default_step_fraction() -> f64 { 0.05 }
fn default_sentiment_step() -> f64 { 2.0 }
fn default_sentiment_cap() -> f64 { 60.0 }
fn default_impact_history() -> usize { 20 }
fn default_run() -> usize { 10 }
fn default_run_u64() -> u64 { 10 }
fn default_decay_fraction() -> f64 { 0.1 }
fn default_reinforcement_window() -> usize { 3 }
fn default_shadow_cycles() -> usize { 5 }
fn default_audit_capacity() -> usize { 500 }
fn default_frequent_limit() -> usize { 5 }
fn default_error_streak_limit() -> usize { 3 }

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            step_fraction: default_step_fraction(),
            sentiment_step: default_sentiment_step(),
            sentiment_cap: default_sentiment_cap(),
            impact_history: default_impact_history(),
            rollback_run: default_run(),
            decay_run: default_run(),
            decay_fraction: default_decay_fraction(),
            reinforcement_window: default_reinforcement_window(),
            shadow_cycles: default_shadow_cycles(),
            digest_every: default_run_u64(),
            audit_capacity: default_audit_capacity(),
            frequent_window: default_run(),
            frequent_limit: default_frequent_limit(),
            stagnation_window: default_window(),
            error_streak_limit: default_error_streak_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_state_dir() -> String { "data".to_string() }

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { state_dir: default_state_dir() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_alerts: bool,
    #[serde(default)]
    pub alert_webhook: Option<String>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            log_file: None,
            metrics_port: default_metrics_port(),
            enable_metrics: false,
            enable_alerts: false,
            alert_webhook: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.paper_trading);
        assert_eq!(config.adaptation.shadow_cycles, 5);
        assert_eq!(config.agent_state_path(), PathBuf::from("data/agent_state.json"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
trading:
  symbols: [AAPL, MSFT]
risk:
  max_risk_per_trade_percent:
    value: 0.02
  min_sentiment_for_buy:
    max: 70
adaptation:
  shadow_cycles: 3
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(config.trading.cycle_interval_secs, 1800);
        assert_eq!(config.adaptation.shadow_cycles, 3);
        assert_eq!(config.adaptation.window, 20);
        assert_eq!(config.param_specs()[&ParamKey::MinSentimentForBuy].max, 70.0);
        assert_eq!(config.initial_values()[&ParamKey::MaxRiskPerTradePercent], 0.02);
    }

    #[test]
    fn test_rejects_inverted_bounds_and_out_of_range_values() {
        let mut config = AppConfig::default();
        config.risk.insert(
            ParamKey::MaxRiskPerTradePercent,
            ParamOverride { min: Some(0.2), ..Default::default() },
        );
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.risk.insert(
            ParamKey::MinSentimentForBuy,
            ParamOverride { value: Some(95.0), ..Default::default() },
        );
        assert!(config.validate().is_err());
    }
}
