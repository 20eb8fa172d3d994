//! Anomaly detectors
//!
//! Each detector is a pure function over the controller state after a
//! run's mutations. Findings are numbered and stored by the controller.

use std::collections::BTreeSet;

use super::events::{AdaptationKind, AnomalyKind};
use super::state::{ControllerState, ImpactSample};
use crate::config::AdaptationConfig;
use crate::risk::{ParamKey, RiskSettings};

/// Samples inspected for volatility and oscillation
pub const VOLATILITY_SAMPLES: usize = 5;
/// Reflections inspected for an error streak
pub const REFLECTION_MEMORY: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub kind: AnomalyKind,
    pub param: Option<ParamKey>,
    pub details: String,
}

impl Finding {
    fn new(kind: AnomalyKind, param: Option<ParamKey>, details: String) -> Self {
        Self { kind, param, details }
    }

    /// Findings that slow down the next run
    pub fn is_instability(&self) -> bool {
        matches!(self.kind, AnomalyKind::LlmVolatility | AnomalyKind::LlmOscillation)
    }
}

/// Run every detector. `changed` holds the parameters written during this run.
pub fn detect(
    state: &ControllerState,
    settings: &RiskSettings,
    config: &AdaptationConfig,
    changed: &BTreeSet<ParamKey>,
    updated_this_run: bool,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    if updated_this_run {
        if let Some(f) = frequent_adaptations(state, config) {
            findings.push(f);
        }
    }

    for key in changed {
        let param = settings.param(*key);
        if param.is_at_bound() {
            findings.push(Finding::new(
                AnomalyKind::RiskParamLimit,
                Some(*key),
                format!("{} reached its limit {} (range {} to {})", key, param.value, param.min(), param.max()),
            ));
        }
    }

    for key in ParamKey::ALL {
        let spec = settings.spec(key);
        if !spec.tracked {
            continue;
        }
        let samples = state.samples(key);
        if let Some(delta) = spec.volatility_delta {
            if let Some(f) = volatility(key, samples, delta) {
                findings.push(f);
            }
        }
        if let Some(f) = oscillation(key, samples) {
            findings.push(f);
        }
        if let Some(f) = stuck(key, samples, config.decay_run) {
            findings.push(f);
        }
    }

    if let Some(f) = stagnation(state, config) {
        findings.push(f);
    }
    if let Some(f) = error_streak(state, config) {
        findings.push(f);
    }

    findings
}

fn frequent_adaptations(state: &ControllerState, config: &AdaptationConfig) -> Option<Finding> {
    let recent = tail(&state.audit_trail, config.frequent_window);
    let updates = recent.iter().filter(|e| e.kind == AdaptationKind::ParamUpdate).count();
    (updates > config.frequent_limit).then(|| {
        Finding::new(
            AnomalyKind::FrequentAdaptations,
            None,
            format!("{} parameter updates in the last {} adaptation events", updates, recent.len()),
        )
    })
}

fn volatility(key: ParamKey, samples: &[ImpactSample], delta: f64) -> Option<Finding> {
    let recent = tail(samples, VOLATILITY_SAMPLES);
    let swing = recent
        .windows(2)
        .map(|w| (w[1].value - w[0].value).abs())
        .fold(0.0_f64, f64::max);
    (swing > delta).then(|| {
        Finding::new(
            AnomalyKind::LlmVolatility,
            Some(key),
            format!("{} swung by {:.4} (limit {}) within {} samples", key, swing, delta, recent.len()),
        )
    })
}

fn oscillation(key: ParamKey, samples: &[ImpactSample]) -> Option<Finding> {
    let recent = tail(samples, VOLATILITY_SAMPLES);
    if recent.len() < VOLATILITY_SAMPLES {
        return None;
    }
    let deltas: Vec<f64> = recent.windows(2).map(|w| w[1].value - w[0].value).collect();
    let alternating = deltas.iter().all(|d| *d != 0.0)
        && deltas.windows(2).all(|w| w[0].signum() != w[1].signum());
    alternating.then(|| {
        Finding::new(
            AnomalyKind::LlmOscillation,
            Some(key),
            format!("{} changes alternate direction across the last {} samples", key, recent.len()),
        )
    })
}

fn stuck(key: ParamKey, samples: &[ImpactSample], run: usize) -> Option<Finding> {
    if run == 0 || samples.len() < run {
        return None;
    }
    let recent = tail(samples, run);
    let first = recent[0].value;
    if !recent.iter().all(|s| s.value == first) {
        return None;
    }
    let cumulative: f64 = recent.iter().map(|s| s.avg_pl).sum();
    (cumulative < 0.0).then(|| {
        Finding::new(
            AnomalyKind::ParamStuck,
            Some(key),
            format!("{} unchanged at {} for {} samples with cumulative P&L {:.2}", key, first, run, cumulative),
        )
    })
}

fn stagnation(state: &ControllerState, config: &AdaptationConfig) -> Option<Finding> {
    let window = config.stagnation_window;
    if window == 0 || state.audit_trail.len() < window {
        return None;
    }
    let recent = tail(&state.audit_trail, window);
    let updated = recent.iter().any(|e| e.kind == AdaptationKind::ParamUpdate);
    (!updated).then(|| {
        Finding::new(
            AnomalyKind::NoAdaptation,
            None,
            format!("No parameter update in the last {} adaptation events", window),
        )
    })
}

fn error_streak(state: &ControllerState, config: &AdaptationConfig) -> Option<Finding> {
    let recent = tail(&state.recent_reflections, REFLECTION_MEMORY);
    let errors = recent
        .iter()
        .filter(|text| {
            let lower = text.to_lowercase();
            lower.contains("error") || lower.contains("unparseable")
        })
        .count();
    (errors > config.error_streak_limit).then(|| {
        Finding::new(
            AnomalyKind::LlmErrorStreak,
            None,
            format!("{} of the last {} reflections reported errors", errors, recent.len()),
        )
    })
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}
