//! Audit trail and anomaly records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::risk::ParamKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationKind {
    ParamUpdate,
    Rollback,
    ParamDecay,
    ShadowTestStart,
    ShadowTestPromote,
    ShadowTestReject,
    MultiParamUpdate,
    AdaptationSlowdown,
    LlmJsonParseError,
    ParamUpdateError,
}

impl AdaptationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationKind::ParamUpdate => "param_update",
            AdaptationKind::Rollback => "rollback",
            AdaptationKind::ParamDecay => "param_decay",
            AdaptationKind::ShadowTestStart => "shadow_test_start",
            AdaptationKind::ShadowTestPromote => "shadow_test_promote",
            AdaptationKind::ShadowTestReject => "shadow_test_reject",
            AdaptationKind::MultiParamUpdate => "multi_param_update",
            AdaptationKind::AdaptationSlowdown => "adaptation_slowdown",
            AdaptationKind::LlmJsonParseError => "llm_json_parse_error",
            AdaptationKind::ParamUpdateError => "param_update_error",
        }
    }
}

impl fmt::Display for AdaptationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parameter write, with the raw proposal and the clamped result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamChange {
    pub param: ParamKey,
    pub previous: f64,
    pub proposed: f64,
    pub applied: f64,
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationEvent {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub kind: AdaptationKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<ParamChange>,
    pub reason: String,
}

impl AdaptationEvent {
    pub fn new(cycle: u64, kind: AdaptationKind, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            cycle,
            kind,
            changes: Vec::new(),
            reason: reason.into(),
        }
    }

    pub fn with_change(mut self, change: ParamChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_changes(mut self, changes: Vec<ParamChange>) -> Self {
        self.changes.extend(changes);
        self
    }

    /// One-line rendering used by digests and the CLI
    pub fn summary(&self) -> String {
        let changes: Vec<String> = self
            .changes
            .iter()
            .map(|c| format!("{} -> {}", c.param, c.applied))
            .collect();
        if changes.is_empty() {
            format!("[cycle {}] {} | {}", self.cycle, self.kind, self.reason)
        } else {
            format!("[cycle {}] {}: {} | {}", self.cycle, self.kind, changes.join(", "), self.reason)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    FrequentAdaptations,
    RiskParamLimit,
    LlmVolatility,
    LlmOscillation,
    ParamStuck,
    NoAdaptation,
    LlmErrorStreak,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::FrequentAdaptations => "frequent_adaptations",
            AnomalyKind::RiskParamLimit => "risk_param_limit",
            AnomalyKind::LlmVolatility => "llm_volatility",
            AnomalyKind::LlmOscillation => "llm_oscillation",
            AnomalyKind::ParamStuck => "param_stuck",
            AnomalyKind::NoAdaptation => "no_adaptation",
            AnomalyKind::LlmErrorStreak => "llm_error_streak",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal condition surfaced to the operator once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    /// Monotonic sequence number, drives the alert cursor
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub kind: AnomalyKind,
    #[serde(default)]
    pub param: Option<ParamKey>,
    pub details: String,
}
