//! Persistent controller state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::events::{AdaptationEvent, AnomalyEvent};
use super::shadow::ShadowTest;
use crate::risk::ParamKey;

/// Value of a tracked parameter after one controller run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpactSample {
    pub cycle: u64,
    /// Value before this run touched it
    pub value_before: f64,
    /// Value after this run, including rollback and decay
    pub value: f64,
    /// Windowed average realized P&L seen by this run
    pub avg_pl: f64,
    /// The advisor suggested exactly this value during the run
    pub reinforced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationDigest {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Audit trail, anomaly log and adaptation memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerState {
    pub audit_trail: Vec<AdaptationEvent>,
    pub anomalies: Vec<AnomalyEvent>,
    pub next_anomaly_id: u64,
    /// Highest anomaly id already surfaced to the operator
    pub alert_cursor: u64,
    pub impact_history: BTreeMap<ParamKey, Vec<ImpactSample>>,
    /// Average P&L seen by each run, oldest first
    pub run_pnls: Vec<f64>,
    pub shadow_test: Option<ShadowTest>,
    pub drawdown_throttle_active: bool,
    /// Volatility or oscillation flagged by the previous run
    pub volatility_flag: bool,
    pub digests: Vec<AdaptationDigest>,
    /// Cycle of the most recent rollback per parameter
    pub rollback_marks: BTreeMap<ParamKey, u64>,
    /// Excerpts of recent reflections, oldest first
    pub recent_reflections: Vec<String>,
    pub runs: u64,
}

impl ControllerState {
    pub fn samples(&self, param: ParamKey) -> &[ImpactSample] {
        self.impact_history.get(&param).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Anomalies not yet surfaced
    pub fn pending_anomalies(&self) -> Vec<AnomalyEvent> {
        self.anomalies
            .iter()
            .filter(|a| a.id > self.alert_cursor)
            .cloned()
            .collect()
    }

    pub fn latest_digest(&self) -> Option<&AdaptationDigest> {
        self.digests.last()
    }
}

/// Keep only the newest `capacity` items
pub(crate) fn truncate_front<T>(items: &mut Vec<T>, capacity: usize) {
    if items.len() > capacity {
        let excess = items.len() - capacity;
        items.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_front_keeps_newest() {
        let mut items = vec![1, 2, 3, 4, 5];
        truncate_front(&mut items, 3);
        assert_eq!(items, vec![3, 4, 5]);
        truncate_front(&mut items, 10);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let mut state = ControllerState::default();
        state.impact_history.insert(
            ParamKey::MinSentimentForBuy,
            vec![ImpactSample { cycle: 7, value_before: 40.0, value: 42.0, avg_pl: -3.0, reinforced: false }],
        );
        state.rollback_marks.insert(ParamKey::MaxRiskPerTradePercent, 3);
        let json = serde_json::to_string(&state).unwrap();
        let back: ControllerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
