//! Adaptive risk controller
//!
//! Runs between trading cycles and is the only writer of [`RiskSettings`].
//! One run:
//! - averages the recent realized P&L window (empty window = no-op)
//! - advances an active shadow test
//! - ingests advisor suggestions and the performance nudge through a single
//!   clamped `propose` path
//! - records impact samples, then applies rollback and decay
//! - detects anomalies and periodically writes a digest
//!
//! All mutations happen on drafts. The drafts are persisted first and only
//! then published, so a failed save leaves the live state untouched.

pub mod anomaly;
pub mod events;
pub mod shadow;
pub mod state;
pub mod suggestion;

pub use events::{AdaptationEvent, AdaptationKind, AnomalyEvent, AnomalyKind, ParamChange};
pub use shadow::{ShadowTest, ShadowVerdict};
pub use state::{AdaptationDigest, ControllerState, ImpactSample};
pub use suggestion::{Confidence, ParsedReflection, SuggestionParseError};

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AdaptationConfig;
use crate::persistence::PersistenceError;
use crate::risk::{ParamKey, RiskSettings, RiskStore};
use crate::telemetry::metrics;
use crate::utils::helpers::{excerpt, mean};
use state::truncate_front;

/// Digests kept in state
pub const DIGEST_RETAIN: usize = 10;
/// Reflection excerpt length kept for error-streak detection
const REFLECTION_EXCERPT: usize = 200;
/// Values closer than this count as identical
const VALUE_EPSILON: f64 = 1e-9;
/// Damping applied while throttled or after instability
const SLOWDOWN_DAMPING: f64 = 0.5;

/// Inputs for one controller run
#[derive(Debug, Clone, Copy)]
pub struct ControllerInput<'a> {
    pub cycle: u64,
    /// Realized P&L of resolved trades, oldest first
    pub resolved_pnls: &'a [f64],
    /// Latest advisor reflection, if any
    pub reflection: Option<&'a str>,
}

/// What one run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub cycle: u64,
    pub skipped: bool,
    pub avg_pl: Option<f64>,
    pub events: Vec<AdaptationEvent>,
    pub anomalies: Vec<AnomalyEvent>,
    pub digest: Option<String>,
}

impl RunReport {
    fn skipped(cycle: u64) -> Self {
        Self {
            cycle,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn count(&self, kind: AdaptationKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}

pub struct AdaptiveController {
    config: AdaptationConfig,
    risk: Arc<RiskStore>,
    state: Mutex<ControllerState>,
}

impl AdaptiveController {
    pub fn new(config: AdaptationConfig, risk: Arc<RiskStore>, state: ControllerState) -> Self {
        Self {
            config,
            risk,
            state: Mutex::new(state),
        }
    }

    pub fn risk(&self) -> &Arc<RiskStore> {
        &self.risk
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    pub fn state_snapshot(&self) -> ControllerState {
        self.state.lock().clone()
    }

    /// Anomalies not surfaced yet. Advances the alert cursor.
    pub fn take_new_anomalies(&self) -> Vec<AnomalyEvent> {
        let mut state = self.state.lock();
        let pending = state.pending_anomalies();
        if let Some(last) = pending.iter().map(|a| a.id).max() {
            state.alert_cursor = last;
        }
        pending
    }

    /// Execute one adaptation run. `persist` receives the drafted settings
    /// and state; an error from it aborts the run without publishing.
    pub fn run<F>(&self, input: ControllerInput<'_>, persist: F) -> Result<RunReport, PersistenceError>
    where
        F: FnOnce(&RiskSettings, &ControllerState) -> Result<(), PersistenceError>,
    {
        let pnls = input.resolved_pnls;
        let window = &pnls[pnls.len().saturating_sub(self.config.window)..];
        let (Some(avg_pl), Some(&last_pl)) = (mean(window), window.last()) else {
            debug!(cycle = input.cycle, "No resolved trades, skipping adaptation");
            return Ok(RunReport::skipped(input.cycle));
        };

        let mut update = self.risk.begin_update();
        let mut live_state = self.state.lock();
        let mut draft_state = live_state.clone();

        let mut pass = Pass::new(&self.config, input.cycle, update.draft_mut(), &mut draft_state);
        pass.execute(avg_pl, last_pl, input.reflection);
        let Pass { events, anomalies, digest, .. } = pass;

        persist(update.draft(), &draft_state)?;
        let published = update.commit();
        *live_state = draft_state;
        drop(live_state);

        metrics::record_risk_settings(&published);
        for event in &events {
            metrics::record_adaptation_event(event.kind.as_str());
            match event.kind {
                AdaptationKind::ShadowTestPromote => metrics::record_shadow_outcome("promote"),
                AdaptationKind::ShadowTestReject => metrics::record_shadow_outcome("reject"),
                _ => {}
            }
        }
        for anomaly in &anomalies {
            metrics::record_anomaly(anomaly.kind.as_str());
        }

        info!(
            cycle = input.cycle,
            avg_pl,
            events = events.len(),
            anomalies = anomalies.len(),
            "Adaptation run complete"
        );

        Ok(RunReport {
            cycle: input.cycle,
            skipped: false,
            avg_pl: Some(avg_pl),
            events,
            anomalies,
            digest,
        })
    }
}

/// Working set of one run over the drafts
struct Pass<'a> {
    config: &'a AdaptationConfig,
    cycle: u64,
    settings: &'a mut RiskSettings,
    state: &'a mut ControllerState,
    damping: f64,
    before: BTreeMap<ParamKey, f64>,
    suggested: BTreeMap<ParamKey, f64>,
    updated: BTreeSet<ParamKey>,
    changed: BTreeSet<ParamKey>,
    events: Vec<AdaptationEvent>,
    anomalies: Vec<AnomalyEvent>,
    digest: Option<String>,
}

impl<'a> Pass<'a> {
    fn new(config: &'a AdaptationConfig, cycle: u64, settings: &'a mut RiskSettings, state: &'a mut ControllerState) -> Self {
        let before = settings.values();
        Self {
            config,
            cycle,
            settings,
            state,
            damping: 1.0,
            before,
            suggested: BTreeMap::new(),
            updated: BTreeSet::new(),
            changed: BTreeSet::new(),
            events: Vec::new(),
            anomalies: Vec::new(),
            digest: None,
        }
    }

    fn execute(&mut self, avg_pl: f64, last_pl: f64, reflection: Option<&str>) {
        self.state.runs += 1;
        self.advance_shadow(last_pl);
        self.update_damping(avg_pl);
        let confidence = self.ingest_reflection(reflection);
        self.performance_nudge(avg_pl, confidence);
        self.record_impact(avg_pl);
        self.rollback_and_decay();
        if self.updated.len() > 1 {
            let names: Vec<&str> = self.updated.iter().map(|k| k.as_str()).collect();
            self.emit(AdaptationEvent::new(
                self.cycle,
                AdaptationKind::MultiParamUpdate,
                format!("Updated {} parameters: {}", names.len(), names.join(", ")),
            ));
        }
        self.detect_anomalies();
        self.write_digest();
        truncate_front(&mut self.state.audit_trail, self.config.audit_capacity);
        truncate_front(&mut self.state.anomalies, self.config.audit_capacity);
    }

    fn emit(&mut self, event: AdaptationEvent) {
        info!(cycle = self.cycle, kind = %event.kind, "{}", event.summary());
        self.state.audit_trail.push(event.clone());
        self.events.push(event);
    }

    fn advance_shadow(&mut self, last_pl: f64) {
        let Some(test) = self.state.shadow_test.as_mut() else {
            return;
        };
        let live = self.settings.get(test.param);
        test.record(self.cycle, last_pl, live);
        if !test.is_complete(self.config.shadow_cycles) {
            debug!(param = %test.param, samples = test.samples.len(), "Shadow test sampled");
            return;
        }
        let Some(test) = self.state.shadow_test.take() else {
            return;
        };
        match test.verdict() {
            ShadowVerdict::Promote { avg_simulated, avg_real } => {
                let reason = format!(
                    "Shadow test promoted: simulated avg P&L {:.2} beat actual {:.2}",
                    avg_simulated, avg_real
                );
                self.write(test.param, test.proposed_value, AdaptationKind::ShadowTestPromote, reason);
            }
            ShadowVerdict::Reject { avg_simulated, avg_real } => {
                let live = self.settings.get(test.param);
                self.emit(
                    AdaptationEvent::new(
                        self.cycle,
                        AdaptationKind::ShadowTestReject,
                        format!(
                            "Shadow test rejected: simulated avg P&L {:.2} did not beat actual {:.2}",
                            avg_simulated, avg_real
                        ),
                    )
                    .with_change(ParamChange {
                        param: test.param,
                        previous: live,
                        proposed: test.proposed_value,
                        applied: live,
                    }),
                );
            }
        }
    }

    fn update_damping(&mut self, avg_pl: f64) {
        self.state.run_pnls.push(avg_pl);
        truncate_front(&mut self.state.run_pnls, self.config.impact_history.max(self.config.rollback_run));

        let run = self.config.rollback_run;
        let pnls = &self.state.run_pnls;
        let drawdown = run > 0 && pnls.len() >= run && pnls[pnls.len() - run..].iter().all(|p| *p < 0.0);

        if drawdown && !self.state.drawdown_throttle_active {
            self.state.drawdown_throttle_active = true;
            self.emit(AdaptationEvent::new(
                self.cycle,
                AdaptationKind::AdaptationSlowdown,
                format!("Drawdown throttle engaged after {} losing runs", run),
            ));
        } else if !drawdown && self.state.drawdown_throttle_active {
            self.state.drawdown_throttle_active = false;
            info!(cycle = self.cycle, "Drawdown throttle released");
        }

        self.damping = if self.state.drawdown_throttle_active || self.state.volatility_flag {
            SLOWDOWN_DAMPING
        } else {
            1.0
        };
        self.state.volatility_flag = false;
    }

    fn ingest_reflection(&mut self, reflection: Option<&str>) -> Confidence {
        let Some(text) = reflection else {
            return Confidence::Neutral;
        };
        self.state.recent_reflections.push(excerpt(text, REFLECTION_EXCERPT));
        truncate_front(&mut self.state.recent_reflections, anomaly::REFLECTION_MEMORY);

        let parsed = ParsedReflection::parse(text);
        let confidence = parsed.confidence();
        match parsed {
            ParsedReflection::Empty { .. } => {}
            ParsedReflection::Failure(err) => {
                warn!(cycle = self.cycle, error = %err, "Discarding advisor parameter suggestions");
                self.emit(AdaptationEvent::new(
                    self.cycle,
                    AdaptationKind::LlmJsonParseError,
                    format!("Could not parse parameter suggestions: {}", err),
                ));
            }
            ParsedReflection::Suggestions { items, .. } => {
                for item in items {
                    let Ok(key) = item.name.parse::<ParamKey>() else {
                        debug!(param = %item.name, "Ignoring suggestion for unknown parameter");
                        continue;
                    };
                    if !self.settings.param(key).exposed() {
                        debug!(param = %key, "Ignoring suggestion for internal parameter");
                        continue;
                    }
                    let Some(value) = item.numeric() else {
                        self.emit(AdaptationEvent::new(
                            self.cycle,
                            AdaptationKind::ParamUpdateError,
                            format!("Non-numeric suggestion for {}: {}", key, item.value),
                        ));
                        continue;
                    };
                    self.suggested.insert(key, value);
                    self.propose(key, value, format!("Advisor suggestion ({} confidence)", confidence.as_str()));
                }
            }
        }
        confidence
    }

    fn performance_nudge(&mut self, avg_pl: f64, confidence: Confidence) {
        let key = ParamKey::MaxRiskPerTradePercent;
        let risk = self.settings.get(key);
        let spec = *self.settings.spec(key);
        let base = risk * self.config.step_fraction;
        let gap = if avg_pl > 0.0 {
            base.min(spec.max - risk)
        } else if avg_pl < 0.0 {
            (-base).max(spec.min - risk)
        } else {
            0.0
        };
        let step = gap * confidence.weight();

        if step != 0.0 {
            self.propose(
                key,
                risk + step,
                format!("Performance-based adaptation (avg P&L {:.2})", avg_pl),
            );
        }

        if avg_pl < 0.0 {
            let key = ParamKey::MinSentimentForBuy;
            let threshold = self.settings.get(key);
            if threshold < self.config.sentiment_cap {
                self.propose(
                    key,
                    threshold + self.config.sentiment_step,
                    format!("Tightening entries after losses (avg P&L {:.2})", avg_pl),
                );
            }
        }
    }

    /// Single entry point for adaptive changes: damping, clamping and the
    /// shadow gate.
    fn propose(&mut self, key: ParamKey, target: f64, reason: String) {
        let current = self.settings.get(key);
        let spec = *self.settings.spec(key);
        let damped = current + self.damping * (target - current);
        let candidate = spec.clamp(damped);
        let delta = candidate - current;
        if delta.abs() < VALUE_EPSILON {
            debug!(param = %key, value = current, "Proposal leaves parameter unchanged");
            return;
        }

        if let Some(threshold) = spec.shadow_threshold {
            if delta.abs() > threshold {
                if self.state.shadow_test.is_some() {
                    info!(param = %key, proposed = candidate, "Shadow test already running, dropping large proposal");
                    return;
                }
                self.state.shadow_test = Some(ShadowTest::new(key, candidate, self.cycle));
                self.emit(
                    AdaptationEvent::new(
                        self.cycle,
                        AdaptationKind::ShadowTestStart,
                        format!("Change of {:.4} exceeds {} and will be shadow-tested: {}", delta, threshold, reason),
                    )
                    .with_change(ParamChange {
                        param: key,
                        previous: current,
                        proposed: target,
                        applied: current,
                    }),
                );
                return;
            }
        }

        if self.write_with_proposal(key, damped, target, AdaptationKind::ParamUpdate, reason) {
            self.updated.insert(key);
        }
    }

    fn write(&mut self, key: ParamKey, value: f64, kind: AdaptationKind, reason: String) -> bool {
        self.write_with_proposal(key, value, value, kind, reason)
    }

    /// Clamped write recorded in the audit trail. `proposed` is the raw
    /// value the change originated from.
    fn write_with_proposal(&mut self, key: ParamKey, value: f64, proposed: f64, kind: AdaptationKind, reason: String) -> bool {
        match self.settings.set(key, value) {
            Ok(write) => {
                self.changed.insert(key);
                self.emit(AdaptationEvent::new(self.cycle, kind, reason).with_change(ParamChange {
                    param: key,
                    previous: write.previous,
                    proposed,
                    applied: write.applied,
                }));
                true
            }
            Err(err) => {
                self.emit(AdaptationEvent::new(
                    self.cycle,
                    AdaptationKind::ParamUpdateError,
                    format!("Rejected write to {}: {}", key, err),
                ));
                false
            }
        }
    }

    fn tracked(&self) -> Vec<ParamKey> {
        ParamKey::ALL
            .into_iter()
            .filter(|k| self.settings.spec(*k).tracked)
            .collect()
    }

    fn record_impact(&mut self, avg_pl: f64) {
        for key in self.tracked() {
            let spec = *self.settings.spec(key);
            let value = self.settings.get(key);
            let reinforced = self
                .suggested
                .get(&key)
                .is_some_and(|s| (spec.clamp(*s) - value).abs() < VALUE_EPSILON);
            let sample = ImpactSample {
                cycle: self.cycle,
                value_before: self.before.get(&key).copied().unwrap_or(value),
                value,
                avg_pl,
                reinforced,
            };
            let history = self.state.impact_history.entry(key).or_default();
            history.push(sample);
            truncate_front(history, self.config.impact_history);
        }
    }

    fn rollback_and_decay(&mut self) {
        for key in self.tracked() {
            if !self.try_rollback(key) {
                self.try_decay(key);
            }
        }
    }

    fn try_rollback(&mut self, key: ParamKey) -> bool {
        let run = self.config.rollback_run;
        if run == 0 {
            return false;
        }
        let mark = self.state.rollback_marks.get(&key).copied();
        let eligible: Vec<ImpactSample> = self
            .state
            .samples(key)
            .iter()
            .filter(|s| mark.map_or(true, |m| s.cycle > m))
            .copied()
            .collect();
        if eligible.len() < run {
            return false;
        }
        let window = &eligible[eligible.len() - run..];
        if !window.iter().all(|s| s.avg_pl < 0.0) {
            return false;
        }

        let target = window[0].value_before;
        self.state.rollback_marks.insert(key, self.cycle);
        let reason = format!(
            "{} consecutive losing samples, reverting {} to {}",
            run, key, target
        );
        if self.write(key, target, AdaptationKind::Rollback, reason) {
            self.refresh_last_sample(key);
        }
        true
    }

    fn try_decay(&mut self, key: ParamKey) {
        let run = self.config.decay_run;
        let spec = *self.settings.spec(key);
        let current = self.settings.get(key);
        if run == 0 || !spec.is_at_bound(current) {
            return;
        }
        let samples = self.state.samples(key);
        if samples.len() < run {
            return;
        }
        let window = &samples[samples.len() - run..];
        if !window.iter().all(|s| spec.is_at_bound(s.value)) {
            return;
        }
        let recent = &samples[samples.len().saturating_sub(self.config.reinforcement_window)..];
        if recent.iter().any(|s| s.reinforced) {
            debug!(param = %key, "Parameter at bound but reinforced, skipping decay");
            return;
        }

        let decayed = current + self.config.decay_fraction * (spec.default - current);
        let reason = format!(
            "{} held at bound {} for {} samples, decaying toward default {}",
            key, current, run, spec.default
        );
        if self.write(key, decayed, AdaptationKind::ParamDecay, reason) {
            self.refresh_last_sample(key);
        }
    }

    fn refresh_last_sample(&mut self, key: ParamKey) {
        let value = self.settings.get(key);
        if let Some(last) = self.state.impact_history.get_mut(&key).and_then(|h| h.last_mut()) {
            last.value = value;
        }
    }

    fn detect_anomalies(&mut self) {
        let findings = anomaly::detect(&*self.state, &*self.settings, self.config, &self.changed, !self.updated.is_empty());
        let mut unstable = false;
        for finding in findings {
            if finding.is_instability() {
                unstable = true;
            }
            self.state.next_anomaly_id += 1;
            let event = AnomalyEvent {
                id: self.state.next_anomaly_id,
                timestamp: Utc::now(),
                cycle: self.cycle,
                kind: finding.kind,
                param: finding.param,
                details: finding.details,
            };
            warn!(cycle = self.cycle, kind = %event.kind, "Anomaly: {}", event.details);
            self.state.anomalies.push(event.clone());
            self.anomalies.push(event);
        }
        if unstable {
            self.state.volatility_flag = true;
            self.emit(AdaptationEvent::new(
                self.cycle,
                AdaptationKind::AdaptationSlowdown,
                "Unstable parameter history, halving the next adaptation step",
            ));
        }
    }

    fn write_digest(&mut self) {
        let every = self.config.digest_every;
        if every == 0 || self.cycle == 0 || self.cycle % every != 0 {
            return;
        }
        let text = render_digest(&*self.state, self.cycle);
        info!(cycle = self.cycle, "Adaptation digest written");
        self.state.digests.push(AdaptationDigest {
            cycle: self.cycle,
            timestamp: Utc::now(),
            text: text.clone(),
        });
        truncate_front(&mut self.state.digests, DIGEST_RETAIN);
        self.digest = Some(text);
    }
}

fn render_digest(state: &ControllerState, cycle: u64) -> String {
    let mut lines = vec![format!("Adaptation digest at cycle {}", cycle)];

    lines.push("Recent adaptations:".to_string());
    let events = &state.audit_trail[state.audit_trail.len().saturating_sub(10)..];
    if events.is_empty() {
        lines.push("  (none)".to_string());
    }
    for event in events {
        lines.push(format!("  - {}", event.summary()));
    }

    lines.push("Recent impact:".to_string());
    for (key, samples) in &state.impact_history {
        let recent = &samples[samples.len().saturating_sub(10)..];
        if let (Some(first), Some(last)) = (recent.first(), recent.last()) {
            let pnls: Vec<f64> = recent.iter().map(|s| s.avg_pl).collect();
            lines.push(format!(
                "  - {}: {} -> {} over {} samples, avg P&L {:.2}",
                key,
                first.value_before,
                last.value,
                recent.len(),
                mean(&pnls).unwrap_or(0.0)
            ));
        }
    }

    lines.push("Recent anomalies:".to_string());
    let anomalies = &state.anomalies[state.anomalies.len().saturating_sub(5)..];
    if anomalies.is_empty() {
        lines.push("  (none)".to_string());
    }
    for anomaly in anomalies {
        lines.push(format!("  - [cycle {}] {}: {}", anomaly.cycle, anomaly.kind, anomaly.details));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(
            AdaptationConfig::default(),
            Arc::new(RiskStore::new(RiskSettings::default())),
            ControllerState::default(),
        )
    }

    fn no_persist(_: &RiskSettings, _: &ControllerState) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn run(controller: &AdaptiveController, cycle: u64, pnls: &[f64], reflection: Option<&str>) -> RunReport {
        controller
            .run(ControllerInput { cycle, resolved_pnls: pnls, reflection }, no_persist)
            .unwrap()
    }

    fn update_for(report: &RunReport, key: ParamKey) -> ParamChange {
        report
            .events
            .iter()
            .filter(|e| e.kind == AdaptationKind::ParamUpdate)
            .flat_map(|e| e.changes.iter())
            .find(|c| c.param == key)
            .copied()
            .unwrap()
    }

    #[test]
    fn test_positive_pnl_raises_risk_with_one_update() {
        let controller = controller();
        let report = run(&controller, 7, &[250.0; 20], None);

        assert_eq!(report.avg_pl, Some(250.0));
        assert_eq!(report.count(AdaptationKind::ParamUpdate), 1);
        let risk = controller.risk().snapshot().max_risk_per_trade_percent();
        assert!(risk > 0.05 && risk <= 0.10);
        assert!((risk - 0.0525).abs() < 1e-12);
    }

    #[test]
    fn test_empty_window_is_noop() {
        let controller = controller();
        let mut persisted = false;
        let report = controller
            .run(ControllerInput { cycle: 1, resolved_pnls: &[], reflection: Some("{\"param_suggestions\": {\"min_sentiment_for_buy\": 70}}") }, |_, _| {
                persisted = true;
                Ok(())
            })
            .unwrap();
        assert!(report.skipped);
        assert!(!persisted);
        assert_eq!(controller.risk().snapshot().min_sentiment_for_buy(), 40.0);
        assert!(controller.state_snapshot().audit_trail.is_empty());
    }

    #[test]
    fn test_suggestions_are_clamped_and_filtered() {
        let controller = controller();
        let text = "Be more selective.\n{\"param_suggestions\": {\"min_sentiment_for_buy\": 95, \"atr_stop_multiplier\": 4.0, \"bogus\": 1, \"min_sentiment_for_sell\": \"lots\"}}";
        let report = run(&controller, 1, &[10.0], Some(text));

        let settings = controller.risk().snapshot();
        assert_eq!(settings.min_sentiment_for_buy(), 80.0);
        assert_eq!(settings.atr_stop_multiplier(), 2.0);
        assert_eq!(report.count(AdaptationKind::ParamUpdateError), 1);

        let update = report
            .events
            .iter()
            .find(|e| e.kind == AdaptationKind::ParamUpdate && e.changes[0].param == ParamKey::MinSentimentForBuy)
            .unwrap();
        assert_eq!(update.changes[0].proposed, 95.0);
        assert_eq!(update.changes[0].applied, 80.0);
        assert!(report.anomalies.iter().any(|a| a.kind == AnomalyKind::RiskParamLimit));
    }

    #[test]
    fn test_parse_failure_is_recorded_not_raised() {
        let controller = controller();
        let report = run(&controller, 1, &[5.0], Some("{\"param_suggestions\": {\"x\": }}"));
        assert_eq!(report.count(AdaptationKind::LlmJsonParseError), 1);
    }

    #[test]
    fn test_truncated_suggestions_are_a_parse_error() {
        let controller = controller();
        let text = "{\"param_suggestions\": {\"min_sentiment_for_buy\": 55}, \"confidence\": \"hi";
        let report = run(&controller, 1, &[0.0], Some(text));
        assert_eq!(report.count(AdaptationKind::LlmJsonParseError), 1);
        assert_eq!(report.count(AdaptationKind::ParamUpdate), 0);
        assert_eq!(controller.risk().snapshot().min_sentiment_for_buy(), 40.0);
    }

    #[test]
    fn test_losing_streak_rolls_back() {
        let controller = controller();
        let mut report = RunReport::default();
        for cycle in 1..=10 {
            report = run(&controller, cycle, &[-50.0; 5], None);
        }
        let rollbacks: Vec<&AdaptationEvent> = report
            .events
            .iter()
            .filter(|e| e.kind == AdaptationKind::Rollback)
            .collect();
        assert!(!rollbacks.is_empty());
        let settings = controller.risk().snapshot();
        assert_eq!(settings.max_risk_per_trade_percent(), 0.05);
        assert_eq!(settings.min_sentiment_for_buy(), 40.0);

        // the mark prevents an immediate second rollback
        let next = run(&controller, 11, &[-50.0; 5], None);
        assert_eq!(next.count(AdaptationKind::Rollback), 0);
    }

    #[test]
    fn test_large_change_is_shadow_tested_and_resolves() {
        let controller = controller();
        let shadow_cycles = controller.config().shadow_cycles as u64;
        let text = "{\"param_suggestions\": {\"max_risk_per_trade_percent\": 0.09}}";
        let report = run(&controller, 1, &[0.0], Some(text));
        assert_eq!(report.count(AdaptationKind::ShadowTestStart), 1);
        assert_eq!(controller.risk().snapshot().max_risk_per_trade_percent(), 0.05);

        // a second large proposal while the first is running is dropped
        let report = run(&controller, 2, &[100.0], Some("{\"param_suggestions\": {\"max_position_per_asset_percent\": 0.2}}"));
        assert_eq!(report.count(AdaptationKind::ShadowTestStart), 0);
        assert_eq!(controller.state_snapshot().shadow_test.unwrap().param, ParamKey::MaxRiskPerTradePercent);

        for cycle in 3..=shadow_cycles {
            let report = run(&controller, cycle, &[100.0], None);
            assert_eq!(report.count(AdaptationKind::ShadowTestPromote), 0);
            assert!(controller.state_snapshot().shadow_test.is_some());
        }
        let report = run(&controller, shadow_cycles + 1, &[100.0], None);
        assert_eq!(report.count(AdaptationKind::ShadowTestPromote), 1);
        assert!(controller.state_snapshot().shadow_test.is_none());
    }

    #[test]
    fn test_persist_failure_leaves_live_state() {
        let controller = controller();
        let result = controller.run(ControllerInput { cycle: 3, resolved_pnls: &[250.0], reflection: None }, |_, _| {
            Err(PersistenceError::Io {
                path: "agent_state.json".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        });
        assert!(result.is_err());
        assert_eq!(controller.risk().snapshot().max_risk_per_trade_percent(), 0.05);
        assert!(controller.state_snapshot().audit_trail.is_empty());
    }

    #[test]
    fn test_anomaly_cursor_surfaces_each_once() {
        let controller = controller();
        run(&controller, 1, &[10.0], Some("{\"param_suggestions\": {\"min_sentiment_for_buy\": 95}}"));
        let first = controller.take_new_anomalies();
        assert!(!first.is_empty());
        assert!(controller.take_new_anomalies().is_empty());
    }

    #[test]
    fn test_decay_from_bound_toward_default() {
        let mut settings = RiskSettings::default();
        settings.set(ParamKey::MaxRiskPerTradePercent, 0.10).unwrap();
        let controller = AdaptiveController::new(
            AdaptationConfig::default(),
            Arc::new(RiskStore::new(settings)),
            ControllerState::default(),
        );
        let mut report = RunReport::default();
        for cycle in 1..=10 {
            report = run(&controller, cycle, &[100.0], None);
        }
        assert_eq!(report.count(AdaptationKind::ParamDecay), 1);
        let risk = controller.risk().snapshot().max_risk_per_trade_percent();
        assert!((risk - 0.095).abs() < 1e-12);
    }

    #[test]
    fn test_drawdown_throttle_halves_steps_until_released() {
        let config = AdaptationConfig {
            rollback_run: 3,
            ..AdaptationConfig::default()
        };
        let controller = AdaptiveController::new(
            config,
            Arc::new(RiskStore::new(RiskSettings::default())),
            ControllerState::default(),
        );
        for cycle in 1..=2 {
            let report = run(&controller, cycle, &[-10.0], None);
            assert_eq!(report.count(AdaptationKind::AdaptationSlowdown), 0);
        }
        assert_eq!(controller.risk().snapshot().min_sentiment_for_buy(), 44.0);

        // third losing run in a row engages the throttle before suggestions land
        let report = run(&controller, 3, &[-10.0], Some("{\"param_suggestions\": {\"min_sentiment_for_buy\": 54}}"));
        assert_eq!(report.count(AdaptationKind::AdaptationSlowdown), 1);
        assert!(controller.state_snapshot().drawdown_throttle_active);
        let change = update_for(&report, ParamKey::MinSentimentForBuy);
        assert_eq!((change.previous, change.proposed, change.applied), (44.0, 54.0, 49.0));

        // a winning run releases it and steps are whole again
        let before = controller.risk().snapshot().min_sentiment_for_buy();
        let report = run(&controller, 4, &[10.0], Some("{\"param_suggestions\": {\"min_sentiment_for_buy\": 58}}"));
        assert_eq!(report.count(AdaptationKind::AdaptationSlowdown), 0);
        assert!(!controller.state_snapshot().drawdown_throttle_active);
        let change = update_for(&report, ParamKey::MinSentimentForBuy);
        assert_eq!(change.previous, before);
        assert_eq!(change.applied, 58.0);
    }

    #[test]
    fn test_multi_param_update_only_for_two_or_more_keys() {
        let controller = controller();
        let text = "{\"param_suggestions\": {\"min_sentiment_for_buy\": 50, \"min_sentiment_for_sell\": -30}}";
        let report = run(&controller, 1, &[0.0], Some(text));
        assert_eq!(report.count(AdaptationKind::ParamUpdate), 2);
        assert_eq!(report.count(AdaptationKind::MultiParamUpdate), 1);
        let multi = report
            .events
            .iter()
            .find(|e| e.kind == AdaptationKind::MultiParamUpdate)
            .unwrap();
        assert_eq!(multi.reason, "Updated 2 parameters: min_sentiment_for_buy, min_sentiment_for_sell");
        // undamped
        assert_eq!(update_for(&report, ParamKey::MinSentimentForBuy).applied, 50.0);
        assert_eq!(update_for(&report, ParamKey::MinSentimentForSell).applied, -30.0);

        let report = run(&controller, 2, &[0.0], Some("{\"param_suggestions\": {\"min_sentiment_for_buy\": 45}}"));
        assert_eq!(report.count(AdaptationKind::ParamUpdate), 1);
        assert_eq!(report.count(AdaptationKind::MultiParamUpdate), 0);
    }

    #[test]
    fn test_volatile_history_halves_next_step() {
        let controller = controller();
        let suggest = |value: f64| format!("{{\"param_suggestions\": {{\"min_sentiment_for_buy\": {}}}}}", value);

        let report = run(&controller, 1, &[0.0], Some(suggest(75.0).as_str()));
        assert_eq!(update_for(&report, ParamKey::MinSentimentForBuy).applied, 75.0);
        assert_eq!(report.count(AdaptationKind::AdaptationSlowdown), 0);

        // swinging back by more than the volatility delta flags the history
        let report = run(&controller, 2, &[0.0], Some(suggest(40.0).as_str()));
        assert_eq!(update_for(&report, ParamKey::MinSentimentForBuy).applied, 40.0);
        assert!(report.anomalies.iter().any(|a| a.kind == AnomalyKind::LlmVolatility
            && a.param == Some(ParamKey::MinSentimentForBuy)));
        assert_eq!(report.count(AdaptationKind::AdaptationSlowdown), 1);
        assert!(controller.state_snapshot().volatility_flag);

        let report = run(&controller, 3, &[0.0], Some(suggest(60.0).as_str()));
        let change = update_for(&report, ParamKey::MinSentimentForBuy);
        assert_eq!((change.previous, change.proposed, change.applied), (40.0, 60.0, 50.0));
    }

    #[test]
    fn test_digest_every_ten_cycles() {
        let controller = controller();
        let report = run(&controller, 10, &[1.0], None);
        let digest = report.digest.unwrap();
        assert!(digest.starts_with("Adaptation digest at cycle 10"));
        assert_eq!(controller.state_snapshot().digests.len(), 1);
        assert!(run(&controller, 11, &[1.0], None).digest.is_none());
    }
}
