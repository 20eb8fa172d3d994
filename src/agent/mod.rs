//! Agent Module
//!
//! Provides the trading loop around the core components:
//! - Collaborator traits for market data, advisor and broker
//! - Paper broker, replay feed and offline advisor
//! - One cycle: analyze, decide, execute, record, and periodically adapt
//! - Durable agent state with atomic whole-document saves

pub mod collaborators;
pub mod offline;
pub mod paper;
pub mod replay;

pub use collaborators::{
    Advisor, AnalysisRequest, Broker, BrokerError, MarketData, MarketDataError, OrderResult, OrderStatus,
};
pub use offline::OfflineAdvisor;
pub use paper::PaperBroker;
pub use replay::ReplayMarketData;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::controller::{AdaptiveController, ControllerInput, ControllerState, RunReport};
use crate::decision::{decide, AdvisorRecommendation, DecisionInput, TradeDecision};
use crate::experience::{summarize_outcomes, ExperienceRecord, ExperienceStore, MarketStateSnapshot, OutcomeError};
use crate::indicators::{Indicator, IndicatorFrame};
use crate::persistence::{PersistenceError, StateFile};
use crate::position::{ClosedLot, PositionBook, PositionLot};
use crate::risk::{ParamKey, RiskSettings, RiskStore};
use crate::telemetry::{metrics, Alert, AlertLevel, AlertManager};
use crate::utils::helpers::{excerpt, format_usd};
use crate::utils::{AccountSnapshot, DecisionSource, HoldingSnapshot};

/// Indicator rows shown to the advisor
const ADVISOR_HISTORY_ROWS: usize = 10;
/// Reflections kept in the agent state
const REFLECTION_RETAIN: usize = 50;
/// Records summarised in the reflection prompt
const REFLECTION_RECORDS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionEntry {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Everything the agent needs to resume after a restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    pub cycle: u64,
    pub risk: BTreeMap<ParamKey, f64>,
    pub controller: ControllerState,
    pub lots: Vec<PositionLot>,
    pub realized_pl: f64,
    pub reflections: Vec<ReflectionEntry>,
}

/// Result of one symbol's pass through the cycle
#[derive(Debug, Clone)]
pub struct SymbolOutcome {
    pub symbol: String,
    pub decision: TradeDecision,
    pub executed: bool,
    pub record_id: uuid::Uuid,
    pub realized_pl: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcomes: Vec<SymbolOutcome>,
    pub adaptation: Option<RunReport>,
}

pub struct TradingAgent {
    config: Arc<AppConfig>,
    market: Arc<dyn MarketData>,
    advisor: Arc<dyn Advisor>,
    broker: Arc<dyn Broker>,
    risk: Arc<RiskStore>,
    controller: AdaptiveController,
    experience: ExperienceStore,
    book: PositionBook,
    alerts: AlertManager,
    state_file: StateFile<AgentState>,
    cycle: AtomicU64,
    reflections: Mutex<Vec<ReflectionEntry>>,
}

impl TradingAgent {
    /// Build the agent, restoring any state saved under the configured
    /// state directory.
    pub fn new(
        config: Arc<AppConfig>,
        market: Arc<dyn MarketData>,
        advisor: Arc<dyn Advisor>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let state_file: StateFile<AgentState> = StateFile::new(config.agent_state_path());
        let saved = state_file.load().context("Failed to load agent state")?;
        let experience = ExperienceStore::open(config.experience_log_path()).context("Failed to load experience log")?;

        let mut values = config.initial_values();
        values.extend(saved.risk.iter().map(|(k, v)| (*k, *v)));
        let settings = RiskSettings::with_values(&config.param_specs(), &values);
        let risk = Arc::new(RiskStore::new(settings));
        metrics::record_risk_settings(&risk.snapshot());

        info!(
            "Agent state restored: cycle {}, {} open lots, {} experiences",
            saved.cycle,
            saved.lots.len(),
            experience.len()
        );

        Ok(Self {
            controller: AdaptiveController::new(config.adaptation.clone(), risk.clone(), saved.controller),
            book: PositionBook::restore(saved.lots, saved.realized_pl),
            alerts: AlertManager::new(&config.telemetry),
            cycle: AtomicU64::new(saved.cycle),
            reflections: Mutex::new(saved.reflections),
            config,
            market,
            advisor,
            broker,
            risk,
            experience,
            state_file,
        })
    }

    pub fn risk(&self) -> &Arc<RiskStore> {
        &self.risk
    }

    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    pub fn experience(&self) -> &ExperienceStore {
        &self.experience
    }

    pub fn positions(&self) -> &PositionBook {
        &self.book
    }

    pub fn current_cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    /// Run cycles on the configured interval until Ctrl-C or until the
    /// market feed is exhausted. A running cycle always completes.
    pub async fn run(&self, interval: Duration) -> Result<()> {
        info!("Trading agent starting, cycle interval {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }

            if !self.market.advance() {
                info!("Market data exhausted, stopping");
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!("Cycle failed: {:#}", e);
                metrics::record_error();
                self.alerts.send(Alert::error("Cycle failed", format!("{:#}", e))).await;
            }
        }

        self.persist().context("Failed to save state on shutdown")?;
        info!("Trading agent stopped");
        Ok(())
    }

    /// One full trading cycle
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        info!("=== Cycle {} ===", cycle);

        let mut account = self.broker.account().await.context("Failed to fetch account")?;
        let mut positions = self.broker.positions().await.context("Failed to fetch positions")?;
        let held: Vec<String> = positions.keys().cloned().collect();
        self.book.reconcile(&held);
        metrics::record_portfolio_value(account.portfolio_value);
        info!(
            "Portfolio {} (cash {}), {} open positions",
            format_usd(account.portfolio_value),
            format_usd(account.cash),
            positions.len()
        );

        let settings = self.risk.snapshot();
        let mut outcomes = Vec::new();
        for symbol in &self.config.trading.symbols {
            match self.process_symbol(symbol, &settings, &account, &positions).await {
                Some(outcome) => {
                    if outcome.executed {
                        match self.refresh_broker_view().await {
                            Ok((a, p)) => {
                                account = a;
                                positions = p;
                            }
                            Err(e) => warn!("Could not refresh account after {}: {}", symbol, e),
                        }
                    }
                    outcomes.push(outcome);
                }
                None => debug!("No decision for {} this cycle", symbol),
            }
        }
        metrics::record_realized_pnl(self.book.realized_pl());

        let adaptation = if cycle % self.config.trading.reflection_interval_cycles == 0 {
            Some(self.reflect_and_adapt(cycle).await?)
        } else {
            None
        };

        let anomalies = self.controller.take_new_anomalies();
        self.alerts.send_anomalies(&anomalies).await;

        if let Err(e) = self.persist() {
            self.alerts
                .send(Alert::new(AlertLevel::Critical, "State not saved", format!("Cycle {}: {}", cycle, e)))
                .await;
            return Err(e).context("Failed to persist agent state");
        }

        metrics::record_cycle_duration(started.elapsed().as_secs_f64() * 1000.0);
        Ok(CycleReport {
            cycle,
            outcomes,
            adaptation,
        })
    }

    async fn refresh_broker_view(&self) -> Result<(AccountSnapshot, BTreeMap<String, HoldingSnapshot>), BrokerError> {
        let account = self.broker.account().await?;
        let positions = self.broker.positions().await?;
        Ok((account, positions))
    }

    async fn process_symbol(
        &self,
        symbol: &str,
        settings: &RiskSettings,
        account: &AccountSnapshot,
        positions: &BTreeMap<String, HoldingSnapshot>,
    ) -> Option<SymbolOutcome> {
        let bars = match self.market.bars(symbol, self.config.trading.lookback_bars).await {
            Ok(bars) if !bars.is_empty() => bars,
            Ok(_) => {
                warn!("No bars for {}, skipping", symbol);
                return None;
            }
            Err(e) => {
                warn!("Market data for {} unavailable: {}", symbol, e);
                return None;
            }
        };
        let frame = IndicatorFrame::compute(bars);
        let price = match self.market.latest_price(symbol).await {
            Ok(p) if p.is_finite() && p > 0.0 => p,
            _ => frame.latest_close()?,
        };
        let snapshot = MarketStateSnapshot::from_frame(symbol, &frame)?;

        let similar = self.experience.find_similar(
            &snapshot,
            self.config.experience.similarity_tolerance,
            self.config.experience.max_similar_records,
        );
        let past_performance = summarize_outcomes(&similar);
        let headlines = self.market.headlines(symbol).await.unwrap_or_default();
        let request = AnalysisRequest {
            symbol: symbol.to_string(),
            price,
            indicator_history: frame.recent_rows(ADVISOR_HISTORY_ROWS),
            headlines,
            past_performance,
        };

        let (recommendation, source, advisor_output) = match self.advisor.analyze(&request).await {
            Ok(text) => (AdvisorRecommendation::parse_or_default(&text), DecisionSource::Advisor, text),
            Err(e) => {
                warn!("Advisor unavailable for {}: {}. Using technical fallback", symbol, e);
                let fallback = AdvisorRecommendation::technical_fallback(
                    price,
                    frame.latest(Indicator::Sma20),
                    frame.latest(Indicator::Rsi),
                );
                (fallback, DecisionSource::Fallback, e.to_string())
            }
        };

        let holding_qty = positions.get(symbol).map(|h| h.qty).unwrap_or(0.0);
        let decision = decide(
            settings,
            &DecisionInput {
                symbol,
                recommendation: &recommendation,
                source,
                price,
                cash: account.cash,
                portfolio_value: account.portfolio_value,
                holding_qty,
                atr: frame.latest(Indicator::Atr),
                stop_loss_price: None,
            },
        );

        let mut record = ExperienceRecord::new(symbol, snapshot, decision.action, decision.size)
            .with_advisor(request.past_performance.clone(), advisor_output)
            .with_rationale(decision.reason.clone(), decision.source);
        let mut executed = false;
        let mut realized_pl = None;

        if decision.is_trade() {
            match self.execute(symbol, &decision, price, record.id).await {
                Some(Execution::Opened(lot)) => {
                    executed = true;
                    record = record.opening(lot);
                }
                Some(Execution::Closed { lot, pl }) => {
                    executed = true;
                    realized_pl = Some(pl);
                    record = record.closing(lot);
                }
                Some(Execution::Untracked) => executed = true,
                None => {
                    record.size = 0;
                    record.rationale.push_str(" (order not filled)");
                }
            }
        }

        let record_id = self.experience.append(record);
        Some(SymbolOutcome {
            symbol: symbol.to_string(),
            decision,
            executed,
            record_id,
            realized_pl,
        })
    }

    async fn execute(&self, symbol: &str, decision: &TradeDecision, price: f64, record_id: uuid::Uuid) -> Option<Execution> {
        let side = decision.side()?;
        let order = match self.broker.submit_order(symbol, side, decision.size).await {
            Ok(order) => order,
            Err(e) => {
                warn!("Order for {} failed: {}", symbol, e);
                metrics::record_order("error");
                return None;
            }
        };
        metrics::record_order(order.status.as_str());
        if order.status != OrderStatus::Success {
            warn!("Order for {} not filled: {}", symbol, order.status.as_str());
            return None;
        }
        let fill = order.filled_price.unwrap_or(price);

        if decision.intent.is_closing() {
            return Some(match self.book.close(symbol, fill) {
                Ok(closed) => {
                    self.backfill(symbol, &closed);
                    Execution::Closed {
                        lot: closed.lot.id,
                        pl: closed.realized_pl,
                    }
                }
                Err(e) => {
                    warn!("Closed {} without a tracked lot: {}", symbol, e);
                    Execution::Untracked
                }
            });
        }

        match self.book.open(symbol, side, decision.size, fill, Some(record_id)) {
            Ok(lot) => {
                // the stop covers the whole lot after an add
                if let Some(stop) = decision.stop_loss_price {
                    let stop_pct = (fill - stop).abs() / fill;
                    if let Err(e) = self
                        .broker
                        .place_stop_loss(symbol, lot.qty, side, fill, stop_pct)
                        .await
                    {
                        warn!("Stop loss for {} not placed: {}", symbol, e);
                    }
                }
                Some(Execution::Opened(lot.id))
            }
            Err(e) => {
                warn!("Opened {} without a tracked lot: {}", symbol, e);
                Some(Execution::Untracked)
            }
        }
    }

    /// Attach each opening record's share of realized P&L
    fn backfill(&self, symbol: &str, closed: &ClosedLot) {
        for (record, pl) in closed.allocations() {
            let result = match record {
                Some(record) => match self.experience.resolve_outcome(record, pl) {
                    Err(OutcomeError::RecordNotFound(_)) => self.experience.resolve_latest_open(symbol, pl),
                    other => other,
                },
                None => self.experience.resolve_latest_open(symbol, pl),
            };
            if let Err(e) = result {
                warn!("Outcome for {} not recorded: {}", symbol, e);
            }
        }
    }

    async fn reflect_and_adapt(&self, cycle: u64) -> Result<RunReport> {
        let prompt = self.reflection_prompt(cycle);
        let text = match self.advisor.reflect(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Reflection failed: {}", e);
                format!("Reflection error: {}", e)
            }
        };
        self.remember_reflection(cycle, &text);
        self.adapt(cycle, &text)
    }

    /// Feed one reflection to the controller and persist the result
    pub fn adapt(&self, cycle: u64, reflection: &str) -> Result<RunReport> {
        let pnls = self.experience.recent_resolved_pnls(self.config.adaptation.window);
        let report = self
            .controller
            .run(
                ControllerInput {
                    cycle,
                    resolved_pnls: &pnls,
                    reflection: Some(reflection),
                },
                |settings, state| self.save_state(settings, state),
            )
            .context("Adaptation state not saved")?;
        if let Some(digest) = &report.digest {
            info!("{}", digest);
        }
        Ok(report)
    }

    fn remember_reflection(&self, cycle: u64, text: &str) {
        let mut reflections = self.reflections.lock();
        reflections.push(ReflectionEntry {
            cycle,
            timestamp: Utc::now(),
            text: text.to_string(),
        });
        let excess = reflections.len().saturating_sub(REFLECTION_RETAIN);
        reflections.drain(..excess);
    }

    fn reflection_prompt(&self, cycle: u64) -> String {
        let settings = self.risk.snapshot();
        let records = self.experience.records();
        let resolved: Vec<ExperienceRecord> = records
            .iter()
            .rev()
            .filter(|r| r.is_resolved())
            .take(REFLECTION_RECORDS)
            .cloned()
            .collect();

        let mut lines = vec![
            format!("Trading review after cycle {}.", cycle),
            format!("Realized P&L to date: {}", format_usd(self.book.realized_pl())),
            summarize_outcomes(&resolved),
            "Current risk parameters:".to_string(),
        ];
        for param in settings.iter() {
            lines.push(format!(
                "  {} = {} (range {} to {}{})",
                param.key,
                param.value,
                param.min(),
                param.max(),
                if param.exposed() { "" } else { ", fixed" }
            ));
        }
        if let Some(last) = self.reflections.lock().last() {
            lines.push(format!("Previous reflection: {}", excerpt(&last.text, 500)));
        }
        lines.push(
            "Reflect on what worked and what did not. You may end with a JSON object \
             {\"param_suggestions\": {\"<name>\": <value>}, \"confidence\": \"low|medium|high\"}."
                .to_string(),
        );
        lines.join("\n")
    }

    fn state_document(&self, settings: &RiskSettings, controller: ControllerState) -> AgentState {
        AgentState {
            cycle: self.current_cycle(),
            risk: settings.values(),
            controller,
            lots: self.book.open_lots(),
            realized_pl: self.book.realized_pl(),
            reflections: self.reflections.lock().clone(),
        }
    }

    fn save_state(&self, settings: &RiskSettings, controller: &ControllerState) -> Result<(), PersistenceError> {
        self.state_file.save(&self.state_document(settings, controller.clone()))
    }

    /// Save the experience log, then the live state. The state document
    /// is written last so a failed log write leaves it untouched.
    pub fn persist(&self) -> Result<(), PersistenceError> {
        self.experience.persist()?;
        let settings = self.risk.snapshot();
        let controller = self.controller.state_snapshot();
        self.save_state(&settings, &controller)
    }
}

enum Execution {
    Opened(uuid::Uuid),
    Closed { lot: uuid::Uuid, pl: f64 },
    /// Filled, but no lot could be opened or closed
    Untracked,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::snapshot::tests::snapshot;
    use crate::experience::MacdCross;
    use crate::indicators::tests::bars_from_closes;
    use crate::utils::TradeAction;

    fn agent(dir: &std::path::Path, closes: &[f64]) -> (Arc<ReplayMarketData>, TradingAgent) {
        let mut config = AppConfig::default();
        config.persistence.state_dir = dir.to_string_lossy().to_string();
        config.trading.reflection_interval_cycles = 2;
        let mut series = BTreeMap::new();
        series.insert("SPY".to_string(), bars_from_closes(closes));
        let market = Arc::new(ReplayMarketData::new(series, 30));
        let broker = Arc::new(PaperBroker::new(10_000.0, market.clone()));
        let agent = TradingAgent::new(Arc::new(config), market.clone(), Arc::new(OfflineAdvisor), broker).unwrap();
        (market, agent)
    }

    #[tokio::test]
    async fn test_uptrend_opens_with_fallback_and_records_experience() {
        let dir = tempfile::tempdir().unwrap();
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.5 + if i % 2 == 0 { 0.8 } else { -0.8 }).collect();
        let (market, agent) = agent(dir.path(), &closes);
        market.advance();

        let report = agent.run_cycle().await.unwrap();
        assert_eq!(report.cycle, 1);
        assert_eq!(report.outcomes.len(), 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.decision.source, DecisionSource::Fallback);
        assert!(outcome.decision.reason.starts_with("[fallback]"));

        let record = agent.experience().get(outcome.record_id).unwrap();
        assert_eq!(record.source, DecisionSource::Fallback);
        if outcome.executed {
            assert_eq!(outcome.decision.action, TradeAction::Buy);
            assert_eq!(record.lot_id, agent.positions().get("SPY").map(|l| l.id));
        }
        assert!(dir.path().join("agent_state.json").exists());
        assert!(dir.path().join("experience_log.json").exists());
    }

    #[tokio::test]
    async fn test_reflection_error_reaches_controller_and_state_restores() {
        let dir = tempfile::tempdir().unwrap();
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        {
            let (market, agent) = agent(dir.path(), &closes);
            market.advance();
            agent.run_cycle().await.unwrap();
            market.advance();
            let report = agent.run_cycle().await.unwrap();
            // no resolved trades yet, so the controller skips
            assert!(report.adaptation.unwrap().skipped);
        }
        let (_market, restored) = agent(dir.path(), &closes);
        assert_eq!(restored.current_cycle(), 2);
        assert_eq!(restored.experience().len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_experience_log_never_leaves_state_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let (market, agent) = agent(dir.path(), &closes);
        let mut resolved = ExperienceRecord::new("SPY", snapshot("SPY", 50.0, MacdCross::Bullish, 0.01), TradeAction::Buy, 3);
        resolved.trade_outcome_pl = Some(10.0);
        agent.experience().append(resolved);
        // a directory in place of the log makes every log write fail
        std::fs::create_dir(dir.path().join("experience_log.json")).unwrap();

        let report = agent
            .adapt(0, r#"{"param_suggestions": {"min_sentiment_for_buy": 70}}"#)
            .unwrap();
        assert!(!report.skipped);
        assert_eq!(agent.risk().snapshot().min_sentiment_for_buy(), 70.0);
        let read = || -> AgentState {
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("agent_state.json")).unwrap()).unwrap()
        };
        let saved = read();
        assert_eq!(saved.risk[&ParamKey::MinSentimentForBuy], 70.0);
        assert_eq!(saved.controller.runs, 1);

        // the cycle's log write fails before the state document is touched
        market.advance();
        assert!(agent.run_cycle().await.is_err());
        assert_eq!(agent.current_cycle(), 1);
        assert_eq!(read().cycle, 0);
        assert!(agent.persist().is_err());
        assert_eq!(read(), saved);
    }
}
