//! Experience records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::snapshot::MarketStateSnapshot;
use crate::utils::{DecisionSource, TradeAction};

/// One decision with its context and, once known, its realized P&L
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub market_state: MarketStateSnapshot,
    /// Context handed to the advisor
    pub advisor_context: String,
    /// Advisor output as received
    pub advisor_output: String,
    pub action_taken: TradeAction,
    pub size: u64,
    pub rationale: String,
    pub source: DecisionSource,
    /// Lot opened or added to by this decision
    #[serde(default)]
    pub lot_id: Option<Uuid>,
    /// Lot closed by this decision
    #[serde(default)]
    pub closed_lot_id: Option<Uuid>,
    #[serde(default)]
    pub trade_outcome_pl: Option<f64>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ExperienceRecord {
    pub fn new(symbol: impl Into<String>, market_state: MarketStateSnapshot, action_taken: TradeAction, size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            symbol: symbol.into(),
            market_state,
            advisor_context: String::new(),
            advisor_output: String::new(),
            action_taken,
            size,
            rationale: String::new(),
            source: DecisionSource::Advisor,
            lot_id: None,
            closed_lot_id: None,
            trade_outcome_pl: None,
            resolved_at: None,
        }
    }

    pub fn with_advisor(mut self, context: impl Into<String>, output: impl Into<String>) -> Self {
        self.advisor_context = context.into();
        self.advisor_output = output.into();
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>, source: DecisionSource) -> Self {
        self.rationale = rationale.into();
        self.source = source;
        self
    }

    pub fn opening(mut self, lot_id: Uuid) -> Self {
        self.lot_id = Some(lot_id);
        self
    }

    pub fn closing(mut self, lot_id: Uuid) -> Self {
        self.closed_lot_id = Some(lot_id);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.trade_outcome_pl.is_some()
    }

    /// A filled opening decision whose P&L is still pending
    pub fn awaits_outcome(&self) -> bool {
        !self.is_resolved()
            && self.action_taken != TradeAction::Hold
            && self.size > 0
            && self.closed_lot_id.is_none()
    }
}
