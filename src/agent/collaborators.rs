//! External collaborator contracts
//!
//! The trading cycle only talks to market data, the advisor and the broker
//! through these traits, so each can be replaced by a fake in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::decision::AdvisorError;
use crate::indicators::IndicatorRow;
use crate::utils::{AccountSnapshot, Bar, HoldingSnapshot, TradeSide};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarketDataError {
    #[error("no market data for {0}")]
    NoData(String),
    #[error("market data unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("order rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait MarketData: Send + Sync {
    /// Most recent `lookback` bars, ascending with unique timestamps
    async fn bars(&self, symbol: &str, lookback: usize) -> Result<Vec<Bar>, MarketDataError>;

    async fn latest_price(&self, symbol: &str) -> Result<f64, MarketDataError>;

    async fn headlines(&self, _symbol: &str) -> Result<Vec<String>, MarketDataError> {
        Ok(Vec::new())
    }

    /// Move to the next period. Finite feeds return false once exhausted.
    fn advance(&self) -> bool {
        true
    }
}

/// Everything the advisor sees for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub symbol: String,
    pub price: f64,
    pub indicator_history: Vec<IndicatorRow>,
    pub headlines: Vec<String>,
    /// Outcome summary of similar past experiences
    pub past_performance: String,
}

#[async_trait]
pub trait Advisor: Send + Sync {
    /// Raw advisor text, parsed leniently by the caller
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, AdvisorError>;

    /// Free-text reflection, optionally carrying parameter suggestions
    async fn reflect(&self, prompt: &str) -> Result<String, AdvisorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Success,
    Failed,
    Skipped,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Success => "success",
            OrderStatus::Failed => "failed",
            OrderStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub status: OrderStatus,
    pub order_id: Option<String>,
    pub filled_price: Option<f64>,
}

impl OrderResult {
    pub fn filled(order_id: impl Into<String>, price: f64) -> Self {
        Self {
            status: OrderStatus::Success,
            order_id: Some(order_id.into()),
            filled_price: Some(price),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: OrderStatus::Failed,
            order_id: None,
            filled_price: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: OrderStatus::Skipped,
            order_id: None,
            filled_price: None,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn account(&self) -> Result<AccountSnapshot, BrokerError>;

    /// Open positions by symbol
    async fn positions(&self) -> Result<BTreeMap<String, HoldingSnapshot>, BrokerError>;

    async fn submit_order(&self, symbol: &str, side: TradeSide, qty: u64) -> Result<OrderResult, BrokerError>;

    /// Protective stop for a freshly opened position. `stop_pct` is the
    /// distance from `entry_price` as a fraction.
    async fn place_stop_loss(
        &self,
        symbol: &str,
        qty: u64,
        side: TradeSide,
        entry_price: f64,
        stop_pct: f64,
    ) -> Result<(), BrokerError>;
}
