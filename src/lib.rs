//! Adaptive Trader Library
//!
//! An advisor-driven trading loop that sizes positions from live risk
//! settings, remembers past decisions and their outcomes, and tunes its own
//! risk parameters from realized performance and periodic reflections.

pub mod agent;
pub mod config;
pub mod controller;
pub mod decision;
pub mod experience;
pub mod indicators;
pub mod persistence;
pub mod position;
pub mod risk;
pub mod sizing;
pub mod telemetry;
pub mod utils;

// Re-export main types
pub use agent::{AgentState, TradingAgent};
pub use config::AppConfig;
pub use controller::{AdaptiveController, RunReport};
pub use decision::{decide, TradeDecision};
pub use experience::{ExperienceRecord, ExperienceStore, MarketStateSnapshot};
pub use position::PositionBook;
pub use risk::{ParamKey, RiskSettings, RiskStore};
