//! Decision making
//!
//! - Advisor output parsing with a neutral default
//! - Technical fallback when the advisor is unavailable
//! - BUY / SELL / HOLD state machine with risk-based sizing

pub mod advisor;
pub mod engine;

pub use advisor::{AdvisorError, AdvisorRecommendation};
pub use engine::{decide, DecisionInput, TradeDecision, TradeIntent};
