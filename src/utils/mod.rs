//! Shared types and helpers

pub mod helpers;
pub mod types;

pub use types::{AccountSnapshot, Bar, DecisionSource, HoldingSnapshot, TradeAction, TradeSide};
