//! Trading Decision Engine
//!
//! Per symbol per cycle: advisor recommendation + holdings + live risk
//! settings -> BUY / SELL / HOLD with a size and a reason. Opening trades
//! are sized by the position sizer; closing trades use the full held
//! quantity.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::advisor::AdvisorRecommendation;
use crate::risk::RiskSettings;
use crate::sizing::{self, SizingRequest};
use crate::telemetry::metrics;
use crate::utils::helpers::format_percentage;
use crate::utils::{DecisionSource, TradeAction, TradeSide};

/// Stop distance as a multiple of the risk-per-trade percent
pub const DEFAULT_STOP_MULTIPLE: f64 = 2.0;

/// What an executed decision does to the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeIntent {
    OpenLong,
    CloseLong,
    OpenShort,
    CoverShort,
    None,
}

impl TradeIntent {
    pub fn is_opening(&self) -> bool {
        matches!(self, TradeIntent::OpenLong | TradeIntent::OpenShort)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, TradeIntent::CloseLong | TradeIntent::CoverShort)
    }
}

/// Everything the engine looks at for one symbol
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub symbol: &'a str,
    pub recommendation: &'a AdvisorRecommendation,
    pub source: DecisionSource,
    pub price: f64,
    pub cash: f64,
    pub portfolio_value: f64,
    /// Signed quantity currently held, negative when short
    pub holding_qty: f64,
    pub atr: Option<f64>,
    /// Overrides the default stop derived from the risk percent
    pub stop_loss_price: Option<f64>,
}

/// Terminal state of one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    pub action: TradeAction,
    pub size: u64,
    pub reason: String,
    pub source: DecisionSource,
    pub sentiment: i32,
    pub intent: TradeIntent,
    /// Stop used for sizing an opening trade
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
}

impl TradeDecision {
    pub fn is_trade(&self) -> bool {
        self.action != TradeAction::Hold && self.size > 0
    }

    pub fn side(&self) -> Option<TradeSide> {
        self.action.side()
    }
}

/// Decide for one symbol against a read-only settings snapshot
pub fn decide(settings: &RiskSettings, input: &DecisionInput<'_>) -> TradeDecision {
    let outcome = evaluate(settings, input);
    let reason = match input.source {
        DecisionSource::Advisor => outcome.reason,
        DecisionSource::Fallback => format!("[fallback] {}", outcome.reason),
    };
    let decision = TradeDecision {
        action: outcome.action,
        size: outcome.size,
        reason,
        source: input.source,
        sentiment: input.recommendation.sentiment,
        intent: outcome.intent,
        stop_loss_price: outcome.stop,
    };

    metrics::record_decision(decision.action.as_str(), decision.source.as_str());
    info!(
        symbol = input.symbol,
        action = %decision.action,
        size = decision.size,
        source = decision.source.as_str(),
        "{}",
        decision.reason
    );
    decision
}

struct Outcome {
    action: TradeAction,
    size: u64,
    intent: TradeIntent,
    reason: String,
    stop: Option<f64>,
}

impl Outcome {
    fn hold(reason: String) -> Self {
        Self {
            action: TradeAction::Hold,
            size: 0,
            intent: TradeIntent::None,
            reason,
            stop: None,
        }
    }

    fn trade(action: TradeAction, size: u64, intent: TradeIntent, reason: String, stop: Option<f64>) -> Self {
        Self { action, size, intent, reason, stop }
    }
}

fn evaluate(settings: &RiskSettings, input: &DecisionInput<'_>) -> Outcome {
    let rec = input.recommendation;
    let sentiment = rec.sentiment as f64;
    let min_buy = settings.min_sentiment_for_buy();
    let min_sell = settings.min_sentiment_for_sell();

    if !(input.price.is_finite() && input.price > 0.0) {
        return Outcome::hold(format!("No valid price for {}", input.symbol));
    }

    match rec.action {
        TradeAction::Buy if sentiment > min_buy => buy_path(settings, input),
        TradeAction::Sell if sentiment < min_sell => sell_path(settings, input),
        _ => Outcome::hold(format!(
            "Advisor action '{}' or sentiment {} not strong enough (min buy: {}, min sell: {})",
            rec.action, rec.sentiment, min_buy, min_sell
        )),
    }
}

fn buy_path(settings: &RiskSettings, input: &DecisionInput<'_>) -> Outcome {
    let sentiment = input.recommendation.sentiment;

    if input.holding_qty < 0.0 {
        let qty = input.holding_qty.abs().floor() as u64;
        if qty == 0 {
            return Outcome::hold("Advisor recommended BUY, but the open short is below one share".to_string());
        }
        return Outcome::trade(
            TradeAction::Buy,
            qty,
            TradeIntent::CoverShort,
            format!("Advisor recommended BUY (sentiment {}). Covering short of {} shares.", sentiment, qty),
            None,
        );
    }

    let max_position = settings.max_position_per_asset_percent();
    if input.portfolio_value <= 0.0 {
        return Outcome::hold("Advisor recommended BUY, but portfolio value is not positive".to_string());
    }
    let holding_fraction = input.holding_qty * input.price / input.portfolio_value;
    if holding_fraction >= max_position {
        return Outcome::hold(format!(
            "Advisor recommended BUY, but already at max position ({}) for {}",
            format_percentage(max_position),
            input.symbol
        ));
    }

    let stop = input
        .stop_loss_price
        .unwrap_or(input.price * (1.0 - DEFAULT_STOP_MULTIPLE * settings.max_risk_per_trade_percent()));
    let shares = sizing::size(settings, &request(input, TradeSide::Buy, stop));
    if shares == 0 {
        return Outcome::hold(
            "Advisor recommended BUY, but position sizing resulted in 0 shares (cash, risk budget or stop/ATR)".to_string(),
        );
    }
    Outcome::trade(
        TradeAction::Buy,
        shares,
        TradeIntent::OpenLong,
        format!("Advisor recommended BUY (sentiment {}). Risk-managed size {} shares.", sentiment, shares),
        Some(stop),
    )
}

fn sell_path(settings: &RiskSettings, input: &DecisionInput<'_>) -> Outcome {
    let sentiment = input.recommendation.sentiment;

    if input.holding_qty > 0.0 {
        let qty = input.holding_qty.floor() as u64;
        if qty == 0 {
            return Outcome::hold("Advisor recommended SELL, but the open long is below one share".to_string());
        }
        return Outcome::trade(
            TradeAction::Sell,
            qty,
            TradeIntent::CloseLong,
            format!("Advisor recommended SELL (sentiment {}). Closing existing position of {} shares.", sentiment, qty),
            None,
        );
    }
    if input.holding_qty < 0.0 {
        return Outcome::hold(format!("Advisor recommended SELL, but {} is already short", input.symbol));
    }

    let stop = input
        .stop_loss_price
        .unwrap_or(input.price * (1.0 + DEFAULT_STOP_MULTIPLE * settings.max_risk_per_trade_percent()));
    let shares = sizing::size(settings, &request(input, TradeSide::Sell, stop));
    if shares == 0 {
        return Outcome::hold("Advisor recommended SELL/SHORT, but position sizing resulted in 0 shares".to_string());
    }
    Outcome::trade(
        TradeAction::Sell,
        shares,
        TradeIntent::OpenShort,
        format!("Advisor recommended SELL (sentiment {}). Opening short of {} shares.", sentiment, shares),
        Some(stop),
    )
}

fn request(input: &DecisionInput<'_>, side: TradeSide, stop: f64) -> SizingRequest {
    SizingRequest {
        portfolio_value: input.portfolio_value,
        cash_available: input.cash,
        asset_price: input.price,
        side,
        sentiment: input.recommendation.sentiment as f64,
        stop_loss_price: Some(stop),
        atr: input.atr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(rec: &'a AdvisorRecommendation, holding_qty: f64) -> DecisionInput<'a> {
        DecisionInput {
            symbol: "MSFT",
            recommendation: rec,
            source: DecisionSource::Advisor,
            price: 400.0,
            cash: 10_000.0,
            portfolio_value: 100_000.0,
            holding_qty,
            atr: None,
            stop_loss_price: None,
        }
    }

    #[test]
    fn test_buy_is_sized() {
        let settings = RiskSettings::default();
        let rec = AdvisorRecommendation::new(75, TradeAction::Buy, "Strong news");
        let decision = decide(&settings, &input(&rec, 0.0));
        // stop = 400 * 0.9 = 360; risk $5000 (+boost) / $40 = 125; cash 25; cap 12
        assert_eq!(decision.action, TradeAction::Buy);
        assert_eq!(decision.size, 12);
        assert_eq!(decision.intent, TradeIntent::OpenLong);
        assert!((decision.stop_loss_price.unwrap() - 360.0).abs() < 1e-9);
        assert!(decision.reason.contains("BUY"));
    }

    #[test]
    fn test_buy_blocked_at_max_position() {
        let settings = RiskSettings::default();
        let rec = AdvisorRecommendation::new(75, TradeAction::Buy, "");
        let decision = decide(&settings, &input(&rec, 20.0));
        assert_eq!(decision.action, TradeAction::Hold);
        assert!(decision.reason.contains("already at max position"));
    }

    #[test]
    fn test_weak_sentiment_holds_with_thresholds() {
        let settings = RiskSettings::default();
        let rec = AdvisorRecommendation::new(30, TradeAction::Buy, "");
        let decision = decide(&settings, &input(&rec, 0.0));
        assert_eq!(decision.action, TradeAction::Hold);
        assert!(decision.reason.contains("min buy: 40"));
    }

    #[test]
    fn test_sell_closes_full_long() {
        let settings = RiskSettings::default();
        let rec = AdvisorRecommendation::new(-60, TradeAction::Sell, "");
        let decision = decide(&settings, &input(&rec, 7.0));
        assert_eq!((decision.action, decision.size), (TradeAction::Sell, 7));
        assert_eq!(decision.intent, TradeIntent::CloseLong);
    }

    #[test]
    fn test_sell_without_position_opens_short() {
        let settings = RiskSettings::default();
        let rec = AdvisorRecommendation::new(-60, TradeAction::Sell, "");
        let decision = decide(&settings, &input(&rec, 0.0));
        assert_eq!(decision.action, TradeAction::Sell);
        assert_eq!(decision.intent, TradeIntent::OpenShort);
        assert!(decision.size > 0);
        assert!((decision.stop_loss_price.unwrap() - 440.0).abs() < 1e-9);
    }

    #[test]
    fn test_buy_covers_short() {
        let settings = RiskSettings::default();
        let rec = AdvisorRecommendation::new(60, TradeAction::Buy, "");
        let decision = decide(&settings, &input(&rec, -9.0));
        assert_eq!((decision.action, decision.size), (TradeAction::Buy, 9));
        assert_eq!(decision.intent, TradeIntent::CoverShort);
    }

    #[test]
    fn test_zero_size_collapses_to_hold() {
        let settings = RiskSettings::default();
        let rec = AdvisorRecommendation::new(75, TradeAction::Buy, "");
        let mut inp = input(&rec, 0.0);
        inp.cash = 100.0;
        let decision = decide(&settings, &inp);
        assert_eq!(decision.action, TradeAction::Hold);
        assert_eq!(decision.size, 0);
        assert!(decision.reason.contains("0 shares"));
    }

    #[test]
    fn test_fallback_reason_is_tagged() {
        let settings = RiskSettings::default();
        let rec = AdvisorRecommendation::technical_fallback(400.0, Some(390.0), Some(50.0));
        let mut inp = input(&rec, 0.0);
        inp.source = DecisionSource::Fallback;
        let decision = decide(&settings, &inp);
        assert_eq!(decision.source, DecisionSource::Fallback);
        assert!(decision.reason.starts_with("[fallback]"));
        assert_eq!(decision.action, TradeAction::Buy);
    }
}
