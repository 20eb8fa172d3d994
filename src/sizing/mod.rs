//! Position Sizer
//!
//! Converts a risk budget, advisor sentiment and a stop-loss or volatility
//! basis into a whole number of shares:
//! - Risk-per-trade percent, boosted by strong sentiment that agrees with the side
//! - Dollar risk per share from an explicit stop, else ATR x multiplier
//! - Capped by available cash and the per-asset position limit
//!
//! Sizing fails closed: any invalid input yields 0 shares and a logged
//! [`SizingRejection`], never an error for the caller to handle.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::risk::RiskSettings;
use crate::telemetry::metrics;
use crate::utils::TradeSide;

/// Multiple of the base risk percent the sentiment boost may reach
pub const MAX_BOOST_MULTIPLE: f64 = 1.5;

/// Why a sizing call produced no position
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingRejection {
    #[error("asset price {0} is not positive")]
    NonPositivePrice(f64),
    #[error("input {0} is not a finite number")]
    NonFiniteInput(&'static str),
    #[error("neither a stop-loss price nor an ATR was supplied")]
    NoRiskBasis,
    #[error("stop {stop} is on the wrong side of entry {price} for {side}")]
    StopOnWrongSide { price: f64, stop: f64, side: TradeSide },
    #[error("risk per share {0} is not positive")]
    NonPositiveRiskPerShare(f64),
}

impl SizingRejection {
    pub fn kind(&self) -> &'static str {
        match self {
            SizingRejection::NonPositivePrice(_) => "non_positive_price",
            SizingRejection::NonFiniteInput(_) => "non_finite_input",
            SizingRejection::NoRiskBasis => "no_risk_basis",
            SizingRejection::StopOnWrongSide { .. } => "stop_wrong_side",
            SizingRejection::NonPositiveRiskPerShare(_) => "non_positive_risk_per_share",
        }
    }
}

/// Inputs for one sizing call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingRequest {
    pub portfolio_value: f64,
    pub cash_available: f64,
    pub asset_price: f64,
    pub side: TradeSide,
    /// Advisor sentiment in [-100, 100]
    pub sentiment: f64,
    pub stop_loss_price: Option<f64>,
    pub atr: Option<f64>,
}

/// Parameters the sizer reads from the live risk settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizingParams {
    pub max_risk_per_trade_percent: f64,
    pub min_sentiment_for_size_increase: f64,
    pub sentiment_sizing_factor: f64,
    pub max_position_per_asset_percent: f64,
    pub atr_stop_multiplier: f64,
}

impl From<&RiskSettings> for SizingParams {
    fn from(settings: &RiskSettings) -> Self {
        Self {
            max_risk_per_trade_percent: settings.max_risk_per_trade_percent(),
            min_sentiment_for_size_increase: settings.min_sentiment_for_size_increase(),
            sentiment_sizing_factor: settings.sentiment_sizing_factor(),
            max_position_per_asset_percent: settings.max_position_per_asset_percent(),
            atr_stop_multiplier: settings.atr_stop_multiplier(),
        }
    }
}

/// Where the per-share risk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBasis {
    StopLoss,
    Atr,
}

/// Which cap determined the final size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeLimit {
    Risk,
    Cash,
    AssetCap,
}

/// Every intermediate value of a successful sizing call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizingBreakdown {
    pub base_risk_percent: f64,
    pub effective_risk_percent: f64,
    pub boosted: bool,
    pub dollar_risk: f64,
    pub risk_basis: RiskBasis,
    pub risk_per_share: f64,
    pub risk_shares: u64,
    pub cash_shares: u64,
    pub asset_cap_shares: u64,
    pub shares: u64,
    pub limit: SizeLimit,
}

/// Size a position against live settings. Rejections are logged and
/// reported as 0 shares.
pub fn size(settings: &RiskSettings, request: &SizingRequest) -> u64 {
    size_with(&SizingParams::from(settings), request)
}

pub fn size_with(params: &SizingParams, request: &SizingRequest) -> u64 {
    match evaluate(params, request) {
        Ok(breakdown) => breakdown.shares,
        Err(rejection) => {
            warn!(side = %request.side, price = request.asset_price, "Sizing failed closed: {}", rejection);
            metrics::record_sizing_rejection(rejection.kind());
            0
        }
    }
}

/// Full sizing computation
pub fn evaluate(params: &SizingParams, request: &SizingRequest) -> Result<SizingBreakdown, SizingRejection> {
    for (name, value) in [
        ("portfolio_value", request.portfolio_value),
        ("cash_available", request.cash_available),
        ("asset_price", request.asset_price),
        ("sentiment", request.sentiment),
    ] {
        if !value.is_finite() {
            return Err(SizingRejection::NonFiniteInput(name));
        }
    }
    let price = request.asset_price;
    if price <= 0.0 {
        return Err(SizingRejection::NonPositivePrice(price));
    }

    let base = params.max_risk_per_trade_percent;
    let (effective, boosted) = effective_risk_percent(params, request.side, request.sentiment);
    let dollar_risk = request.portfolio_value.max(0.0) * effective;

    let stop = request.stop_loss_price.filter(|s| s.is_finite() && *s > 0.0);
    let atr = request.atr.filter(|a| a.is_finite() && *a > 0.0);
    let (risk_basis, risk_per_share) = match (stop, atr) {
        (Some(stop), _) => {
            let per_share = match request.side {
                TradeSide::Buy => price - stop,
                TradeSide::Sell => stop - price,
            };
            if per_share <= 0.0 {
                return Err(SizingRejection::StopOnWrongSide { price, stop, side: request.side });
            }
            (RiskBasis::StopLoss, per_share)
        }
        (None, Some(atr)) => (RiskBasis::Atr, atr * params.atr_stop_multiplier),
        (None, None) => return Err(SizingRejection::NoRiskBasis),
    };
    if risk_per_share <= 0.0 {
        return Err(SizingRejection::NonPositiveRiskPerShare(risk_per_share));
    }

    let risk_shares = whole_shares(dollar_risk / risk_per_share);
    let cash_shares = whole_shares(request.cash_available / price);
    let asset_cap_shares = whole_shares(request.portfolio_value * params.max_position_per_asset_percent / price);

    let (shares, limit) = [
        (risk_shares, SizeLimit::Risk),
        (cash_shares, SizeLimit::Cash),
        (asset_cap_shares, SizeLimit::AssetCap),
    ]
    .into_iter()
    .min_by_key(|(n, _)| *n)
    .unwrap_or((0, SizeLimit::Risk));

    debug!(
        side = %request.side,
        effective_risk = effective,
        risk_per_share,
        risk_shares,
        cash_shares,
        asset_cap_shares,
        "Sized position: {} shares",
        shares
    );

    Ok(SizingBreakdown {
        base_risk_percent: base,
        effective_risk_percent: effective,
        boosted,
        dollar_risk,
        risk_basis,
        risk_per_share,
        risk_shares,
        cash_shares,
        asset_cap_shares,
        shares,
        limit,
    })
}

/// Base risk percent, multiplied by the sentiment boost when the sentiment
/// is strong enough and points the same way as the trade
fn effective_risk_percent(params: &SizingParams, side: TradeSide, sentiment: f64) -> (f64, bool) {
    let base = params.max_risk_per_trade_percent;
    let threshold = params.min_sentiment_for_size_increase;
    let agrees = match side {
        TradeSide::Buy => sentiment > threshold,
        TradeSide::Sell => sentiment < -threshold,
    };
    if !agrees {
        return (base, false);
    }
    let boost = (sentiment.abs() - threshold) * params.sentiment_sizing_factor / 100.0;
    let boosted = (base * (1.0 + boost)).min(base * MAX_BOOST_MULTIPLE);
    (boosted, boosted > base)
}

fn whole_shares(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.floor() as u64
    } else {
        0
    }
}
