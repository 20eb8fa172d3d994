//! Advisor recommendations
//!
//! Advisor output is untrusted text. [`AdvisorRecommendation::parse`] finds
//! the first JSON object in it and validates each field; callers that need
//! a value no matter what use [`AdvisorRecommendation::parse_or_default`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::utils::helpers::{excerpt, extract_json_object};
use crate::utils::TradeAction;

pub const SENTIMENT_LIMIT: i32 = 100;

/// Sentiment assigned by the technical fallback
pub const FALLBACK_SENTIMENT: i32 = 50;

pub const UNPARSEABLE_RISKS: &str = "advisor output could not be parsed";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdvisorError {
    #[error("advisor unavailable: {0}")]
    Unavailable(String),
    #[error("advisor output malformed: {0}")]
    Malformed(String),
}

/// Structured advisor opinion on one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorRecommendation {
    /// Clamped to [-100, 100]
    pub sentiment: i32,
    pub action: TradeAction,
    pub reasoning: String,
    pub risks: String,
}

impl AdvisorRecommendation {
    pub fn new(sentiment: i32, action: TradeAction, reasoning: impl Into<String>) -> Self {
        Self {
            sentiment: sentiment.clamp(-SENTIMENT_LIMIT, SENTIMENT_LIMIT),
            action,
            reasoning: reasoning.into(),
            risks: String::new(),
        }
    }

    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self::new(0, TradeAction::Hold, reasoning)
    }

    /// Parse the first JSON object in `text`
    pub fn parse(text: &str) -> Result<Self, AdvisorError> {
        let json = extract_json_object(text)
            .ok_or_else(|| AdvisorError::Malformed("no JSON object found".to_string()))?;
        let value: Value = serde_json::from_str(json).map_err(|e| AdvisorError::Malformed(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| AdvisorError::Malformed("expected a JSON object".to_string()))?;

        let sentiment = match object.get("sentiment") {
            None | Some(Value::Null) => 0,
            Some(v) => parse_sentiment(v)
                .ok_or_else(|| AdvisorError::Malformed(format!("sentiment is not a number: {}", v)))?,
        };
        let action = object
            .get("action")
            .and_then(Value::as_str)
            .map(TradeAction::from_label)
            .unwrap_or(TradeAction::Hold);
        let text_field = |key: &str| object.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

        Ok(Self {
            sentiment,
            action,
            reasoning: text_field("reasoning"),
            risks: text_field("risks"),
        })
    }

    /// Parse, or fall back to a neutral HOLD carrying the raw text
    pub fn parse_or_default(text: &str) -> Self {
        Self::parse(text).unwrap_or_else(|_| Self {
            sentiment: 0,
            action: TradeAction::Hold,
            reasoning: excerpt(text, 2_000),
            risks: UNPARSEABLE_RISKS.to_string(),
        })
    }

    /// Price against SMA20 with an RSI bound, used when the advisor is
    /// unavailable. Missing inputs yield HOLD.
    pub fn technical_fallback(price: f64, sma20: Option<f64>, rsi: Option<f64>) -> Self {
        let (Some(sma), Some(rsi)) = (sma20, rsi) else {
            return Self::hold("Indicators unavailable for the technical rule");
        };
        if price > sma && rsi < 70.0 {
            Self::new(
                FALLBACK_SENTIMENT,
                TradeAction::Buy,
                format!("Price {:.2} above SMA20 {:.2} with RSI {:.1} below 70", price, sma, rsi),
            )
        } else if price < sma && rsi > 30.0 {
            Self::new(
                -FALLBACK_SENTIMENT,
                TradeAction::Sell,
                format!("Price {:.2} below SMA20 {:.2} with RSI {:.1} above 30", price, sma, rsi),
            )
        } else {
            Self::hold(format!("No technical edge: price {:.2}, SMA20 {:.2}, RSI {:.1}", price, sma, rsi))
        }
    }
}

fn parse_sentiment(value: &Value) -> Option<i32> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(-SENTIMENT_LIMIT as f64, SENTIMENT_LIMIT as f64) as i32)
}
