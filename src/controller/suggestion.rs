//! Parameter suggestions embedded in reflection text
//!
//! The advisor may append an object such as
//! `{"param_suggestions": {"max_risk_per_trade_percent": 0.03}, "confidence": "high"}`
//! to its reflection. Parsing never touches live state; it yields a
//! [`ParsedReflection`] which the controller validates and clamps.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::utils::helpers::extract_json_object;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SuggestionParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("param_suggestions must be an object")]
    NotAnObject,
}

/// Advisor confidence label scaling the performance step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Low,
    Neutral,
    High,
}

impl Confidence {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "low" => Confidence::Low,
            "high" => Confidence::High,
            _ => Confidence::Neutral,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Confidence::Low => 0.5,
            Confidence::Neutral => 1.0,
            Confidence::High => 1.25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Neutral => "neutral",
            Confidence::High => "high",
        }
    }
}

/// One raw suggestion, not yet validated
#[derive(Debug, Clone, PartialEq)]
pub struct RawSuggestion {
    pub name: String,
    pub value: Value,
}

impl RawSuggestion {
    /// Numeric value, accepting numeric strings
    pub fn numeric(&self) -> Option<f64> {
        let value = match &self.value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        value.is_finite().then_some(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReflection {
    /// No structured object, or an object without suggestions
    Empty { confidence: Confidence },
    Suggestions { items: Vec<RawSuggestion>, confidence: Confidence },
    Failure(SuggestionParseError),
}

impl ParsedReflection {
    pub fn parse(text: &str) -> Self {
        let Some(json) = extract_json_object(text) else {
            // an opening brace with no balanced object is a truncated payload
            if text.contains('{') {
                return ParsedReflection::Failure(SuggestionParseError::InvalidJson(
                    "unbalanced braces".to_string(),
                ));
            }
            return ParsedReflection::Empty { confidence: Confidence::Neutral };
        };
        let object: Map<String, Value> = match serde_json::from_str(json) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return ParsedReflection::Failure(SuggestionParseError::NotAnObject),
            Err(e) => return ParsedReflection::Failure(SuggestionParseError::InvalidJson(e.to_string())),
        };

        let confidence = object
            .get("confidence")
            .and_then(Value::as_str)
            .map(Confidence::from_label)
            .unwrap_or(Confidence::Neutral);

        match object.get("param_suggestions") {
            None | Some(Value::Null) => ParsedReflection::Empty { confidence },
            Some(Value::Object(map)) => ParsedReflection::Suggestions {
                items: map
                    .iter()
                    .map(|(name, value)| RawSuggestion {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                confidence,
            },
            Some(_) => ParsedReflection::Failure(SuggestionParseError::NotAnObject),
        }
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            ParsedReflection::Empty { confidence } | ParsedReflection::Suggestions { confidence, .. } => *confidence,
            ParsedReflection::Failure(_) => Confidence::Neutral,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suggestions_with_confidence() {
        let text = "Losses came from oversized entries.\n{\"param_suggestions\": {\"max_risk_per_trade_percent\": 0.03, \"min_sentiment_for_buy\": \"55\"}, \"confidence\": \"HIGH\"}";
        let ParsedReflection::Suggestions { items, confidence } = ParsedReflection::parse(text) else {
            panic!("expected suggestions");
        };
        assert_eq!(confidence, Confidence::High);
        assert_eq!(items.len(), 2);
        let sentiment = items.iter().find(|s| s.name == "min_sentiment_for_buy").unwrap();
        assert_eq!(sentiment.numeric(), Some(55.0));
    }

    #[test]
    fn test_plain_text_is_empty() {
        assert_eq!(
            ParsedReflection::parse("Nothing to change this week."),
            ParsedReflection::Empty { confidence: Confidence::Neutral }
        );
    }

    #[test]
    fn test_broken_json_is_failure() {
        assert!(matches!(
            ParsedReflection::parse("{\"param_suggestions\": {\"x\": }}"),
            ParsedReflection::Failure(SuggestionParseError::InvalidJson(_))
        ));
        assert_eq!(
            ParsedReflection::parse("{\"param_suggestions\": [1, 2]}"),
            ParsedReflection::Failure(SuggestionParseError::NotAnObject)
        );
    }

    #[test]
    fn test_truncated_object_is_failure() {
        let text = "Tighten entries. {\"param_suggestions\": {\"min_sentiment_for_buy\": 55}, \"confidence\": \"hi";
        assert_eq!(
            ParsedReflection::parse(text),
            ParsedReflection::Failure(SuggestionParseError::InvalidJson("unbalanced braces".to_string()))
        );
    }

    #[test]
    fn test_non_numeric_value() {
        let raw = RawSuggestion { name: "min_sentiment_for_buy".into(), value: Value::Bool(true) };
        assert_eq!(raw.numeric(), None);
    }

    #[test]
    fn test_confidence_weights() {
        assert_eq!(Confidence::from_label("low").weight(), 0.5);
        assert_eq!(Confidence::from_label("medium").weight(), 1.0);
        assert_eq!(Confidence::from_label("high").weight(), 1.25);
    }
}
