//! Alert management for notifications

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::TelemetryConfig;
use crate::controller::{AnomalyEvent, AnomalyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    /// Severity of an adaptation anomaly
    pub fn for_anomaly(kind: AnomalyKind) -> Self {
        match kind {
            AnomalyKind::RiskParamLimit | AnomalyKind::ParamStuck | AnomalyKind::LlmErrorStreak => AlertLevel::Error,
            AnomalyKind::LlmVolatility | AnomalyKind::LlmOscillation | AnomalyKind::FrequentAdaptations => {
                AlertLevel::Warning
            }
            AnomalyKind::NoAdaptation => AlertLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Error, title, message)
    }

    pub fn anomaly(event: &AnomalyEvent) -> Self {
        Self::new(
            AlertLevel::for_anomaly(event.kind),
            format!("Adaptation anomaly: {}", event.kind),
            event.details.clone(),
        )
        .with_details(serde_json::json!({
            "id": event.id,
            "cycle": event.cycle,
            "kind": event.kind,
            "param": event.param,
        }))
    }

    fn webhook_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "text": format!("*{}*\n{}", self.title, self.message),
            "level": self.level,
            "timestamp": self.timestamp,
            "details": self.details,
        })
    }
}

pub struct AlertManager {
    enabled: bool,
    webhook_url: Option<String>,
    http_client: reqwest::Client,
}

impl AlertManager {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            enabled: config.enable_alerts,
            webhook_url: config.alert_webhook.clone(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn send(&self, alert: Alert) {
        if !self.enabled {
            return;
        }

        match alert.level {
            AlertLevel::Info => info!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Warning => warn!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Error => error!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Critical => error!("[CRITICAL] {}: {}", alert.title, alert.message),
        }

        if let Some(url) = &self.webhook_url {
            if let Err(e) = self.send_webhook(url, &alert).await {
                warn!("Failed to send webhook alert: {}", e);
            }
        }
    }

    /// Surface newly detected anomalies, one alert each
    pub async fn send_anomalies(&self, anomalies: &[AnomalyEvent]) {
        for anomaly in anomalies {
            self.send(Alert::anomaly(anomaly)).await;
        }
    }

    async fn send_webhook(&self, url: &str, alert: &Alert) -> Result<()> {
        self.http_client
            .post(url)
            .json(&alert.webhook_payload())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::ParamKey;
    use chrono::Utc;

    #[test]
    fn test_anomaly_alert_carries_context() {
        let event = AnomalyEvent {
            id: 4,
            timestamp: Utc::now(),
            cycle: 21,
            kind: AnomalyKind::RiskParamLimit,
            param: Some(ParamKey::MaxRiskPerTradePercent),
            details: "max_risk_per_trade_percent reached its limit 0.1".to_string(),
        };
        let alert = Alert::anomaly(&event);
        assert_eq!(alert.level, AlertLevel::Error);
        assert_eq!(alert.title, "Adaptation anomaly: risk_param_limit");
        let details = alert.details.unwrap();
        assert_eq!(details["param"], "max_risk_per_trade_percent");
        assert_eq!(details["cycle"], 21);
    }

    #[test]
    fn test_webhook_payload() {
        let payload = Alert::new(AlertLevel::Critical, "State not saved", "Cycle 3: disk full").webhook_payload();
        assert_eq!(payload["text"], "*State not saved*\nCycle 3: disk full");
        assert_eq!(payload["level"], "critical");
        assert!(payload["details"].is_null());
    }

    #[tokio::test]
    async fn test_disabled_manager_is_silent() {
        let manager = AlertManager::new(&TelemetryConfig::default());
        assert!(!manager.is_enabled());
        manager.send(Alert::error("test", "nothing happens")).await;
    }
}
