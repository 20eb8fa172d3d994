//! Prometheus metrics export

use anyhow::Result;
use metrics::{counter, gauge, histogram, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::risk::RiskSettings;

pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_metrics();
    info!("Prometheus metrics server started on {}", addr);
    Ok(())
}

fn register_metrics() {
    // Risk parameters
    describe_gauge!("adaptive_trader_risk_param", "Live value of a risk parameter");

    // Decision metrics
    describe_counter!("adaptive_trader_decisions_total", "Decisions by action and source");
    describe_counter!("adaptive_trader_sizing_rejections_total", "Sizing calls that failed closed");

    // Trade metrics
    describe_counter!("adaptive_trader_orders_total", "Orders submitted by status");
    describe_gauge!("adaptive_trader_realized_pnl", "Cumulative realized P&L in USD");
    describe_gauge!("adaptive_trader_portfolio_value", "Portfolio value in USD");

    // Adaptation metrics
    describe_counter!("adaptive_trader_adaptation_events_total", "Audit events by kind");
    describe_counter!("adaptive_trader_anomalies_total", "Anomalies by kind");
    describe_counter!("adaptive_trader_shadow_tests_total", "Resolved shadow tests by outcome");

    // Cycle metrics
    describe_histogram!("adaptive_trader_cycle_duration_ms", "Trading cycle duration");
    describe_counter!("adaptive_trader_errors_total", "Total number of errors");
}

pub fn record_risk_settings(settings: &RiskSettings) {
    for param in settings.iter() {
        gauge!("adaptive_trader_risk_param", "param" => param.key.as_str()).set(param.value);
    }
}

pub fn record_decision(action: &'static str, source: &'static str) {
    counter!("adaptive_trader_decisions_total", "action" => action, "source" => source).increment(1);
}

pub fn record_sizing_rejection(reason: &'static str) {
    counter!("adaptive_trader_sizing_rejections_total", "reason" => reason).increment(1);
}

pub fn record_order(status: &'static str) {
    counter!("adaptive_trader_orders_total", "status" => status).increment(1);
}

pub fn record_realized_pnl(total: f64) {
    gauge!("adaptive_trader_realized_pnl").set(total);
}

pub fn record_portfolio_value(value: f64) {
    gauge!("adaptive_trader_portfolio_value").set(value);
}

pub fn record_adaptation_event(kind: &'static str) {
    counter!("adaptive_trader_adaptation_events_total", "kind" => kind).increment(1);
}

pub fn record_anomaly(kind: &'static str) {
    counter!("adaptive_trader_anomalies_total", "kind" => kind).increment(1);
}

pub fn record_shadow_outcome(outcome: &'static str) {
    counter!("adaptive_trader_shadow_tests_total", "outcome" => outcome).increment(1);
}

pub fn record_cycle_duration(duration_ms: f64) {
    histogram!("adaptive_trader_cycle_duration_ms").record(duration_ms);
}

pub fn record_error() {
    counter!("adaptive_trader_errors_total").increment(1);
}
