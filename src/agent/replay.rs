//! Historical bar replay
//!
//! Loads `<dir>/<SYMBOL>.json` (a JSON array of bars) per symbol and reveals
//! one more bar each time the feed advances.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use anyhow::{Context, Result};
use tracing::{info, warn};

use super::collaborators::{MarketData, MarketDataError};
use crate::utils::Bar;

pub struct ReplayMarketData {
    series: BTreeMap<String, Vec<Bar>>,
    /// Number of bars currently visible per symbol
    visible: AtomicUsize,
    warmup: usize,
    longest: usize,
}

impl ReplayMarketData {
    /// `warmup` bars are visible after the first advance
    pub fn new(series: BTreeMap<String, Vec<Bar>>, warmup: usize) -> Self {
        let series: BTreeMap<String, Vec<Bar>> = series
            .into_iter()
            .map(|(symbol, bars)| (symbol, normalize(bars)))
            .collect();
        let longest = series.values().map(Vec::len).max().unwrap_or(0);
        Self {
            series,
            visible: AtomicUsize::new(0),
            warmup: warmup.max(1),
            longest,
        }
    }

    pub fn load(dir: &Path, symbols: &[String], warmup: usize) -> Result<Self> {
        let mut series = BTreeMap::new();
        for symbol in symbols {
            let path = dir.join(format!("{}.json", symbol));
            if !path.exists() {
                warn!("No bar file for {} at {:?}", symbol, path);
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read bar file: {:?}", path))?;
            let bars: Vec<Bar> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse bar file: {:?}", path))?;
            info!("Loaded {} bars for {}", bars.len(), symbol);
            series.insert(symbol.clone(), bars);
        }
        Ok(Self::new(series, warmup))
    }

    fn window(&self, symbol: &str) -> Result<&[Bar], MarketDataError> {
        let bars = self
            .series
            .get(symbol)
            .ok_or_else(|| MarketDataError::NoData(symbol.to_string()))?;
        let visible = self.visible.load(Ordering::SeqCst).min(bars.len());
        if visible == 0 {
            return Err(MarketDataError::NoData(symbol.to_string()));
        }
        Ok(&bars[..visible])
    }
}

/// Ascending by time, duplicate timestamps dropped
fn normalize(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    bars
}

#[async_trait]
impl MarketData for ReplayMarketData {
    async fn bars(&self, symbol: &str, lookback: usize) -> Result<Vec<Bar>, MarketDataError> {
        let window = self.window(symbol)?;
        Ok(window[window.len().saturating_sub(lookback)..].to_vec())
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        let window = self.window(symbol)?;
        window
            .last()
            .map(|b| b.close)
            .ok_or_else(|| MarketDataError::NoData(symbol.to_string()))
    }

    fn advance(&self) -> bool {
        let warmup = self.warmup;
        let step = |v: usize| if v < warmup { warmup } else { v + 1 };
        let previous = self
            .visible
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(step(v)))
            .unwrap_or_else(|v| v);
        step(previous) <= self.longest
    }
}
