//! Experience store
//!
//! Append-only log of decisions. Appends may come from parallel workers;
//! the only in-place mutation is the outcome backfill, serialized behind
//! the same write lock and refused for records already resolved.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::record::ExperienceRecord;
use super::snapshot::MarketStateSnapshot;
use crate::persistence::{PersistenceError, StateFile};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OutcomeError {
    #[error("no experience record {0}")]
    RecordNotFound(Uuid),
    #[error("no unresolved experience record for {0}")]
    NoOpenRecord(String),
    #[error("experience record {record} already resolved with P&L {pl}")]
    AlreadyResolved { record: Uuid, pl: f64 },
    #[error("realized P&L {0} is not finite")]
    NonFinite(f64),
}

/// On-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperienceLog {
    pub records: Vec<ExperienceRecord>,
}

pub struct ExperienceStore {
    records: RwLock<Vec<ExperienceRecord>>,
    file: Option<StateFile<ExperienceLog>>,
}

impl Default for ExperienceStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ExperienceStore {
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            file: None,
        }
    }

    /// Open a file-backed store, loading whatever was saved before
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let file = StateFile::new(path.as_ref());
        let log: ExperienceLog = file.load()?;
        info!("Experience log loaded: {} records", log.records.len());
        Ok(Self {
            records: RwLock::new(log.records),
            file: Some(file),
        })
    }

    pub fn with_records(records: Vec<ExperienceRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            file: None,
        }
    }

    /// Write the whole log atomically. No-op for in-memory stores.
    pub fn persist(&self) -> Result<(), PersistenceError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let log = ExperienceLog {
            records: self.records.read().clone(),
        };
        file.save(&log)
    }

    pub fn append(&self, record: ExperienceRecord) -> Uuid {
        let id = record.id;
        debug!(symbol = %record.symbol, action = %record.action_taken, "Experience recorded");
        self.records.write().push(record);
        id
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<ExperienceRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn records(&self) -> Vec<ExperienceRecord> {
        self.records.read().clone()
    }

    /// Past records in similar market conditions, oldest first, at most
    /// `max_results`. Empty when the current snapshot is incomplete.
    pub fn find_similar(&self, current: &MarketStateSnapshot, tolerance: f64, max_results: usize) -> Vec<ExperienceRecord> {
        if !current.is_complete() {
            debug!(symbol = %current.symbol, "Snapshot incomplete, skipping similarity search");
            return Vec::new();
        }
        let found: Vec<ExperienceRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| current.is_similar(&r.market_state, tolerance))
            .take(max_results)
            .cloned()
            .collect();
        debug!(symbol = %current.symbol, "Found {} similar past experiences", found.len());
        found
    }

    /// Backfill the opening record `record_id` with its share of a
    /// closed lot's P&L
    pub fn resolve_outcome(&self, record_id: Uuid, pl: f64) -> Result<Uuid, OutcomeError> {
        if !pl.is_finite() {
            return Err(OutcomeError::NonFinite(pl));
        }
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or(OutcomeError::RecordNotFound(record_id))?;
        apply_outcome(record, pl)
    }

    /// Backfill the most recent unresolved opening record for `symbol`
    pub fn resolve_latest_open(&self, symbol: &str, pl: f64) -> Result<Uuid, OutcomeError> {
        if !pl.is_finite() {
            return Err(OutcomeError::NonFinite(pl));
        }
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .rev()
            .find(|r| r.symbol == symbol && r.awaits_outcome())
            .ok_or_else(|| OutcomeError::NoOpenRecord(symbol.to_string()))?;
        apply_outcome(record, pl)
    }

    /// Realized P&L of the last `n` resolved records, in log order
    pub fn recent_resolved_pnls(&self, n: usize) -> Vec<f64> {
        let records = self.records.read();
        let mut pnls: Vec<f64> = records
            .iter()
            .rev()
            .filter_map(|r| r.trade_outcome_pl)
            .take(n)
            .collect();
        pnls.reverse();
        pnls
    }
}

fn apply_outcome(record: &mut ExperienceRecord, pl: f64) -> Result<Uuid, OutcomeError> {
    if let Some(existing) = record.trade_outcome_pl {
        return Err(OutcomeError::AlreadyResolved { record: record.id, pl: existing });
    }
    record.trade_outcome_pl = Some(pl);
    record.resolved_at = Some(Utc::now());
    info!(symbol = %record.symbol, record = %record.id, "Outcome backfilled: ${:.2}", pl);
    Ok(record.id)
}

/// Advisory text aggregating the outcomes of `records`
pub fn summarize_outcomes(records: &[ExperienceRecord]) -> String {
    if records.is_empty() {
        return "No similar past experiences to learn from.".to_string();
    }

    let mut profitable: BTreeMap<&str, usize> = BTreeMap::new();
    let mut losing: BTreeMap<&str, usize> = BTreeMap::new();
    let mut total = 0.0;
    let mut resolved = 0usize;

    for record in records {
        let Some(pl) = record.trade_outcome_pl else {
            continue;
        };
        resolved += 1;
        total += pl;
        if pl > 0.0 {
            *profitable.entry(record.action_taken.as_str()).or_default() += 1;
        } else if pl < 0.0 {
            *losing.entry(record.action_taken.as_str()).or_default() += 1;
        }
    }

    let mut text = String::from("Based on similar past market conditions:\n");
    if resolved > 0 {
        text.push_str(&format!(
            "- Average P&L across {} similar trades: ${:.2}\n",
            resolved,
            total / resolved as f64
        ));
    }
    if !profitable.is_empty() {
        text.push_str("- Actions that have led to profit in similar situations:\n");
        for (action, count) in &profitable {
            text.push_str(&format!("  - {} ({} times)\n", action, count));
        }
    }
    if losing.is_empty() {
        text.push_str("- No recorded losses in similar situations.\n");
    } else {
        text.push_str("- Actions that have led to losses in similar situations (exercise caution):\n");
        for (action, count) in &losing {
            text.push_str(&format!("  - {} ({} times)\n", action, count));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::snapshot::tests::snapshot;
    use crate::experience::MacdCross;
    use crate::utils::TradeAction;

    fn record(symbol: &str, rsi: f64, action: TradeAction) -> ExperienceRecord {
        ExperienceRecord::new(symbol, snapshot(symbol, rsi, MacdCross::Bullish, 0.01), action, 10)
    }

    #[test]
    fn test_find_similar_keeps_log_order_and_limit() {
        let store = ExperienceStore::in_memory();
        let first = store.append(record("AAPL", 60.0, TradeAction::Buy));
        store.append(record("MSFT", 60.0, TradeAction::Buy));
        let second = store.append(record("AAPL", 61.0, TradeAction::Sell));
        store.append(record("AAPL", 62.0, TradeAction::Hold));

        let current = snapshot("AAPL", 60.5, MacdCross::Bullish, 0.01);
        let found = store.find_similar(&current, 0.10, 2);
        assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first, second]);
    }

    #[test]
    fn test_find_similar_incomplete_snapshot_is_empty() {
        let store = ExperienceStore::in_memory();
        store.append(record("AAPL", 60.0, TradeAction::Buy));
        let mut current = snapshot("AAPL", 60.0, MacdCross::Bullish, 0.01);
        current.price_change_5d = None;
        assert!(store.find_similar(&current, 1.0, 5).is_empty());
    }

    #[test]
    fn test_backfill_is_idempotent() {
        let store = ExperienceStore::in_memory();
        let lot = Uuid::new_v4();
        let id = store.append(record("AAPL", 60.0, TradeAction::Buy).opening(lot));
        let added = store.append(record("AAPL", 58.0, TradeAction::Buy).opening(lot));

        assert_eq!(store.resolve_outcome(id, 125.0), Ok(id));
        assert_eq!(
            store.resolve_outcome(id, 125.0),
            Err(OutcomeError::AlreadyResolved { record: id, pl: 125.0 })
        );
        assert_eq!(store.resolve_outcome(added, -5.0), Ok(added));
        assert_eq!(store.get(id).unwrap().trade_outcome_pl, Some(125.0));
        assert_eq!(store.recent_resolved_pnls(10), vec![125.0, -5.0]);
        assert!(matches!(store.resolve_outcome(Uuid::new_v4(), 1.0), Err(OutcomeError::RecordNotFound(_))));
        assert!(matches!(store.resolve_outcome(added, f64::NAN), Err(OutcomeError::NonFinite(_))));
    }

    #[test]
    fn test_resolve_latest_open_skips_holds_and_resolved() {
        let store = ExperienceStore::in_memory();
        let older = store.append(record("AAPL", 60.0, TradeAction::Buy));
        let newer = store.append(record("AAPL", 60.0, TradeAction::Buy));
        store.append(record("AAPL", 60.0, TradeAction::Hold));

        assert_eq!(store.resolve_latest_open("AAPL", -5.0), Ok(newer));
        assert_eq!(store.resolve_latest_open("AAPL", 7.0), Ok(older));
        assert!(matches!(store.resolve_latest_open("AAPL", 1.0), Err(OutcomeError::NoOpenRecord(_))));
        assert_eq!(store.recent_resolved_pnls(10), vec![7.0, -5.0]);
    }

    #[test]
    fn test_summary_text() {
        assert_eq!(summarize_outcomes(&[]), "No similar past experiences to learn from.");

        let mut win = record("AAPL", 60.0, TradeAction::Buy);
        win.trade_outcome_pl = Some(30.0);
        let mut loss = record("AAPL", 60.0, TradeAction::Sell);
        loss.trade_outcome_pl = Some(-10.0);
        let pending = record("AAPL", 60.0, TradeAction::Buy);

        let text = summarize_outcomes(&[win, loss, pending]);
        assert!(text.contains("Average P&L across 2 similar trades: $10.00"));
        assert!(text.contains("  - BUY (1 times)"));
        assert!(text.contains("led to losses"));
        assert!(text.contains("  - SELL (1 times)"));
    }

    #[test]
    fn test_open_and_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experience_log.json");
        let store = ExperienceStore::open(&path).unwrap();
        assert!(store.is_empty());
        store.append(record("AAPL", 60.0, TradeAction::Buy));
        store.persist().unwrap();

        let reopened = ExperienceStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
    }
}
