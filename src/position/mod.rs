//! Position lot tracking
//!
//! Provides explicit position lifecycles:
//! - One open lot per symbol, long or short
//! - Same-side adds merge into the lot at a quantity-weighted entry
//! - Realized P&L computed against the lot's own entry and split per fill
//! - Each fill keeps the id of the experience record that opened it

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::utils::TradeSide;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LotError {
    #[error("{symbol} already has an opposite-side lot {lot}")]
    OppositeSide { symbol: String, lot: Uuid },
    #[error("no open lot for {0}")]
    NotOpen(String),
    #[error("invalid fill for {symbol}: qty {qty} @ {price}")]
    InvalidFill { symbol: String, qty: u64, price: f64 },
}

/// An open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionLot {
    pub id: Uuid,
    pub symbol: String,
    /// Buy = long, Sell = short
    pub side: TradeSide,
    pub qty: u64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    /// Opening fills, oldest first
    #[serde(default)]
    pub entries: Vec<LotEntry>,
}

/// One opening fill merged into a lot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotEntry {
    /// Experience record written for the opening decision
    pub record_id: Option<Uuid>,
    pub qty: u64,
    pub price: f64,
}

impl PositionLot {
    /// Signed quantity, negative for shorts
    pub fn signed_qty(&self) -> f64 {
        match self.side {
            TradeSide::Buy => self.qty as f64,
            TradeSide::Sell => -(self.qty as f64),
        }
    }

    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        pnl(self.side, self.entry_price, exit_price, self.qty)
    }

    fn merge(&mut self, qty: u64, price: f64, record_id: Option<Uuid>) {
        let total = self.qty + qty;
        self.entry_price = (self.entry_price * self.qty as f64 + price * qty as f64) / total as f64;
        self.qty = total;
        self.entries.push(LotEntry { record_id, qty, price });
    }
}

fn pnl(side: TradeSide, entry: f64, exit: f64, qty: u64) -> f64 {
    let qty = qty as f64;
    match side {
        TradeSide::Buy => (exit - entry) * qty,
        TradeSide::Sell => (entry - exit) * qty,
    }
}

/// A lot closed at an exit price
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedLot {
    pub lot: PositionLot,
    pub exit_price: f64,
    pub realized_pl: f64,
}

impl ClosedLot {
    /// Realized P&L per opening record. Lots saved without fills
    /// yield a single share with no record.
    pub fn allocations(&self) -> Vec<(Option<Uuid>, f64)> {
        if self.lot.entries.is_empty() {
            return vec![(None, self.realized_pl)];
        }
        self.lot
            .entries
            .iter()
            .map(|e| (e.record_id, pnl(self.lot.side, e.price, self.exit_price, e.qty)))
            .collect()
    }
}

/// Open lots by symbol with running realized P&L
#[derive(Debug, Default)]
pub struct PositionBook {
    lots: DashMap<String, PositionLot>,
    realized_pl: Mutex<f64>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted lots
    pub fn restore(lots: Vec<PositionLot>, realized_pl: f64) -> Self {
        let book = Self {
            lots: DashMap::new(),
            realized_pl: Mutex::new(realized_pl),
        };
        for lot in lots {
            book.lots.insert(lot.symbol.clone(), lot);
        }
        book
    }

    /// Open a lot, or add to the open lot on the same side
    pub fn open(
        &self,
        symbol: &str,
        side: TradeSide,
        qty: u64,
        entry_price: f64,
        record_id: Option<Uuid>,
    ) -> Result<PositionLot, LotError> {
        if qty == 0 || !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(LotError::InvalidFill {
                symbol: symbol.to_string(),
                qty,
                price: entry_price,
            });
        }
        if let Some(mut existing) = self.lots.get_mut(symbol) {
            if existing.side != side {
                return Err(LotError::OppositeSide {
                    symbol: symbol.to_string(),
                    lot: existing.id,
                });
            }
            existing.merge(qty, entry_price, record_id);
            info!(
                "Added {} {} to lot {}: {} @ ${:.2} average",
                qty, symbol, existing.id, existing.qty, existing.entry_price
            );
            return Ok(existing.clone());
        }

        let lot = PositionLot {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            qty,
            entry_price,
            opened_at: Utc::now(),
            entries: vec![LotEntry {
                record_id,
                qty,
                price: entry_price,
            }],
        };
        self.lots.insert(symbol.to_string(), lot.clone());
        info!(
            "Opened {} lot {}: {} {} @ ${:.2}",
            side, lot.id, qty, symbol, entry_price
        );
        Ok(lot)
    }

    pub fn close(&self, symbol: &str, exit_price: f64) -> Result<ClosedLot, LotError> {
        let Some((_, lot)) = self.lots.remove(symbol) else {
            return Err(LotError::NotOpen(symbol.to_string()));
        };
        let realized_pl = lot.pnl_at(exit_price);
        *self.realized_pl.lock() += realized_pl;
        info!(
            "Closed {} lot {}: {} {} @ ${:.2}, realized P&L ${:.2}",
            lot.side, lot.id, lot.qty, symbol, exit_price, realized_pl
        );
        Ok(ClosedLot { lot, exit_price, realized_pl })
    }

    pub fn get(&self, symbol: &str) -> Option<PositionLot> {
        self.lots.get(symbol).map(|lot| lot.clone())
    }

    /// Signed quantity held, 0 when flat
    pub fn signed_qty(&self, symbol: &str) -> f64 {
        self.lots.get(symbol).map(|lot| lot.signed_qty()).unwrap_or(0.0)
    }

    pub fn open_lots(&self) -> Vec<PositionLot> {
        let mut lots: Vec<PositionLot> = self.lots.iter().map(|e| e.value().clone()).collect();
        lots.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        lots
    }

    pub fn realized_pl(&self) -> f64 {
        *self.realized_pl.lock()
    }

    /// Drop lots the broker no longer reports
    pub fn reconcile(&self, held_symbols: &[String]) {
        self.lots.retain(|symbol, lot| {
            let keep = held_symbols.iter().any(|s| s == symbol);
            if !keep {
                debug!("Dropping lot {} for {}: broker reports no position", lot.id, symbol);
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_round_trip() {
        let book = PositionBook::new();
        let lot = book.open("SPY", TradeSide::Buy, 10, 100.0, None).unwrap();
        assert_eq!(book.signed_qty("SPY"), 10.0);

        let closed = book.close("SPY", 104.5).unwrap();
        assert_eq!(closed.lot.id, lot.id);
        assert!((closed.realized_pl - 45.0).abs() < 1e-9);
        assert_eq!(book.signed_qty("SPY"), 0.0);
        assert!((book.realized_pl() - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_profits_when_price_falls() {
        let book = PositionBook::new();
        book.open("QQQ", TradeSide::Sell, 5, 200.0, None).unwrap();
        assert_eq!(book.signed_qty("QQQ"), -5.0);
        let closed = book.close("QQQ", 190.0).unwrap();
        assert!((closed.realized_pl - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_interleaved_symbols_are_independent() {
        let book = PositionBook::new();
        book.open("AAA", TradeSide::Buy, 1, 10.0, None).unwrap();
        book.open("BBB", TradeSide::Sell, 2, 20.0, None).unwrap();
        let b = book.close("BBB", 25.0).unwrap();
        let a = book.close("AAA", 12.0).unwrap();
        assert!((b.realized_pl + 10.0).abs() < 1e-9);
        assert!((a.realized_pl - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_add_merges_and_splits_realized_pl() {
        let book = PositionBook::new();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let lot = book.open("SPY", TradeSide::Buy, 5, 100.0, Some(first)).unwrap();
        let merged = book.open("SPY", TradeSide::Buy, 5, 90.0, Some(second)).unwrap();
        assert_eq!(merged.id, lot.id);
        assert_eq!(merged.qty, 10);
        assert!((merged.entry_price - 95.0).abs() < 1e-9);
        assert_eq!(merged.entries.len(), 2);

        let closed = book.close("SPY", 110.0).unwrap();
        assert!((closed.realized_pl - 150.0).abs() < 1e-9);
        let shares = closed.allocations();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].0, Some(first));
        assert!((shares[0].1 - 50.0).abs() < 1e-9);
        assert_eq!(shares[1].0, Some(second));
        assert!((shares[1].1 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_lot_without_fills_allocates_whole_pl() {
        let mut lot = PositionBook::new().open("SPY", TradeSide::Sell, 2, 50.0, None).unwrap();
        lot.entries.clear();
        let book = PositionBook::restore(vec![lot], 0.0);
        let closed = book.close("SPY", 45.0).unwrap();
        assert_eq!(closed.allocations(), vec![(None, 10.0)]);
    }

    #[test]
    fn test_opposite_side_and_missing_close() {
        let book = PositionBook::new();
        book.open("SPY", TradeSide::Buy, 1, 100.0, None).unwrap();
        assert!(matches!(
            book.open("SPY", TradeSide::Sell, 1, 100.0, None),
            Err(LotError::OppositeSide { .. })
        ));
        assert_eq!(book.signed_qty("SPY"), 1.0);
        assert!(matches!(book.close("IWM", 1.0), Err(LotError::NotOpen(_))));
        assert!(matches!(
            book.open("IWM", TradeSide::Buy, 0, 100.0, None),
            Err(LotError::InvalidFill { .. })
        ));
    }

    #[test]
    fn test_restore_and_reconcile() {
        let book = PositionBook::new();
        book.open("SPY", TradeSide::Buy, 3, 100.0, None).unwrap();
        book.open("QQQ", TradeSide::Buy, 3, 100.0, None).unwrap();
        let restored = PositionBook::restore(book.open_lots(), 12.0);
        assert_eq!(restored.open_lots().len(), 2);
        assert_eq!(restored.realized_pl(), 12.0);

        restored.reconcile(&["SPY".to_string()]);
        assert!(restored.get("QQQ").is_none());
        assert!(restored.get("SPY").is_some());
    }
}
