//! Paper trading broker
//!
//! Fills market orders at the feed's latest price and keeps cash, signed
//! holdings and registered stops in memory.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::collaborators::{Broker, BrokerError, MarketData, OrderResult};
use crate::utils::{AccountSnapshot, HoldingSnapshot, TradeSide};

#[derive(Debug, Clone, Copy, PartialEq)]
struct PaperHolding {
    /// Negative when short
    qty: f64,
    avg_entry_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopOrder {
    pub symbol: String,
    pub qty: u64,
    /// Side of the position being protected
    pub side: TradeSide,
    pub stop_price: f64,
}

#[derive(Debug, Default)]
struct PaperAccount {
    cash: f64,
    holdings: BTreeMap<String, PaperHolding>,
    stops: Vec<StopOrder>,
    next_order_id: u64,
}

pub struct PaperBroker {
    market: Arc<dyn MarketData>,
    account: Mutex<PaperAccount>,
}

impl PaperBroker {
    pub fn new(starting_cash: f64, market: Arc<dyn MarketData>) -> Self {
        Self {
            market,
            account: Mutex::new(PaperAccount {
                cash: starting_cash,
                ..Default::default()
            }),
        }
    }

    pub fn stops(&self) -> Vec<StopOrder> {
        self.account.lock().stops.clone()
    }

    async fn price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let price = self
            .market
            .latest_price(symbol)
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(BrokerError::Rejected(format!("no valid price for {}", symbol)));
        }
        Ok(price)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        let positions = self.positions().await?;
        let cash = self.account.lock().cash;
        let market_value: f64 = positions.values().map(|h| h.market_value()).sum();
        Ok(AccountSnapshot {
            cash,
            portfolio_value: cash + market_value,
        })
    }

    async fn positions(&self) -> Result<BTreeMap<String, HoldingSnapshot>, BrokerError> {
        let holdings: Vec<(String, PaperHolding)> = self
            .account
            .lock()
            .holdings
            .iter()
            .map(|(s, h)| (s.clone(), *h))
            .collect();

        let mut positions = BTreeMap::new();
        for (symbol, holding) in holdings {
            let current_price = match self.price(&symbol).await {
                Ok(price) => price,
                Err(e) => {
                    debug!("Using entry price for {}: {}", symbol, e);
                    holding.avg_entry_price
                }
            };
            positions.insert(
                symbol,
                HoldingSnapshot {
                    qty: holding.qty,
                    avg_entry_price: holding.avg_entry_price,
                    current_price,
                    unrealized_pl: (current_price - holding.avg_entry_price) * holding.qty,
                },
            );
        }
        Ok(positions)
    }

    async fn submit_order(&self, symbol: &str, side: TradeSide, qty: u64) -> Result<OrderResult, BrokerError> {
        if qty == 0 {
            return Ok(OrderResult::skipped());
        }
        let price = self.price(symbol).await?;
        let delta = match side {
            TradeSide::Buy => qty as f64,
            TradeSide::Sell => -(qty as f64),
        };

        let mut account = self.account.lock();
        let cost = delta * price;
        let held = account.holdings.get(symbol).copied();
        let opening_long = side == TradeSide::Buy && held.map_or(true, |h| h.qty >= 0.0);
        if opening_long && cost > account.cash + 1e-9 {
            warn!(
                "Paper order rejected: {} {} {} needs ${:.2}, cash ${:.2}",
                side, qty, symbol, cost, account.cash
            );
            return Ok(OrderResult::failed());
        }

        account.cash -= cost;
        let updated = match held {
            None => Some(PaperHolding { qty: delta, avg_entry_price: price }),
            Some(h) => {
                let qty = h.qty + delta;
                if qty.abs() < 1e-9 {
                    None
                } else if h.qty.signum() == delta.signum() {
                    let avg = (h.avg_entry_price * h.qty.abs() + price * delta.abs()) / qty.abs();
                    Some(PaperHolding { qty, avg_entry_price: avg })
                } else if h.qty.signum() == qty.signum() {
                    Some(PaperHolding { qty, avg_entry_price: h.avg_entry_price })
                } else {
                    Some(PaperHolding { qty, avg_entry_price: price })
                }
            }
        };
        match updated {
            Some(h) => {
                account.holdings.insert(symbol.to_string(), h);
            }
            None => {
                account.holdings.remove(symbol);
                account.stops.retain(|s| s.symbol != symbol);
            }
        }

        account.next_order_id += 1;
        let order_id = format!("paper-{}", account.next_order_id);
        info!("Paper fill {}: {} {} {} @ ${:.2}", order_id, side, qty, symbol, price);
        Ok(OrderResult::filled(order_id, price))
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        qty: u64,
        side: TradeSide,
        entry_price: f64,
        stop_pct: f64,
    ) -> Result<(), BrokerError> {
        if !(stop_pct > 0.0 && stop_pct < 1.0) {
            return Err(BrokerError::Rejected(format!("stop distance {} out of range", stop_pct)));
        }
        let stop_price = match side {
            TradeSide::Buy => entry_price * (1.0 - stop_pct),
            TradeSide::Sell => entry_price * (1.0 + stop_pct),
        };
        let mut account = self.account.lock();
        account.stops.retain(|s| s.symbol != symbol);
        account.stops.push(StopOrder {
            symbol: symbol.to_string(),
            qty,
            side,
            stop_price,
        });
        debug!("Stop registered for {} {} @ ${:.2}", qty, symbol, stop_price);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::replay::ReplayMarketData;
    use crate::indicators::tests::bars_from_closes;

    fn broker(closes: &[f64], cash: f64) -> (Arc<ReplayMarketData>, PaperBroker) {
        let mut series = BTreeMap::new();
        series.insert("SPY".to_string(), bars_from_closes(closes));
        let market = Arc::new(ReplayMarketData::new(series, 1));
        market.advance();
        let broker = PaperBroker::new(cash, market.clone());
        (market, broker)
    }

    #[tokio::test]
    async fn test_long_round_trip_updates_cash() {
        let (market, broker) = broker(&[100.0, 110.0], 1_000.0);
        let order = broker.submit_order("SPY", TradeSide::Buy, 5).await.unwrap();
        assert_eq!(order.filled_price, Some(100.0));

        market.advance();
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions["SPY"].qty, 5.0);
        assert_eq!(positions["SPY"].unrealized_pl, 50.0);
        let account = broker.account().await.unwrap();
        assert_eq!(account.cash, 500.0);
        assert_eq!(account.portfolio_value, 1_050.0);

        broker.submit_order("SPY", TradeSide::Sell, 5).await.unwrap();
        assert!(broker.positions().await.unwrap().is_empty());
        assert_eq!(broker.account().await.unwrap().cash, 1_050.0);
    }

    #[tokio::test]
    async fn test_short_and_cover() {
        let (market, broker) = broker(&[100.0, 90.0], 1_000.0);
        broker.submit_order("SPY", TradeSide::Sell, 4).await.unwrap();
        market.advance();
        let account = broker.account().await.unwrap();
        assert_eq!(account.cash, 1_400.0);
        assert_eq!(account.portfolio_value, 1_040.0);
        broker.submit_order("SPY", TradeSide::Buy, 4).await.unwrap();
        assert_eq!(broker.account().await.unwrap().cash, 1_040.0);
    }

    #[tokio::test]
    async fn test_insufficient_cash_fails() {
        let (_market, broker) = broker(&[100.0], 50.0);
        let order = broker.submit_order("SPY", TradeSide::Buy, 1).await.unwrap();
        assert_eq!(order, OrderResult::failed());
        assert_eq!(broker.submit_order("SPY", TradeSide::Buy, 0).await.unwrap(), OrderResult::skipped());
    }

    #[tokio::test]
    async fn test_stop_loss_registration() {
        let (_market, broker) = broker(&[100.0], 1_000.0);
        broker.place_stop_loss("SPY", 3, TradeSide::Buy, 100.0, 0.04).await.unwrap();
        let stops = broker.stops();
        assert_eq!(stops.len(), 1);
        assert!((stops[0].stop_price - 96.0).abs() < 1e-9);
        assert!(broker.place_stop_loss("SPY", 3, TradeSide::Buy, 100.0, 1.5).await.is_err());
    }
}
