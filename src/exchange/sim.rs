//! Simulated exchange
//!
//! In-memory implementation of the exchange contract used for dry-run
//! mode and the integration tests. Market data is injected by the test
//! or replay harness; orders fill instantly at the posted mark price.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{ExchangeClient, ExchangeError, ExchangeResult};
use crate::types::{
    AccountState, Candle, ExchangePosition, OrderResult, OrderSide, Ticker, Timeframe,
};

#[derive(Debug, Clone)]
struct SimPosition {
    quantity: f64, // signed, positive long
    entry_price: f64,
    leverage: u32,
}

#[derive(Debug, Clone)]
struct StopOrder {
    id: String,
    side: OrderSide,
    stop_price: f64,
    quantity: f64,
}

/// Simulated exchange state. All methods are synchronous under the hood;
/// the async trait surface matches the live client.
pub struct SimExchange {
    tickers: RwLock<Vec<Ticker>>,
    candles: RwLock<HashMap<(String, Timeframe), Vec<Candle>>>,
    marks: RwLock<HashMap<String, f64>>,
    positions: RwLock<HashMap<String, SimPosition>>,
    stops: RwLock<HashMap<String, Vec<StopOrder>>>,
    balance: RwLock<f64>,
    leverages: RwLock<HashMap<String, u32>>,
    next_order_id: AtomicU64,
    /// When set, every order placement fails with this rejection code
    reject_orders: RwLock<Option<(i64, String)>>,
}

impl SimExchange {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            tickers: RwLock::new(Vec::new()),
            candles: RwLock::new(HashMap::new()),
            marks: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            stops: RwLock::new(HashMap::new()),
            balance: RwLock::new(starting_balance),
            leverages: RwLock::new(HashMap::new()),
            next_order_id: AtomicU64::new(1),
            reject_orders: RwLock::new(None),
        }
    }

    // ── Test-harness controls ──

    pub fn set_tickers(&self, tickers: Vec<Ticker>) {
        let mut marks = self.marks.write().unwrap();
        for ticker in &tickers {
            marks.insert(ticker.symbol.clone(), ticker.last);
        }
        *self.tickers.write().unwrap() = tickers;
    }

    pub fn set_candles(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.candles
            .write()
            .unwrap()
            .insert((symbol.to_string(), timeframe), candles);
    }

    /// Move the mark price; realizes nothing, only affects future fills
    /// and unrealized PnL.
    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.marks
            .write()
            .unwrap()
            .insert(symbol.to_string(), price);
    }

    /// Force every subsequent order to be rejected (for error-path tests)
    pub fn reject_next_orders(&self, code: i64, message: &str) {
        *self.reject_orders.write().unwrap() = Some((code, message.to_string()));
    }

    pub fn clear_rejection(&self) {
        *self.reject_orders.write().unwrap() = None;
    }

    /// Remove a position out-of-band, as if closed externally. Used to
    /// exercise reconciliation.
    pub fn drop_position(&self, symbol: &str) {
        self.positions.write().unwrap().remove(symbol);
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.read().unwrap().len()
    }

    fn mark_of(&self, symbol: &str) -> ExchangeResult<f64> {
        self.marks
            .read()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: format!("Invalid symbol: {symbol}"),
            })
    }

    fn next_id(&self) -> String {
        self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn fetch_all_tickers(&self) -> ExchangeResult<Vec<Ticker>> {
        Ok(self.tickers.read().unwrap().clone())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let cache = self.candles.read().unwrap();
        let candles = cache
            .get(&(symbol.to_string(), timeframe))
            .cloned()
            .unwrap_or_default();
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn fetch_account(&self) -> ExchangeResult<AccountState> {
        let balance = *self.balance.read().unwrap();
        let unrealized: f64 = {
            let positions = self.positions.read().unwrap();
            let marks = self.marks.read().unwrap();
            positions
                .iter()
                .map(|(symbol, p)| {
                    let mark = marks.get(symbol).copied().unwrap_or(p.entry_price);
                    (mark - p.entry_price) * p.quantity
                })
                .sum()
        };
        Ok(AccountState {
            balance,
            equity: balance + unrealized,
            unrealized_pnl: unrealized,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.leverages
            .write()
            .unwrap()
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> ExchangeResult<OrderResult> {
        if let Some((code, message)) = self.reject_orders.read().unwrap().clone() {
            return Err(ExchangeError::Rejected { code, message });
        }
        if quantity <= 0.0 {
            return Err(ExchangeError::Rejected {
                code: -1013,
                message: "Quantity must be positive".into(),
            });
        }

        let fill_price = self.mark_of(symbol)?;
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };

        let mut positions = self.positions.write().unwrap();
        let leverage = self
            .leverages
            .read()
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or(1);

        match positions.get_mut(symbol) {
            Some(existing) => {
                let new_quantity = existing.quantity + signed;
                if new_quantity.abs() < 1e-12 {
                    // Fully closed: realize PnL into the balance
                    let pnl = (fill_price - existing.entry_price) * existing.quantity;
                    *self.balance.write().unwrap() += pnl;
                    positions.remove(symbol);
                } else if existing.quantity.signum() == new_quantity.signum()
                    && new_quantity.abs() < existing.quantity.abs()
                {
                    // Partial close: realize the closed slice
                    let closed = existing.quantity - new_quantity;
                    let pnl = (fill_price - existing.entry_price) * closed;
                    *self.balance.write().unwrap() += pnl;
                    existing.quantity = new_quantity;
                } else {
                    // Add or flip: blended entry for the remainder
                    existing.entry_price = fill_price;
                    existing.quantity = new_quantity;
                }
            }
            None => {
                positions.insert(
                    symbol.to_string(),
                    SimPosition {
                        quantity: signed,
                        entry_price: fill_price,
                        leverage,
                    },
                );
            }
        }

        Ok(OrderResult {
            order_id: self.next_id(),
            symbol: symbol.to_string(),
            side,
            quantity,
            fill_price,
            filled_at: Utc::now(),
        })
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> ExchangeResult<OrderResult> {
        if let Some((code, message)) = self.reject_orders.read().unwrap().clone() {
            return Err(ExchangeError::Rejected { code, message });
        }
        // The simulation fills marketable limits immediately at the
        // limit price and drops the rest (no resting book).
        let mark = self.mark_of(symbol)?;
        let marketable = match side {
            OrderSide::Buy => price >= mark,
            OrderSide::Sell => price <= mark,
        };
        if !marketable {
            return Err(ExchangeError::Rejected {
                code: -5022,
                message: "Order would not fill immediately".into(),
            });
        }
        self.place_market_order(symbol, side, quantity).await
    }

    async fn place_stop_market(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        quantity: f64,
    ) -> ExchangeResult<String> {
        if let Some((code, message)) = self.reject_orders.read().unwrap().clone() {
            return Err(ExchangeError::Rejected { code, message });
        }
        let id = self.next_id();
        self.stops
            .write()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .push(StopOrder {
                id: id.clone(),
                side,
                stop_price,
                quantity,
            });
        Ok(id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let mut stops = self.stops.write().unwrap();
        if let Some(orders) = stops.get_mut(symbol) {
            let before = orders.len();
            orders.retain(|o| o.id != order_id);
            if orders.len() < before {
                return Ok(());
            }
        }
        Err(ExchangeError::Rejected {
            code: -2011,
            message: "Unknown order".into(),
        })
    }

    async fn fetch_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let positions = self.positions.read().unwrap();
        let marks = self.marks.read().unwrap();
        Ok(positions
            .iter()
            .map(|(symbol, p)| {
                let mark = marks.get(symbol).copied().unwrap_or(p.entry_price);
                ExchangePosition {
                    symbol: symbol.clone(),
                    quantity: p.quantity,
                    entry_price: p.entry_price,
                    mark_price: mark,
                    unrealized_pnl: (mark - p.entry_price) * p.quantity,
                    leverage: p.leverage,
                }
            })
            .collect())
    }

    async fn close_all_positions(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let targets: Vec<(String, f64)> = {
            let positions = self.positions.read().unwrap();
            positions
                .iter()
                .filter(|(s, _)| symbol.map_or(true, |target| target == s.as_str()))
                .map(|(s, p)| (s.clone(), p.quantity))
                .collect()
        };
        for (target, quantity) in targets {
            let side = if quantity > 0.0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            self.place_market_order(&target, side, quantity.abs()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_close_realizes_pnl() {
        let sim = SimExchange::new(10_000.0);
        sim.set_mark("BTCUSDT", 100.0);

        sim.place_market_order("BTCUSDT", OrderSide::Buy, 2.0)
            .await
            .unwrap();
        assert_eq!(sim.open_position_count(), 1);

        sim.set_mark("BTCUSDT", 110.0);
        let account = sim.fetch_account().await.unwrap();
        assert!((account.unrealized_pnl - 20.0).abs() < 1e-9);

        sim.place_market_order("BTCUSDT", OrderSide::Sell, 2.0)
            .await
            .unwrap();
        assert_eq!(sim.open_position_count(), 0);
        let account = sim.fetch_account().await.unwrap();
        assert!((account.balance - 10_020.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_partial_close_keeps_remainder() {
        let sim = SimExchange::new(1_000.0);
        sim.set_mark("ETHUSDT", 50.0);
        sim.place_market_order("ETHUSDT", OrderSide::Buy, 4.0)
            .await
            .unwrap();

        sim.set_mark("ETHUSDT", 60.0);
        sim.place_market_order("ETHUSDT", OrderSide::Sell, 1.0)
            .await
            .unwrap();

        let positions = sim.fetch_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].quantity - 3.0).abs() < 1e-9);
        // One unit realized at +10
        assert!((*sim.balance.read().unwrap() - 1_010.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_short_pnl_sign() {
        let sim = SimExchange::new(1_000.0);
        sim.set_mark("SOLUSDT", 100.0);
        sim.place_market_order("SOLUSDT", OrderSide::Sell, 1.0)
            .await
            .unwrap();
        sim.set_mark("SOLUSDT", 90.0);
        let account = sim.fetch_account().await.unwrap();
        assert!((account.unrealized_pnl - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejection_switch() {
        let sim = SimExchange::new(1_000.0);
        sim.set_mark("BTCUSDT", 100.0);
        sim.reject_next_orders(-2019, "Margin is insufficient");
        let err = sim
            .place_market_order("BTCUSDT", OrderSide::Buy, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: -2019, .. }));

        sim.clear_rejection();
        assert!(sim
            .place_market_order("BTCUSDT", OrderSide::Buy, 1.0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_stop_orders_cancelable() {
        let sim = SimExchange::new(1_000.0);
        let id = sim
            .place_stop_market("BTCUSDT", OrderSide::Sell, 95.0, 1.0)
            .await
            .unwrap();
        assert!(sim.cancel_order("BTCUSDT", &id).await.is_ok());
        assert!(sim.cancel_order("BTCUSDT", &id).await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_positions() {
        let sim = SimExchange::new(1_000.0);
        sim.set_mark("BTCUSDT", 100.0);
        sim.set_mark("ETHUSDT", 50.0);
        sim.place_market_order("BTCUSDT", OrderSide::Buy, 1.0)
            .await
            .unwrap();
        sim.place_market_order("ETHUSDT", OrderSide::Sell, 2.0)
            .await
            .unwrap();

        sim.close_all_positions(None).await.unwrap();
        assert_eq!(sim.open_position_count(), 0);
    }
}
