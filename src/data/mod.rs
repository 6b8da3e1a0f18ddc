//! Data hub - shared market data caches
//!
//! Central snapshot store fed by the exchange adapter and WebSocket
//! feed. Readers always get cloned snapshots; stale entries expire by
//! TTL (prices ~60s, OHLCV ~300s) so a wedged feed surfaces as missing
//! data rather than silently stale decisions.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{AccountState, Candle, Ticker, Timeframe};

const PRICE_TTL_SECS: i64 = 60;
const OHLCV_TTL_SECS: i64 = 300;
const TICKER_TTL_SECS: i64 = 60;

struct Stamped<T> {
    value: T,
    at: DateTime<Utc>,
}

impl<T> Stamped<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            at: Utc::now(),
        }
    }

    fn fresh(&self, ttl_secs: i64) -> bool {
        Utc::now() - self.at < Duration::seconds(ttl_secs)
    }
}

/// Thread-safe market data cache shared by the engines
pub struct DataHub {
    prices: RwLock<HashMap<String, Stamped<f64>>>,
    ohlcv: RwLock<HashMap<(String, Timeframe), Stamped<Vec<Candle>>>>,
    tickers: RwLock<HashMap<String, Stamped<Ticker>>>,
    account: RwLock<Option<Stamped<AccountState>>>,
}

impl DataHub {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            ohlcv: RwLock::new(HashMap::new()),
            tickers: RwLock::new(HashMap::new()),
            account: RwLock::new(None),
        }
    }

    /// Latest mark price if fresh
    pub fn price(&self, symbol: &str) -> Option<f64> {
        let prices = self.prices.read().ok()?;
        prices
            .get(symbol)
            .filter(|s| s.fresh(PRICE_TTL_SECS))
            .map(|s| s.value)
    }

    pub fn update_price(&self, symbol: &str, price: f64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(symbol.to_string(), Stamped::new(price));
        }
    }

    /// Cached candles for symbol/timeframe if fresh, oldest first
    pub fn ohlcv(&self, symbol: &str, timeframe: Timeframe) -> Option<Vec<Candle>> {
        let cache = self.ohlcv.read().ok()?;
        cache
            .get(&(symbol.to_string(), timeframe))
            .filter(|s| s.fresh(OHLCV_TTL_SECS))
            .map(|s| s.value.clone())
    }

    pub fn update_ohlcv(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        if let Ok(mut cache) = self.ohlcv.write() {
            cache.insert((symbol.to_string(), timeframe), Stamped::new(candles));
        }
    }

    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        let tickers = self.tickers.read().ok()?;
        tickers
            .get(symbol)
            .filter(|s| s.fresh(TICKER_TTL_SECS))
            .map(|s| s.value.clone())
    }

    /// Replace the full ticker snapshot; also refreshes the price cache
    pub fn update_tickers(&self, snapshot: &[Ticker]) {
        if let Ok(mut tickers) = self.tickers.write() {
            for ticker in snapshot {
                tickers.insert(ticker.symbol.clone(), Stamped::new(ticker.clone()));
            }
        }
        if let Ok(mut prices) = self.prices.write() {
            for ticker in snapshot {
                prices.insert(ticker.symbol.clone(), Stamped::new(ticker.last));
            }
        }
    }

    /// All fresh tickers, in no particular order
    pub fn all_tickers(&self) -> Vec<Ticker> {
        self.tickers
            .read()
            .map(|tickers| {
                tickers
                    .values()
                    .filter(|s| s.fresh(TICKER_TTL_SECS))
                    .map(|s| s.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn account(&self) -> Option<AccountState> {
        let account = self.account.read().ok()?;
        account
            .as_ref()
            .filter(|s| s.fresh(PRICE_TTL_SECS))
            .map(|s| s.value)
    }

    pub fn update_account(&self, state: AccountState) {
        if let Ok(mut account) = self.account.write() {
            *account = Some(Stamped::new(state));
        }
    }

    /// Drop every cached entry. Used by tests and on reconnect.
    pub fn clear(&self) {
        if let Ok(mut prices) = self.prices.write() {
            prices.clear();
        }
        if let Ok(mut ohlcv) = self.ohlcv.write() {
            ohlcv.clear();
        }
        if let Ok(mut tickers) = self.tickers.write() {
            tickers.clear();
        }
        if let Ok(mut account) = self.account.write() {
            *account = None;
        }
    }
}

impl Default for DataHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ticker(symbol: &str, last: f64) -> Ticker {
        Ticker {
            symbol: symbol.to_string(),
            last,
            quote_volume_24h: 50_000_000.0,
            price_change_pct_24h: 1.2,
            high_24h: last * 1.02,
            low_24h: last * 0.98,
        }
    }

    #[test]
    fn test_price_roundtrip() {
        let hub = DataHub::new();
        assert_eq!(hub.price("BTCUSDT"), None);
        hub.update_price("BTCUSDT", 65_000.0);
        assert_eq!(hub.price("BTCUSDT"), Some(65_000.0));
    }

    #[test]
    fn test_ticker_snapshot_refreshes_prices() {
        let hub = DataHub::new();
        hub.update_tickers(&[make_ticker("BTCUSDT", 65_000.0), make_ticker("ETHUSDT", 3_000.0)]);
        assert_eq!(hub.price("ETHUSDT"), Some(3_000.0));
        assert_eq!(hub.all_tickers().len(), 2);
        assert_eq!(hub.ticker("BTCUSDT").unwrap().last, 65_000.0);
    }

    #[test]
    fn test_ohlcv_roundtrip() {
        let hub = DataHub::new();
        let candles = vec![Candle {
            open_time: 0,
            close_time: 60_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        }];
        hub.update_ohlcv("BTCUSDT", Timeframe::M15, candles.clone());
        let cached = hub.ohlcv("BTCUSDT", Timeframe::M15).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].close, 1.5);
        assert!(hub.ohlcv("BTCUSDT", Timeframe::H1).is_none());
    }

    #[test]
    fn test_clear_empties_everything() {
        let hub = DataHub::new();
        hub.update_price("BTCUSDT", 1.0);
        hub.update_account(AccountState {
            balance: 100.0,
            equity: 100.0,
            unrealized_pnl: 0.0,
        });
        hub.clear();
        assert_eq!(hub.price("BTCUSDT"), None);
        assert!(hub.account().is_none());
    }
}
