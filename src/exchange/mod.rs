//! Exchange adapter layer
//!
//! Defines the abstract exchange contract consumed by the engines plus
//! the concrete Binance USDT-M futures client, a WebSocket mark-price
//! feed, and an in-memory simulated exchange used for dry-run and tests.

use async_trait::async_trait;
use std::fmt;

use crate::types::{Candle, ExchangePosition, OrderResult, OrderSide, Ticker, Timeframe};

pub mod binance;
pub mod sim;
pub mod ws;

pub use binance::BinanceFuturesClient;
pub use sim::SimExchange;

/// Normalized exchange error taxonomy. Engines branch on the kind, not
/// on transport details.
#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Recoverable: network blip or 5xx, retry with backoff
    Transient(String),
    /// Recoverable: wait out the advertised window
    RateLimited { retry_after_secs: u64 },
    /// Per-order failure with an exchange code
    Rejected { code: i64, message: String },
    /// Fatal: credentials invalid or signature mismatch
    AuthFailure(String),
    /// Connection-level failure before a response was received
    Network(String),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Transient(msg) => write!(f, "transient exchange error: {msg}"),
            ExchangeError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            ExchangeError::Rejected { code, message } => {
                write!(f, "order rejected ({code}): {message}")
            }
            ExchangeError::AuthFailure(msg) => write!(f, "authentication failure: {msg}"),
            ExchangeError::Network(msg) => write!(f, "network error: {msg}"),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl ExchangeError {
    /// Whether a retry with backoff is worthwhile
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient(_)
                | ExchangeError::Network(_)
                | ExchangeError::RateLimited { .. }
        )
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Abstract exchange operations consumed by the engines.
///
/// One shared instance per engine; implementations are internally
/// rate-limited and safe to call concurrently.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Full 24h ticker snapshot across the universe
    async fn fetch_all_tickers(&self) -> ExchangeResult<Vec<Ticker>>;

    /// Recent OHLCV for one symbol/timeframe, oldest first
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    /// Account balance and equity
    async fn fetch_account(&self) -> ExchangeResult<crate::types::AccountState>;

    /// Set leverage for a symbol before opening a position
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Fire a market order; `quantity` is in base units
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> ExchangeResult<OrderResult>;

    /// Rest a limit order at `price`
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> ExchangeResult<OrderResult>;

    /// Park a stop-market order that closes `quantity` when `stop_price`
    /// trades through
    async fn place_stop_market(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        quantity: f64,
    ) -> ExchangeResult<String>;

    /// Cancel a resting order
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    /// Authoritative open-position view used for reconciliation
    async fn fetch_positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;

    /// Close every open position, or just one symbol's when given
    async fn close_all_positions(&self, symbol: Option<&str>) -> ExchangeResult<()>;
}
