//! Binance USDT-M Futures REST client
//!
//! Signs requests with HMAC-SHA256, spaces calls at least 200ms apart,
//! retries transient failures with exponential backoff (1s, 2s, 4s, 8s,
//! capped at 30s) and honors rate-limit windows from the exchange.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ExchangeClient, ExchangeError, ExchangeResult};
use crate::config::Credentials;
use crate::types::{
    AccountState, Candle, ExchangePosition, OrderResult, OrderSide, Ticker, Timeframe,
};

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Minimum spacing between any two requests
const REQUEST_SPACING: Duration = Duration::from_millis(200);
/// Per-call HTTP timeout
const CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff schedule for transient failures
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 30;
const MAX_RETRIES: u32 = 4;

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    /// Enforces the request spacing across concurrent callers
    last_request: Mutex<Instant>,
}

impl BinanceFuturesClient {
    pub fn new(credentials: &Credentials) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = if credentials.testnet {
            TESTNET_URL
        } else {
            MAINNET_URL
        };

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
            last_request: Mutex::new(Instant::now() - REQUEST_SPACING),
        })
    }

    /// Verify credentials by fetching the account once. Called by the
    /// orchestrator at startup so auth problems fail fast.
    pub async fn authenticate(&self) -> ExchangeResult<()> {
        self.fetch_account().await.map(|_| ())
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < REQUEST_SPACING {
            tokio::time::sleep(REQUEST_SPACING - elapsed).await;
        }
        *last = Instant::now();
    }

    /// One HTTP round trip with error normalization. No retries here;
    /// `request_with_retry` wraps this.
    async fn request_once(
        &self,
        method: Method,
        path: &str,
        query: &str,
        signed: bool,
    ) -> ExchangeResult<serde_json::Value> {
        self.throttle().await;

        let full_query = if signed {
            let timestamp = Utc::now().timestamp_millis();
            let to_sign = if query.is_empty() {
                format!("timestamp={timestamp}")
            } else {
                format!("{query}&timestamp={timestamp}")
            };
            let signature = self.sign(&to_sign);
            format!("{to_sign}&signature={signature}")
        } else {
            query.to_string()
        };

        let url = if full_query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, full_query)
        };

        let mut request = self.client.request(method, &url);
        if signed {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ExchangeError::Network(e.to_string())
            } else {
                ExchangeError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        match status {
            s if s.is_success() => serde_json::from_str(&body)
                .map_err(|e| ExchangeError::Transient(format!("bad response body: {e}"))),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
                // 418 is Binance's IP-ban escalation of 429
                Err(ExchangeError::RateLimited {
                    retry_after_secs: 60,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ExchangeError::AuthFailure(body))
            }
            s if s.is_server_error() => Err(ExchangeError::Transient(format!("{s}: {body}"))),
            _ => {
                // Client errors carry a Binance error payload
                #[derive(Deserialize)]
                struct ApiError {
                    code: i64,
                    msg: String,
                }
                match serde_json::from_str::<ApiError>(&body) {
                    Ok(api) if api.code == -2014 || api.code == -2015 => {
                        Err(ExchangeError::AuthFailure(api.msg))
                    }
                    Ok(api) => Err(ExchangeError::Rejected {
                        code: api.code,
                        message: api.msg,
                    }),
                    Err(_) => Err(ExchangeError::Rejected {
                        code: status.as_u16() as i64,
                        message: body,
                    }),
                }
            }
        }
    }

    /// Retry transient/network failures with exponential backoff and
    /// sleep out rate-limit windows. Rejections and auth failures are
    /// surfaced immediately.
    async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        query: &str,
        signed: bool,
    ) -> ExchangeResult<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            match self
                .request_once(method.clone(), path, query, signed)
                .await
            {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = match &err {
                        ExchangeError::RateLimited { retry_after_secs } => {
                            Duration::from_secs(*retry_after_secs)
                        }
                        _ => Duration::from_secs(
                            (BACKOFF_BASE_SECS << attempt).min(BACKOFF_CAP_SECS),
                        ),
                    };
                    warn!(
                        path,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Retrying exchange request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn parse_f64(value: &serde_json::Value) -> f64 {
        match value {
            serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
            serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    async fn fetch_all_tickers(&self) -> ExchangeResult<Vec<Ticker>> {
        let value = self
            .request_with_retry(Method::GET, "/fapi/v1/ticker/24hr", "", false)
            .await?;

        let entries = value
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("ticker response is not an array".into()))?;

        let tickers = entries
            .iter()
            .filter_map(|t| {
                Some(Ticker {
                    symbol: t.get("symbol")?.as_str()?.to_string(),
                    last: Self::parse_f64(t.get("lastPrice")?),
                    quote_volume_24h: Self::parse_f64(t.get("quoteVolume")?),
                    price_change_pct_24h: Self::parse_f64(t.get("priceChangePercent")?),
                    high_24h: Self::parse_f64(t.get("highPrice")?),
                    low_24h: Self::parse_f64(t.get("lowPrice")?),
                })
            })
            .collect();

        Ok(tickers)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let query = format!(
            "symbol={}&interval={}&limit={}",
            symbol,
            timeframe.interval(),
            limit
        );
        let value = self
            .request_with_retry(Method::GET, "/fapi/v1/klines", &query, false)
            .await?;

        // Response rows: [open_time, open, high, low, close, volume, close_time, ...]
        let rows = value
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("klines response is not an array".into()))?;

        let candles = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                if row.len() < 7 {
                    return None;
                }
                Some(Candle {
                    open_time: row[0].as_i64()?,
                    open: Self::parse_f64(&row[1]),
                    high: Self::parse_f64(&row[2]),
                    low: Self::parse_f64(&row[3]),
                    close: Self::parse_f64(&row[4]),
                    volume: Self::parse_f64(&row[5]),
                    close_time: row[6].as_i64()?,
                })
            })
            .collect();

        Ok(candles)
    }

    async fn fetch_account(&self) -> ExchangeResult<AccountState> {
        let value = self
            .request_with_retry(Method::GET, "/fapi/v2/account", "", true)
            .await?;

        let balance = value
            .get("totalWalletBalance")
            .map(Self::parse_f64)
            .unwrap_or(0.0);
        let unrealized = value
            .get("totalUnrealizedProfit")
            .map(Self::parse_f64)
            .unwrap_or(0.0);

        Ok(AccountState {
            balance,
            equity: balance + unrealized,
            unrealized_pnl: unrealized,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let query = format!("symbol={symbol}&leverage={leverage}");
        self.request_with_retry(Method::POST, "/fapi/v1/leverage", &query, true)
            .await?;
        debug!(symbol, leverage, "Leverage set");
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> ExchangeResult<OrderResult> {
        let query = format!(
            "symbol={}&side={}&type=MARKET&quantity={:.8}&newOrderRespType=RESULT",
            symbol, side, quantity
        );
        let value = self
            .request_with_retry(Method::POST, "/fapi/v1/order", &query, true)
            .await?;

        let order_id = value
            .get("orderId")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .ok_or_else(|| ExchangeError::Transient("order response missing orderId".into()))?;
        let fill_price = value.get("avgPrice").map(Self::parse_f64).unwrap_or(0.0);
        let filled_qty = value
            .get("executedQty")
            .map(Self::parse_f64)
            .unwrap_or(quantity);
        let update_time = value
            .get("updateTime")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        Ok(OrderResult {
            order_id,
            symbol: symbol.to_string(),
            side,
            quantity: filled_qty,
            fill_price,
            filled_at: Utc
                .timestamp_millis_opt(update_time)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> ExchangeResult<OrderResult> {
        let query = format!(
            "symbol={}&side={}&type=LIMIT&timeInForce=GTC&price={:.8}&quantity={:.8}",
            symbol, side, price, quantity
        );
        let value = self
            .request_with_retry(Method::POST, "/fapi/v1/order", &query, true)
            .await?;

        let order_id = value
            .get("orderId")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .ok_or_else(|| ExchangeError::Transient("order response missing orderId".into()))?;

        Ok(OrderResult {
            order_id,
            symbol: symbol.to_string(),
            side,
            quantity,
            fill_price: 0.0,
            filled_at: Utc::now(),
        })
    }

    async fn place_stop_market(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        quantity: f64,
    ) -> ExchangeResult<String> {
        let query = format!(
            "symbol={}&side={}&type=STOP_MARKET&stopPrice={:.8}&quantity={:.8}&reduceOnly=true",
            symbol, side, stop_price, quantity
        );
        let value = self
            .request_with_retry(Method::POST, "/fapi/v1/order", &query, true)
            .await?;

        value
            .get("orderId")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .ok_or_else(|| ExchangeError::Transient("stop order response missing orderId".into()))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let query = format!("symbol={symbol}&orderId={order_id}");
        self.request_with_retry(Method::DELETE, "/fapi/v1/order", &query, true)
            .await?;
        Ok(())
    }

    async fn fetch_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let value = self
            .request_with_retry(Method::GET, "/fapi/v2/positionRisk", "", true)
            .await?;

        let entries = value
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("positionRisk is not an array".into()))?;

        let positions = entries
            .iter()
            .filter_map(|p| {
                let quantity = Self::parse_f64(p.get("positionAmt")?);
                if quantity == 0.0 {
                    return None;
                }
                Some(ExchangePosition {
                    symbol: p.get("symbol")?.as_str()?.to_string(),
                    quantity,
                    entry_price: Self::parse_f64(p.get("entryPrice")?),
                    mark_price: Self::parse_f64(p.get("markPrice")?),
                    unrealized_pnl: Self::parse_f64(p.get("unRealizedProfit")?),
                    leverage: Self::parse_f64(p.get("leverage")?) as u32,
                })
            })
            .collect();

        Ok(positions)
    }

    async fn close_all_positions(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let positions = self.fetch_positions().await?;
        for position in positions {
            if let Some(target) = symbol {
                if position.symbol != target {
                    continue;
                }
            }
            let side = if position.quantity > 0.0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            self.place_market_order(&position.symbol, side, position.quantity.abs())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> BinanceFuturesClient {
        BinanceFuturesClient::new(&Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            testnet: true,
        })
        .unwrap()
    }

    #[test]
    fn test_testnet_host_selected() {
        let client = test_client();
        assert_eq!(client.base_url, TESTNET_URL);
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let client = test_client();
        let sig = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, client.sign("symbol=BTCUSDT&timestamp=1700000000000"));
    }

    #[test]
    fn test_parse_f64_accepts_strings_and_numbers() {
        assert_eq!(
            BinanceFuturesClient::parse_f64(&serde_json::json!("42.5")),
            42.5
        );
        assert_eq!(
            BinanceFuturesClient::parse_f64(&serde_json::json!(7)),
            7.0
        );
        assert_eq!(
            BinanceFuturesClient::parse_f64(&serde_json::json!(null)),
            0.0
        );
    }
}
