//! Binance futures WebSocket mark-price feed
//!
//! Streams mark-price ticks into the data hub. Reconnects with capped
//! exponential backoff when the connection drops.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::data::DataHub;

const MAINNET_WS_URL: &str = "wss://fstream.binance.com/stream";
const TESTNET_WS_URL: &str = "wss://stream.binancefuture.com/stream";

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Mark-price ticker feed. Runs until the shutdown signal flips or the
/// reconnect budget is exhausted.
pub struct TickerFeed {
    url: String,
    symbols: Vec<String>,
    hub: Arc<DataHub>,
}

impl TickerFeed {
    pub fn new(symbols: Vec<String>, hub: Arc<DataHub>, testnet: bool) -> Self {
        let url = if testnet {
            TESTNET_WS_URL
        } else {
            MAINNET_WS_URL
        };
        Self {
            url: url.to_string(),
            symbols,
            hub,
        }
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@markPrice@1s", s.to_lowercase()))
            .collect();
        format!("{}?streams={}", self.url, streams.join("/"))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("No symbols configured for the ticker feed");
        }

        let url = self.stream_url();
        let mut reconnect_attempts = 0u32;

        'reconnect: loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            info!(
                attempt = reconnect_attempts,
                streams = self.symbols.len(),
                "Connecting to mark-price stream..."
            );

            let (ws_stream, _) = match connect_async(&url).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Mark-price stream connection failed");
                    reconnect_attempts += 1;
                    if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                        bail!("Max reconnection attempts ({MAX_RECONNECT_ATTEMPTS}) reached");
                    }
                    let delay = std::cmp::min(
                        BASE_RECONNECT_DELAY * reconnect_attempts,
                        MAX_RECONNECT_DELAY,
                    );
                    tokio::time::sleep(delay).await;
                    continue 'reconnect;
                }
            };

            let (mut write, mut read) = ws_stream.split();
            reconnect_attempts = 0;
            info!("Mark-price stream connected");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_message(&text) {
                                warn!(error = %e, "Failed to parse mark-price message");
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("Mark-price stream closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Mark-price stream error");
                            break;
                        }
                        None => {
                            warn!("Mark-price stream ended");
                            break;
                        }
                        _ => {}
                    }
                }
            }

            reconnect_attempts += 1;
            if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                bail!("Max reconnection attempts ({MAX_RECONNECT_ATTEMPTS}) reached");
            }
            let delay = std::cmp::min(
                BASE_RECONNECT_DELAY * reconnect_attempts,
                MAX_RECONNECT_DELAY,
            );
            info!(delay_secs = delay.as_secs(), "Reconnecting mark-price stream...");
            tokio::time::sleep(delay).await;
        }
    }

    /// Combined stream messages: {"stream":"btcusdt@markPrice@1s","data":{...}}
    fn handle_message(&self, text: &str) -> Result<()> {
        let wrapper: serde_json::Value = serde_json::from_str(text)?;
        let data = wrapper
            .get("data")
            .context("Missing data in stream message")?;

        let symbol = data
            .get("s")
            .and_then(|v| v.as_str())
            .context("Missing symbol")?;
        let mark_price: f64 = data
            .get("p")
            .and_then(|v| v.as_str())
            .context("Missing mark price")?
            .parse()?;

        self.hub.update_price(symbol, mark_price);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_combines_symbols() {
        let hub = Arc::new(DataHub::new());
        let feed = TickerFeed::new(vec!["BTCUSDT".into(), "ETHUSDT".into()], hub, false);
        let url = feed.stream_url();
        assert!(url.starts_with(MAINNET_WS_URL));
        assert!(url.contains("btcusdt@markPrice@1s/ethusdt@markPrice@1s"));
    }

    #[test]
    fn test_handle_message_updates_hub() {
        let hub = Arc::new(DataHub::new());
        let feed = TickerFeed::new(vec!["BTCUSDT".into()], Arc::clone(&hub), true);

        let msg = r#"{"stream":"btcusdt@markPrice@1s","data":{"s":"BTCUSDT","p":"65000.50"}}"#;
        feed.handle_message(msg).unwrap();
        assert_eq!(hub.price("BTCUSDT"), Some(65000.50));

        let bad = r#"{"stream":"x","data":{"s":"BTCUSDT"}}"#;
        assert!(feed.handle_message(bad).is_err());
    }
}
