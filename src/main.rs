//! PerpBot entry point
//!
//! Loads configuration, authenticates against the exchange and runs the
//! unified orchestrator until SIGINT/SIGTERM. Exit code 0 on a clean
//! drain, non-zero when startup validation fails.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use perpbot::config::{Credentials, UnifiedConfig};
use perpbot::exchange::ws::TickerFeed;
use perpbot::exchange::{BinanceFuturesClient, ExchangeClient, SimExchange};
use perpbot::orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        error!(error = %format!("{e:#}"), "Fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = UnifiedConfig::load().context("loading configuration")?;

    // Dry-run mode trades against the in-memory exchange; anything else
    // needs real credentials.
    let dry_run = std::env::var("PERPBOT_DRY_RUN")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false);

    let exchange: Arc<dyn ExchangeClient> = if dry_run {
        info!("Dry-run mode: using the simulated exchange");
        Arc::new(SimExchange::new(10_000.0))
    } else {
        let credentials = Credentials::from_env().context("loading credentials")?;
        let client =
            BinanceFuturesClient::new(&credentials).context("building exchange client")?;
        client
            .authenticate()
            .await
            .context("verifying exchange credentials")?;
        Arc::new(client)
    };

    let feed_symbols = stream_symbols(&config);
    let testnet = std::env::var("PERPBOT_TESTNET")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(true);

    let orchestrator = Orchestrator::new(config, exchange)?;
    orchestrator.start().await?;

    // Live mark-price stream for the core symbols; engines fall back to
    // REST polling for anything the feed does not cover.
    if !dry_run && !feed_symbols.is_empty() {
        let feed = TickerFeed::new(feed_symbols, orchestrator.data_hub(), testnet);
        let shutdown = orchestrator.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = feed.run(shutdown).await {
                error!(error = %e, "Ticker feed stopped");
            }
        });
    }

    tokio::select! {
        _ = orchestrator.run_until_shutdown() => {}
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    orchestrator.stop().await;
    Ok(())
}

/// Symbols worth a push-based mark stream: the correlation reference
/// plus the spot watchlist
fn stream_symbols(config: &UnifiedConfig) -> Vec<String> {
    let mut symbols = vec![config.analyzer.reference_symbol.clone()];
    if config.spot.enabled {
        for symbol in &config.spot.watchlist {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }
    }
    symbols
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
