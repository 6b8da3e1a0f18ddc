//! Trading engines
//!
//! Each engine owns its positions and loops; the orchestrator only holds
//! the trait object plus the task handle. A crash inside one engine
//! never reaches its siblings.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

pub mod futures;
pub mod spot;

pub use futures::FuturesEngine;
pub use spot::SpotEngine;

/// Read-only status snapshot for the orchestrator's status loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub open_positions: usize,
    /// Margin committed to open positions (USD)
    pub exposure_usd: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl_today: f64,
}

/// Contract every engine implements for the orchestrator
#[async_trait]
pub trait TradingEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Run the engine's loops until the shutdown signal flips. A clean
    /// return means the engine drained; an Err is a crash the supervisor
    /// may restart.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()>;

    /// Current status snapshot
    async fn status(&self) -> EngineStatus;

    /// Close every open position (emergency or shutdown path)
    async fn close_all_positions(&self) -> Result<()>;

    /// Refresh the engine's capital allocation (orchestrator-driven)
    fn set_allocated_usd(&self, allocated_usd: f64);
}
