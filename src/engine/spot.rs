//! Spot engine
//!
//! Long-only watchlist engine with fixed percentage stops and targets.
//! Far simpler than the futures engine: one loop scans the watchlist,
//! manages exits, and heartbeats; capital comes from the same allocator
//! and trades land in the same journal format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{EngineStatus, TradingEngine};
use crate::analyzer;
use crate::config::SpotEngineConfig;
use crate::data::DataHub;
use crate::exchange::ExchangeClient;
use crate::journal::{TradeJournal, TradeRecord};
use crate::orchestrator::health::HealthMonitor;
use crate::orchestrator::risk::GlobalRiskMonitor;
use crate::position::{Position, PositionState};
use crate::types::{OrderSide, Regime, Side, Timeframe, TrendDirection};

pub struct SpotEngine {
    name: String,
    config: SpotEngineConfig,
    exchange: Arc<dyn ExchangeClient>,
    hub: Arc<DataHub>,
    journal: Arc<TradeJournal>,
    risk: Arc<GlobalRiskMonitor>,
    health: Arc<HealthMonitor>,
    allocated_usd: StdRwLock<f64>,
    positions: RwLock<HashMap<String, Position>>,
    running: AtomicBool,
}

impl SpotEngine {
    pub fn new(
        config: SpotEngineConfig,
        exchange: Arc<dyn ExchangeClient>,
        hub: Arc<DataHub>,
        journal: Arc<TradeJournal>,
        risk: Arc<GlobalRiskMonitor>,
        health: Arc<HealthMonitor>,
        allocated_usd: f64,
    ) -> Self {
        Self {
            name: "spot".to_string(),
            config,
            exchange,
            hub,
            journal,
            risk,
            health,
            allocated_usd: StdRwLock::new(allocated_usd),
            positions: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    fn allocated(&self) -> f64 {
        self.allocated_usd.read().map(|v| *v).unwrap_or(0.0)
    }

    /// Simple long-side score over the 1h view: trend, momentum, volume
    /// participation. 0-100, entry requires the configured minimum.
    pub fn entry_score(view: &crate::types::TimeframeView) -> u8 {
        let mut score: i32 = 50;
        if view.trend_direction == TrendDirection::Up {
            score += 20;
        } else if view.trend_direction == TrendDirection::Down {
            score -= 30;
        }
        if view.macd_histogram > 0.0 {
            score += 15;
        }
        if view.volume_ratio >= 1.2 {
            score += 15;
        }
        // Overbought entries are chased entries
        if view.rsi_14 > 70.0 {
            score -= 25;
        }
        score.clamp(0, 100) as u8
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();

        // Exits first so capital frees up before new entries
        self.manage_exits().await?;

        let open_count = self.positions.read().await.len();
        if open_count >= self.config.max_positions {
            return Ok(());
        }
        if !self.risk.can_open(now) {
            debug!("Global risk monitor closed, skipping spot entries");
            return Ok(());
        }

        for symbol in &self.config.watchlist {
            if self.positions.read().await.contains_key(symbol) {
                continue;
            }
            if self.positions.read().await.len() >= self.config.max_positions {
                break;
            }
            if let Err(e) = self.try_enter(symbol).await {
                warn!(symbol, error = %e, "Spot entry attempt failed");
            }
        }
        Ok(())
    }

    async fn try_enter(&self, symbol: &str) -> Result<()> {
        let candles = self
            .exchange
            .fetch_ohlcv(symbol, Timeframe::H1, 100)
            .await
            .with_context(|| format!("fetching 1h candles for {symbol}"))?;
        self.hub.update_ohlcv(symbol, Timeframe::H1, candles.clone());

        let view = match analyzer::compute_view(Timeframe::H1, &candles) {
            Some(view) => view,
            None => return Ok(()),
        };
        let score = Self::entry_score(&view);
        if score < self.config.min_confidence {
            return Ok(());
        }

        let price = self.hub.price(symbol).unwrap_or(view.close);
        if price <= 0.0 {
            return Ok(());
        }
        let size_usd = self.allocated() * self.config.position_size_pct / 100.0;
        if size_usd <= 0.0 {
            return Ok(());
        }
        let quantity = size_usd / price;

        let fill = self
            .exchange
            .place_market_order(symbol, OrderSide::Buy, quantity)
            .await
            .with_context(|| format!("spot buy for {symbol}"))?;

        let entry = if fill.fill_price > 0.0 {
            fill.fill_price
        } else {
            price
        };
        let stop = entry * (1.0 - self.config.stop_loss_pct / 100.0);
        let target = entry * (1.0 + self.config.take_profit_pct / 100.0);

        info!(
            symbol,
            entry,
            quantity = fill.quantity,
            score,
            stop,
            target,
            "📈 Spot position opened"
        );
        self.positions.write().await.insert(
            symbol.to_string(),
            Position::new(
                symbol.to_string(),
                Side::Long,
                entry,
                fill.quantity,
                1,
                stop,
                target,
                score,
                false,
                view.atr_14,
                Regime::Trending,
            ),
        );
        Ok(())
    }

    /// Latest mark for a symbol: hub price when fresh, otherwise the
    /// close of a freshly fetched 1h candle.
    async fn mark_price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self.hub.price(symbol) {
            return Some(price);
        }
        let candles = self.exchange.fetch_ohlcv(symbol, Timeframe::H1, 2).await.ok()?;
        let close = candles.last().map(|c| c.close)?;
        self.hub.update_price(symbol, close);
        Some(close)
    }

    async fn manage_exits(&self) -> Result<()> {
        let open: Vec<(String, f64, f64, f64)> = {
            let positions = self.positions.read().await;
            positions
                .values()
                .filter(|p| p.state.is_live())
                .map(|p| (p.symbol.clone(), p.stop_loss, p.take_profit, p.quantity))
                .collect()
        };

        let mut snapshots = Vec::with_capacity(open.len());
        for (symbol, stop, target, quantity) in open {
            if let Some(price) = self.mark_price(&symbol).await {
                snapshots.push((symbol, price, stop, target, quantity));
            }
        }

        for (symbol, price, stop, target, quantity) in snapshots {
            let reason = if price <= stop {
                Some("STOP_LOSS")
            } else if price >= target {
                Some("TAKE_PROFIT")
            } else {
                None
            };
            let reason = match reason {
                Some(reason) => reason,
                None => continue,
            };

            let fill = self
                .exchange
                .place_market_order(&symbol, OrderSide::Sell, quantity)
                .await
                .with_context(|| format!("spot sell for {symbol}"))?;
            let exit_price = if fill.fill_price > 0.0 {
                fill.fill_price
            } else {
                price
            };

            let mut positions = self.positions.write().await;
            if let Some(mut position) = positions.remove(&symbol) {
                position.transition(PositionState::Closed, reason);
                let realized = (exit_price - position.entry_price) * position.quantity;
                let record = TradeRecord {
                    completed_at: Utc::now().timestamp_millis(),
                    engine: self.name.clone(),
                    symbol: symbol.clone(),
                    side: Side::Long,
                    entry_time: position.entry_time.timestamp_millis(),
                    exit_time: Utc::now().timestamp_millis(),
                    entry_price: position.entry_price,
                    exit_price,
                    quantity: position.quantity,
                    leverage: 1,
                    realized_pnl: realized,
                    exit_reason: reason.to_string(),
                };
                if let Err(e) = self.journal.append(record) {
                    error!(symbol, error = %e, "Journal append failed");
                }
                info!(symbol, exit = exit_price, pnl = realized, reason, "📉 Spot position closed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TradingEngine for SpotEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!(
            engine = %self.name,
            allocated = self.allocated(),
            watchlist = self.config.watchlist.len(),
            "🚀 Spot engine starting"
        );
        self.running.store(true, Ordering::SeqCst);

        let mut scan = interval(Duration::from_secs(self.config.scan_interval_secs));
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = scan.tick() => {
                    self.health.record_heartbeat(&self.name);
                    if let Err(e) = self.tick().await {
                        warn!(engine = %self.name, error = %e, "Spot tick skipped");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(engine = %self.name, "Spot engine drained");
        Ok(())
    }

    async fn status(&self) -> EngineStatus {
        let positions = self.positions.read().await;
        let live: Vec<&Position> = positions.values().filter(|p| p.state.is_live()).collect();
        EngineStatus {
            name: self.name.clone(),
            open_positions: live.len(),
            exposure_usd: live.iter().map(|p| p.notional()).sum(),
            unrealized_pnl: live
                .iter()
                .filter_map(|p| self.hub.price(&p.symbol).map(|price| p.unrealized_pnl(price)))
                .sum(),
            realized_pnl_today: self.journal.realized_pnl_today(Utc::now()),
        }
    }

    async fn close_all_positions(&self) -> Result<()> {
        let snapshots: Vec<(String, f64)> = {
            let positions = self.positions.read().await;
            positions
                .values()
                .filter(|p| p.state.is_live())
                .map(|p| (p.symbol.clone(), p.quantity))
                .collect()
        };
        for (symbol, quantity) in snapshots {
            let fill = self
                .exchange
                .place_market_order(&symbol, OrderSide::Sell, quantity)
                .await?;
            let mut positions = self.positions.write().await;
            if let Some(mut position) = positions.remove(&symbol) {
                position.transition(PositionState::EmergencyClosed, "EMERGENCY");
                let exit_price = if fill.fill_price > 0.0 {
                    fill.fill_price
                } else {
                    position.entry_price
                };
                let realized = (exit_price - position.entry_price) * position.quantity;
                let _ = self.journal.append(TradeRecord {
                    completed_at: Utc::now().timestamp_millis(),
                    engine: self.name.clone(),
                    symbol: symbol.clone(),
                    side: Side::Long,
                    entry_time: position.entry_time.timestamp_millis(),
                    exit_time: Utc::now().timestamp_millis(),
                    entry_price: position.entry_price,
                    exit_price,
                    quantity: position.quantity,
                    leverage: 1,
                    realized_pnl: realized,
                    exit_reason: "EMERGENCY".to_string(),
                });
            }
        }
        Ok(())
    }

    fn set_allocated_usd(&self, allocated_usd: f64) {
        if let Ok(mut allocated) = self.allocated_usd.write() {
            *allocated = allocated_usd;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TimeframeView, TrendStrength};

    fn view(direction: TrendDirection, macd_hist: f64, volume_ratio: f64, rsi: f64) -> TimeframeView {
        TimeframeView {
            timeframe: Timeframe::H1,
            close: 100.0,
            ema_9: 101.0,
            ema_21: 100.0,
            ema_50: 99.0,
            rsi_14: rsi,
            macd_line: 0.0,
            macd_signal: 0.0,
            macd_histogram: macd_hist,
            atr_14: 1.0,
            atr_average: 1.0,
            adx_14: 25.0,
            vwap: 100.0,
            volume_ratio,
            trend_direction: direction,
            trend_strength: TrendStrength::Moderate,
        }
    }

    #[test]
    fn test_entry_score_uptrend() {
        // 50 + 20 trend + 15 macd + 15 volume = 100
        let score = SpotEngine::entry_score(&view(TrendDirection::Up, 0.5, 1.5, 55.0));
        assert_eq!(score, 100);
    }

    #[test]
    fn test_entry_score_downtrend_blocked() {
        // 50 - 30 trend = 20
        let score = SpotEngine::entry_score(&view(TrendDirection::Down, -0.5, 0.8, 45.0));
        assert_eq!(score, 20);
    }

    #[test]
    fn test_entry_score_overbought_penalty() {
        // 50 + 20 + 15 + 15 - 25 = 75
        let score = SpotEngine::entry_score(&view(TrendDirection::Up, 0.5, 1.5, 75.0));
        assert_eq!(score, 75);
    }
}
