//! Leveraged perpetuals engine
//!
//! Runs two cooperative loops:
//! - scan loop: scanner → analyzer → gate → sizer → (confirmation
//!   window) → market order + protective stop → position registration
//! - monitor loop: mark refresh, reconciliation against the exchange,
//!   trailing updates, partial take-profits, emergency exits
//!
//! Both loops heartbeat on every tick. Per-symbol operations are
//! serialized through the single position map; at most one order path
//! touches a symbol at a time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{EngineStatus, TradingEngine};
use crate::analyzer::{Analyzer, CandleSet};
use crate::config::{AnalyzerConfig, FuturesEngineConfig, ScannerConfig};
use crate::data::DataHub;
use crate::exchange::{ExchangeClient, ExchangeError};
use crate::gate::{Blacklist, GateConfig, GateContext, GateResult, SignalGate};
use crate::journal::{TradeJournal, TradeRecord};
use crate::orchestrator::health::HealthMonitor;
use crate::orchestrator::risk::GlobalRiskMonitor;
use crate::position::{Position, PositionState};
use crate::scanner::{MarketScanner, ScanCandidate};
use crate::sizing::{PositionSizer, SizerConfig, SizingInputs};
use crate::stops;
use crate::types::{AcceptedTrade, Candle, CorrelationGroup, OrderSide, Side, Timeframe};

/// Symbols pre-fetched per scan so a wide universe does not starve the
/// tick budget; eligibility sorting makes the cut deterministic.
const SCAN_PREFETCH_LIMIT: usize = 60;

/// Repeated order rejections inside one scan cycle earn a short ban
const REJECTION_BAN_MINUTES: i64 = 15;

/// An accepted trade waiting out its confirmation window. No Position
/// exists yet: a pending entry either executes into an Open position or
/// is cancelled before anything reaches the exchange.
#[derive(Debug, Clone)]
struct PendingEntry {
    trade: AcceptedTrade,
    size_usd: f64,
    leverage: u32,
    signal_price: f64,
    deadline: DateTime<Utc>,
}

pub struct FuturesEngine {
    name: String,
    config: FuturesEngineConfig,
    exchange: Arc<dyn ExchangeClient>,
    hub: Arc<DataHub>,
    scanner: MarketScanner,
    analyzer: Analyzer,
    gate: SignalGate,
    sizer: PositionSizer,
    blacklist: Arc<Blacklist>,
    journal: Arc<TradeJournal>,
    risk: Arc<GlobalRiskMonitor>,
    health: Arc<HealthMonitor>,
    reference_symbol: String,
    candle_limit: usize,
    /// Portfolio-wide unrealized loss (% of allocation) that flattens
    /// everything, from the global configuration
    portfolio_emergency_pct: f64,
    allocated_usd: StdRwLock<f64>,
    positions: RwLock<HashMap<String, Position>>,
    pending: RwLock<HashMap<String, PendingEntry>>,
    /// Order rejections per symbol within the current scan cycle
    rejections: Mutex<HashMap<String, u32>>,
    running: AtomicBool,
}

impl FuturesEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FuturesEngineConfig,
        scanner_config: ScannerConfig,
        analyzer_config: AnalyzerConfig,
        exchange: Arc<dyn ExchangeClient>,
        hub: Arc<DataHub>,
        blacklist: Arc<Blacklist>,
        journal: Arc<TradeJournal>,
        risk: Arc<GlobalRiskMonitor>,
        health: Arc<HealthMonitor>,
        allocated_usd: f64,
        portfolio_emergency_pct: f64,
    ) -> Self {
        let gate = SignalGate::new(GateConfig {
            min_confidence_trending: config.min_confidence_trending,
            min_confidence_other: config.min_confidence_sideways,
            max_per_correlation_group: config.max_per_correlation_group,
            ..GateConfig::default()
        });
        let sizer = PositionSizer::new(SizerConfig {
            size_pct_min: config.size_pct_min,
            size_pct_max: config.size_pct_max,
            leverage_min: config.leverage_min,
            leverage_max: config.leverage_max,
        });
        let reference_symbol = analyzer_config.reference_symbol.clone();
        let candle_limit = analyzer_config.candle_limit;

        Self {
            name: "futures".to_string(),
            config,
            exchange,
            hub,
            scanner: MarketScanner::new(scanner_config),
            analyzer: Analyzer::new(analyzer_config),
            gate,
            sizer,
            blacklist,
            journal,
            risk,
            health,
            reference_symbol,
            candle_limit,
            portfolio_emergency_pct,
            allocated_usd: StdRwLock::new(allocated_usd),
            positions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            rejections: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    fn allocated(&self) -> f64 {
        self.allocated_usd.read().map(|v| *v).unwrap_or(0.0)
    }

    /// Margin committed to open positions
    async fn exposure(&self) -> f64 {
        let positions = self.positions.read().await;
        positions
            .values()
            .filter(|p| p.state.is_live())
            .map(|p| p.notional() / p.leverage.max(1) as f64)
            .sum()
    }

    /// Candles for symbol/timeframe, hub-cached
    async fn candles(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
        if let Some(cached) = self.hub.ohlcv(symbol, timeframe) {
            return Ok(cached);
        }
        let candles = self
            .exchange
            .fetch_ohlcv(symbol, timeframe, self.candle_limit)
            .await
            .with_context(|| format!("fetching {timeframe} candles for {symbol}"))?;
        self.hub.update_ohlcv(symbol, timeframe, candles.clone());
        Ok(candles)
    }

    // ─────────────────────────────────────────────────────────────
    // Scan loop
    // ─────────────────────────────────────────────────────────────

    async fn scan_tick(&self) -> Result<()> {
        let now = Utc::now();
        self.blacklist.cleanup_expired(now);

        {
            let open = self.positions.read().await.len();
            let pending = self.pending.read().await.len();
            if open + pending >= self.config.max_positions {
                debug!(open, pending, "At position capacity, skipping scan");
                return Ok(());
            }
        }
        if !self.risk.can_open(now) {
            debug!("Global risk monitor closed, skipping scan");
            return Ok(());
        }

        let tickers = self
            .exchange
            .fetch_all_tickers()
            .await
            .context("fetching ticker snapshot")?;
        self.hub.update_tickers(&tickers);

        // Pre-fetch 5m candles for the most liquid eligible symbols so
        // the scanner's closure stays synchronous over the hub.
        let mut eligible: Vec<_> = tickers
            .iter()
            .filter(|t| self.scanner.is_eligible(t))
            .collect();
        eligible.sort_by(|a, b| {
            b.quote_volume_24h
                .partial_cmp(&a.quote_volume_24h)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.symbol.cmp(&b.symbol))
        });
        for ticker in eligible.iter().take(SCAN_PREFETCH_LIMIT) {
            if self.hub.ohlcv(&ticker.symbol, Timeframe::M5).is_none() {
                if let Err(e) = self.candles(&ticker.symbol, Timeframe::M5).await {
                    debug!(symbol = %ticker.symbol, error = %e, "5m prefetch failed");
                }
            }
        }

        let candidates = self
            .scanner
            .scan(&tickers, |symbol| self.hub.ohlcv(symbol, Timeframe::M5));

        for candidate in candidates {
            let at_capacity = {
                let open = self.positions.read().await.len();
                let pending = self.pending.read().await.len();
                open + pending >= self.config.max_positions
            };
            if at_capacity {
                break;
            }
            if self.positions.read().await.contains_key(&candidate.symbol)
                || self.pending.read().await.contains_key(&candidate.symbol)
            {
                continue;
            }

            if let Err(e) = self.evaluate_candidate(&candidate).await {
                warn!(symbol = %candidate.symbol, error = %e, "Candidate evaluation failed");
            }
        }

        // Rejection counters are per scan cycle
        self.rejections.lock().await.clear();
        Ok(())
    }

    /// Analyzer → gate → sizer → stop → (confirm | execute)
    async fn evaluate_candidate(&self, candidate: &ScanCandidate) -> Result<()> {
        let symbol = &candidate.symbol;
        let c4h = self.candles(symbol, Timeframe::H4).await?;
        let c1h = self.candles(symbol, Timeframe::H1).await?;
        let c15m = self.candles(symbol, Timeframe::M15).await?;
        let c5m = self.hub.ohlcv(symbol, Timeframe::M5);
        let c1m = self.candles(symbol, Timeframe::M1).await.ok();
        let reference_4h = if symbol == &self.reference_symbol {
            None
        } else {
            Some(self.candles(&self.reference_symbol, Timeframe::H4).await?)
        };

        let price = self.hub.price(symbol).unwrap_or(candidate.price);
        let proposal = match self.analyzer.analyze(
            symbol,
            price,
            &CandleSet {
                c4h: &c4h,
                c1h: &c1h,
                c15m: &c15m,
                c5m: c5m.as_deref(),
                c1m: c1m.as_deref(),
                reference_4h: reference_4h.as_deref(),
            },
        ) {
            Some(proposal) => proposal,
            None => return Ok(()),
        };

        // Snapshot shared state atomically at gate time
        let now = Utc::now();
        let positions_by_group = self.positions_by_group().await;
        let exposure = self.exposure().await;
        let available = (self.allocated() - exposure).max(0.0);
        let scanner_bias = if candidate.price_change_5m_pct > 0.0 {
            Some(Side::Long)
        } else if candidate.price_change_5m_pct < 0.0 {
            Some(Side::Short)
        } else {
            None
        };

        let verdict = match self.gate.evaluate(
            &proposal,
            &GateContext {
                blacklist: &self.blacklist,
                recent_15m: &c15m,
                scanner_bias,
                positions_by_group: &positions_by_group,
                available_usd: available,
                risk_can_open: self.risk.can_open(now),
                now,
            },
        ) {
            GateResult::Accepted(verdict) => verdict,
            GateResult::Rejected { filter, reason } => {
                debug!(symbol, filter, reason, "Gate rejected");
                return Ok(());
            }
        };

        let trades_recorded = self
            .journal
            .trades_per_symbol()
            .get(symbol)
            .copied()
            .unwrap_or(0);
        let sized = match self.sizer.size(&SizingInputs {
            confidence: verdict.confidence,
            regime: proposal.context.regime,
            attenuation: verdict.attenuation,
            available_usd: available,
            size_cap_usd: verdict.size_cap_usd,
            win_rate: self.journal.win_rate(symbol, 10),
            trades_recorded,
            consecutive_losses: self.journal.consecutive_losses(symbol),
        }) {
            Some(sized) => sized,
            None => return Ok(()),
        };

        let initial = match stops::initial_stop(
            proposal.entry_price,
            verdict.side,
            proposal.atr,
            proposal.context.regime,
        ) {
            Some(initial) => initial,
            None => return Ok(()),
        };
        let size_usd = stops::shrink_for_risk(
            sized.size_usd,
            sized.leverage,
            initial.stop_pct,
            self.allocated(),
        );

        let mut trade = AcceptedTrade {
            proposal: proposal.clone(),
            confidence: verdict.confidence,
            size_pct: sized.size_pct,
            size_usd,
            leverage: sized.leverage,
            stop_loss_pct: initial.stop_pct,
            stop_loss_price: initial.stop_price,
            use_tight_trailing: verdict.use_tight_trailing,
            confirmation_deadline: None,
        };

        if self.config.confirm_candles > 0 {
            let window_secs =
                self.config.confirm_candles as i64 * Timeframe::M15.duration_secs() as i64;
            let deadline = now + ChronoDuration::seconds(window_secs);
            trade.confirmation_deadline = Some(deadline);
            info!(
                symbol,
                side = %verdict.side,
                confidence = verdict.confidence,
                deadline = %deadline,
                "Entry accepted, waiting for confirmation"
            );
            self.pending.write().await.insert(
                symbol.clone(),
                PendingEntry {
                    trade,
                    size_usd,
                    leverage: sized.leverage,
                    signal_price: proposal.entry_price,
                    deadline,
                },
            );
            return Ok(());
        }

        self.execute_entry(&trade).await
    }

    async fn positions_by_group(&self) -> HashMap<CorrelationGroup, usize> {
        let positions = self.positions.read().await;
        let mut groups = HashMap::new();
        for position in positions.values().filter(|p| p.state.is_live()) {
            *groups
                .entry(CorrelationGroup::for_symbol(&position.symbol))
                .or_insert(0) += 1;
        }
        groups
    }

    /// Place the entry order plus its protective stop and register the
    /// position. Order rejections mark the symbol and, repeated within a
    /// cycle, blacklist it for a short window.
    async fn execute_entry(&self, trade: &AcceptedTrade) -> Result<()> {
        let symbol = &trade.proposal.symbol;
        let side = trade.proposal.side;

        if let Err(e) = self.exchange.set_leverage(symbol, trade.leverage).await {
            return self.handle_order_error(symbol, e).await;
        }

        let price = self.hub.price(symbol).unwrap_or(trade.proposal.entry_price);
        if price <= 0.0 {
            anyhow::bail!("no price available for {symbol}");
        }
        let quantity = trade.size_usd * trade.leverage as f64 / price;

        let fill = match self
            .exchange
            .place_market_order(symbol, OrderSide::for_entry(side), quantity)
            .await
        {
            Ok(fill) => fill,
            Err(e) => return self.handle_order_error(symbol, e).await,
        };

        let entry_price = if fill.fill_price > 0.0 {
            fill.fill_price
        } else {
            price
        };
        let mut position = Position::new(
            symbol.clone(),
            side,
            entry_price,
            fill.quantity,
            trade.leverage,
            trade.stop_loss_price,
            trade.proposal.take_profit,
            trade.confidence,
            trade.use_tight_trailing,
            trade.proposal.atr,
            trade.proposal.context.regime,
        );

        match self
            .exchange
            .place_stop_market(
                symbol,
                OrderSide::for_exit(side),
                trade.stop_loss_price,
                fill.quantity,
            )
            .await
        {
            Ok(order_id) => position.stop_order_id = Some(order_id),
            Err(e) => {
                // The position is live without a resting stop; the
                // monitor loop still enforces the soft stop.
                warn!(symbol, error = %e, "Protective stop placement failed");
            }
        }

        info!(
            symbol,
            %side,
            entry = entry_price,
            quantity = fill.quantity,
            leverage = trade.leverage,
            stop = trade.stop_loss_price,
            confidence = trade.confidence,
            "📈 Position opened"
        );
        self.positions.write().await.insert(symbol.clone(), position);
        Ok(())
    }

    async fn handle_order_error(&self, symbol: &str, error: ExchangeError) -> Result<()> {
        match &error {
            ExchangeError::Rejected { code, message } => {
                warn!(symbol, code, message, "Order rejected");
                let mut rejections = self.rejections.lock().await;
                let count = rejections.entry(symbol.to_string()).or_insert(0);
                *count += 1;
                if *count >= 2 {
                    self.blacklist.ban_for(
                        symbol,
                        Utc::now(),
                        REJECTION_BAN_MINUTES,
                        "repeated order rejection",
                    );
                }
                Ok(())
            }
            _ => Err(error.into()),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Monitor loop
    // ─────────────────────────────────────────────────────────────

    async fn monitor_tick(&self) -> Result<()> {
        let now = Utc::now();

        if let Ok(account) = self.exchange.fetch_account().await {
            self.hub.update_account(account);
        }

        // Authoritative view: marks for open symbols plus detection of
        // positions closed behind our back.
        let exchange_positions = self
            .exchange
            .fetch_positions()
            .await
            .context("fetching positions for reconciliation")?;
        let marks: HashMap<String, f64> = exchange_positions
            .iter()
            .map(|p| (p.symbol.clone(), p.mark_price))
            .collect();

        self.reconcile(&marks).await;
        self.check_pending(now).await;

        let symbols: Vec<String> = {
            let positions = self.positions.read().await;
            positions
                .values()
                .filter(|p| p.state.is_live())
                .map(|p| p.symbol.clone())
                .collect()
        };

        for symbol in symbols {
            let mark = marks
                .get(&symbol)
                .copied()
                .or_else(|| self.hub.price(&symbol));
            let mark = match mark {
                Some(mark) => mark,
                None => continue,
            };
            if let Err(e) = self.manage_position(&symbol, mark).await {
                warn!(symbol, error = %e, "Position management failed");
            }
        }

        self.check_portfolio_emergency().await;
        Ok(())
    }

    /// Positions the exchange no longer shows were closed externally:
    /// journal them and drop the local record.
    async fn reconcile(&self, marks: &HashMap<String, f64>) {
        let orphaned: Vec<String> = {
            let positions = self.positions.read().await;
            positions
                .values()
                .filter(|p| p.state.is_live() && !marks.contains_key(&p.symbol))
                .map(|p| p.symbol.clone())
                .collect()
        };

        for symbol in orphaned {
            let mut positions = self.positions.write().await;
            if let Some(mut position) = positions.remove(&symbol) {
                let exit_price = self.hub.price(&symbol).unwrap_or(position.entry_price);
                warn!(
                    symbol,
                    "Position closed externally, reconciling"
                );
                position.transition(PositionState::Closed, "EXTERNAL_CLOSE");
                self.journal_close(&position, exit_price, "EXTERNAL_CLOSE");
            }
        }
    }

    /// Cancel pending entries that moved adversely; execute those whose
    /// confirmation window elapsed.
    async fn check_pending(&self, now: DateTime<Utc>) {
        let mut to_execute = Vec::new();
        {
            let mut pending = self.pending.write().await;
            let mut cancelled = Vec::new();
            for (symbol, entry) in pending.iter() {
                let price = match self.hub.price(symbol) {
                    Some(price) => price,
                    None => continue,
                };
                let adverse_pct = match entry.trade.proposal.side {
                    Side::Long => (entry.signal_price - price) / entry.signal_price * 100.0,
                    Side::Short => (price - entry.signal_price) / entry.signal_price * 100.0,
                };
                if adverse_pct >= self.config.confirm_adverse_pct {
                    info!(
                        symbol,
                        adverse_pct,
                        reason = "CONFIRMATION_FAILED",
                        "Pending entry cancelled"
                    );
                    cancelled.push(symbol.clone());
                } else if now >= entry.deadline {
                    to_execute.push(entry.clone());
                    cancelled.push(symbol.clone());
                }
            }
            for symbol in cancelled {
                pending.remove(&symbol);
            }
        }

        for entry in to_execute {
            debug!(
                symbol = %entry.trade.proposal.symbol,
                size_usd = entry.size_usd,
                leverage = entry.leverage,
                reason = "CONFIRMED",
                "Confirmation window elapsed, executing entry"
            );
            if let Err(e) = self.execute_entry(&entry.trade).await {
                warn!(symbol = %entry.trade.proposal.symbol, error = %e, "Confirmed entry failed");
            }
        }
    }

    /// One position's monitor pass: emergency exit, stop check, trailing
    /// ratchet, partial take-profits.
    async fn manage_position(&self, symbol: &str, mark: f64) -> Result<()> {
        // Refresh the ATR from newer base candles when the cache has them
        let fresh_atr = self
            .hub
            .ohlcv(symbol, Timeframe::M15)
            .map(|candles| crate::indicators::atr(&candles, 14))
            .filter(|atr| *atr > 0.0);

        enum Exit {
            Full { reason: &'static str },
            Partial { rung: u8, fraction: f64 },
            None,
        }

        let action = {
            let mut positions = self.positions.write().await;
            let position = match positions.get_mut(symbol) {
                Some(position) if position.state.is_live() => position,
                _ => return Ok(()),
            };
            if let Some(atr) = fresh_atr {
                position.atr = atr;
            }

            let pnl_pct = position.pnl_pct(mark);
            if pnl_pct <= -self.config.emergency_position_loss_pct {
                Exit::Full { reason: "EMERGENCY" }
            } else if position.stop_hit(mark) {
                let reason = if position.trailing_active {
                    "TRAILING_STOP"
                } else {
                    "STOP_LOSS"
                };
                Exit::Full { reason }
            } else {
                let regime = position.entry_regime;
                match stops::update_trailing(position, mark, position.atr, regime) {
                    stops::TrailingUpdate::StopHit { .. } => Exit::Full {
                        reason: "TRAILING_STOP",
                    },
                    _ => {
                        match stops::next_partial(
                            position,
                            mark,
                            position.atr,
                            self.config.tp1_fraction,
                            self.config.tp2_fraction,
                        ) {
                            Some(spec) => Exit::Partial {
                                rung: spec.rung,
                                fraction: spec.fraction,
                            },
                            None => Exit::None,
                        }
                    }
                }
            }
        };

        match action {
            Exit::Full { reason } => self.close_position(symbol, mark, reason).await,
            Exit::Partial { rung, fraction } => {
                self.take_partial(symbol, mark, rung, fraction).await
            }
            Exit::None => Ok(()),
        }
    }

    async fn take_partial(&self, symbol: &str, mark: f64, rung: u8, fraction: f64) -> Result<()> {
        let (side, quantity) = {
            let positions = self.positions.read().await;
            let position = match positions.get(symbol) {
                Some(position) => position,
                None => return Ok(()),
            };
            (position.side, position.initial_quantity * fraction)
        };

        let fill = match self
            .exchange
            .place_market_order(symbol, OrderSide::for_exit(side), quantity)
            .await
        {
            Ok(fill) => fill,
            Err(e) => return self.handle_order_error(symbol, e).await,
        };

        let mut positions = self.positions.write().await;
        if let Some(position) = positions.get_mut(symbol) {
            let price = if fill.fill_price > 0.0 {
                fill.fill_price
            } else {
                mark
            };
            let exit = position.apply_partial(rung, price, fraction);
            info!(
                symbol,
                rung,
                price,
                r_multiple = exit.r_multiple,
                remaining = position.remaining_fraction,
                "💰 Partial take-profit"
            );
        }
        Ok(())
    }

    /// Close the remainder at market and journal the trade
    async fn close_position(&self, symbol: &str, mark: f64, reason: &'static str) -> Result<()> {
        let (side, quantity, stop_order_id) = {
            let positions = self.positions.read().await;
            let position = match positions.get(symbol) {
                Some(position) if position.state.is_live() => position,
                _ => return Ok(()),
            };
            (
                position.side,
                position.quantity,
                position.stop_order_id.clone(),
            )
        };

        if let Some(order_id) = stop_order_id {
            if let Err(e) = self.exchange.cancel_order(symbol, &order_id).await {
                debug!(symbol, error = %e, "Stop order cancel failed (may have filled)");
            }
        }

        let fill = match self
            .exchange
            .place_market_order(symbol, OrderSide::for_exit(side), quantity)
            .await
        {
            Ok(fill) => fill,
            Err(e) => return self.handle_order_error(symbol, e).await,
        };
        let exit_price = if fill.fill_price > 0.0 {
            fill.fill_price
        } else {
            mark
        };

        let mut positions = self.positions.write().await;
        if let Some(mut position) = positions.remove(symbol) {
            let next_state = if reason == "EMERGENCY" {
                PositionState::EmergencyClosed
            } else {
                PositionState::Closed
            };
            position.transition(next_state, reason);
            self.journal_close(&position, exit_price, reason);

            let realized =
                position.realized_pnl + position.side.sign() * (exit_price - position.entry_price) * quantity;
            if realized < 0.0 && matches!(reason, "STOP_LOSS" | "EMERGENCY") {
                self.blacklist
                    .record_stop_loss(symbol, Utc::now(), reason);
            }
            info!(
                symbol,
                exit = exit_price,
                pnl = realized,
                reason,
                "📉 Position closed"
            );
        }
        Ok(())
    }

    fn journal_close(&self, position: &Position, exit_price: f64, reason: &str) {
        let realized = position.realized_pnl
            + position.side.sign() * (exit_price - position.entry_price) * position.quantity;
        let record = TradeRecord {
            completed_at: Utc::now().timestamp_millis(),
            engine: self.name.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_time: position.entry_time.timestamp_millis(),
            exit_time: Utc::now().timestamp_millis(),
            entry_price: position.entry_price,
            exit_price,
            quantity: position.initial_quantity,
            leverage: position.leverage,
            realized_pnl: realized,
            exit_reason: reason.to_string(),
        };
        if let Err(e) = self.journal.append(record) {
            error!(symbol = %position.symbol, error = %e, "Journal append failed");
        }
    }

    /// Portfolio-level emergency: unrealized loss beyond the threshold
    /// closes this engine's book and asks the orchestrator to flatten
    /// every other engine too.
    async fn check_portfolio_emergency(&self) {
        let allocated = self.allocated();
        if allocated <= 0.0 {
            return;
        }

        let unrealized: f64 = {
            let positions = self.positions.read().await;
            positions
                .values()
                .filter(|p| p.state.is_live())
                .filter_map(|p| {
                    self.hub
                        .price(&p.symbol)
                        .map(|price| p.unrealized_pnl(price))
                })
                .sum()
        };

        let loss_pct = -unrealized / allocated * 100.0;
        if loss_pct > self.portfolio_emergency_pct {
            error!(
                unrealized,
                loss_pct, "🚨 Portfolio emergency, flattening all engines"
            );
            self.risk
                .request_emergency_close("portfolio unrealized loss beyond threshold");
            if let Err(e) = self.close_all_positions().await {
                error!(error = %e, "Emergency close failed");
            }
        }
    }
}

#[async_trait]
impl TradingEngine for FuturesEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            engine = %self.name,
            allocated = self.allocated(),
            scan_secs = self.config.scan_interval_secs,
            monitor_secs = self.config.monitor_interval_secs,
            "🚀 Futures engine starting"
        );
        self.running.store(true, Ordering::SeqCst);

        let mut scan = interval(Duration::from_secs(self.config.scan_interval_secs));
        let mut monitor = interval(Duration::from_secs(self.config.monitor_interval_secs));
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = scan.tick() => {
                    self.health.record_heartbeat(&self.name);
                    if let Err(e) = self.scan_tick().await {
                        warn!(engine = %self.name, error = %e, "Scan tick skipped");
                    }
                    self.health.record_heartbeat(&self.name);
                }
                _ = monitor.tick() => {
                    self.health.record_heartbeat(&self.name);
                    if let Err(e) = self.monitor_tick().await {
                        warn!(engine = %self.name, error = %e, "Monitor tick skipped");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(engine = %self.name, "Futures engine drained");
        Ok(())
    }

    async fn status(&self) -> EngineStatus {
        let positions = self.positions.read().await;
        let live: Vec<&Position> = positions.values().filter(|p| p.state.is_live()).collect();
        let exposure_usd = live
            .iter()
            .map(|p| p.notional() / p.leverage.max(1) as f64)
            .sum();
        let unrealized_pnl = live
            .iter()
            .filter_map(|p| self.hub.price(&p.symbol).map(|price| p.unrealized_pnl(price)))
            .sum();

        EngineStatus {
            name: self.name.clone(),
            open_positions: live.len(),
            exposure_usd,
            unrealized_pnl,
            realized_pnl_today: self.journal.realized_pnl_today(Utc::now()),
        }
    }

    async fn close_all_positions(&self) -> Result<()> {
        let symbols: Vec<(String, f64)> = {
            let positions = self.positions.read().await;
            positions
                .values()
                .filter(|p| p.state.is_live())
                .map(|p| {
                    let mark = self.hub.price(&p.symbol).unwrap_or(p.entry_price);
                    (p.symbol.clone(), mark)
                })
                .collect()
        };
        for (symbol, mark) in symbols {
            self.close_position(&symbol, mark, "EMERGENCY").await?;
        }
        Ok(())
    }

    fn set_allocated_usd(&self, allocated_usd: f64) {
        if let Ok(mut allocated) = self.allocated_usd.write() {
            *allocated = allocated_usd;
        }
    }
}
