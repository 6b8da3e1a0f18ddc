//! Unified orchestrator
//!
//! Hosts the trading engines as independent tasks under a shared
//! capital allocator, global risk monitor and heartbeat supervisor.
//! A crash inside one engine never reaches its siblings: the supervisor
//! restarts the engine's loop until its budget runs out, then parks it.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

pub mod allocator;
pub mod health;
pub mod risk;

pub use allocator::{CapitalAllocation, CapitalAllocator, EngineShare};
pub use health::{EngineState, HealthAction, HealthConfig, HealthMonitor};
pub use risk::{GlobalRiskMonitor, RiskLimits, RiskState};

use crate::config::UnifiedConfig;
use crate::data::DataHub;
use crate::engine::{EngineStatus, FuturesEngine, SpotEngine, TradingEngine};
use crate::exchange::ExchangeClient;
use crate::gate::Blacklist;
use crate::journal::TradeJournal;

/// Status ticks between full portfolio log lines
const STATUS_LOG_EVERY: u64 = 30;

/// Combined snapshot for logging and the final report
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub portfolio_value: f64,
    pub engines: Vec<EngineStatus>,
    pub risk: RiskState,
    pub engine_states: HashMap<String, String>,
}

pub struct Orchestrator {
    config: UnifiedConfig,
    exchange: Arc<dyn ExchangeClient>,
    hub: Arc<DataHub>,
    allocator: CapitalAllocator,
    risk: Arc<GlobalRiskMonitor>,
    health: Arc<HealthMonitor>,
    blacklist: Arc<Blacklist>,
    engines: Vec<Arc<dyn TradingEngine>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build the orchestrator with the standard engine set from the
    /// configuration. Fails on invalid configuration.
    pub fn new(config: UnifiedConfig, exchange: Arc<dyn ExchangeClient>) -> Result<Self> {
        config.validate().context("configuration rejected")?;

        let allocator = CapitalAllocator::new(vec![
            EngineShare {
                name: "futures".into(),
                enabled: config.futures.enabled,
                capital_pct: config.futures.capital_pct,
            },
            EngineShare {
                name: "spot".into(),
                enabled: config.spot.enabled,
                capital_pct: config.spot.capital_pct,
            },
        ])?;

        let risk = Arc::new(GlobalRiskMonitor::new(RiskLimits {
            daily_loss_limit_pct: config.global.daily_loss_limit_pct,
            max_drawdown_pct: config.global.max_drawdown_pct,
            cooldown_minutes: config.global.circuit_breaker_cooldown_minutes,
        }));
        let health = Arc::new(HealthMonitor::new(HealthConfig {
            warn_secs: config.global.heartbeat_warn_secs,
            restart_secs: config.global.heartbeat_restart_secs,
            max_restarts: config.global.max_restarts,
        }));
        let hub = Arc::new(DataHub::new());
        let blacklist = Arc::new(Blacklist::new(config.futures.blacklist_duration_minutes));

        let mut orchestrator = Self {
            config,
            exchange,
            hub,
            allocator,
            risk,
            health,
            blacklist,
            engines: Vec::new(),
            tasks: Mutex::new(HashMap::new()),
            shutdown_tx: watch::channel(false).0,
            monitor_task: Mutex::new(None),
        };
        orchestrator.build_standard_engines()?;
        Ok(orchestrator)
    }

    fn build_standard_engines(&mut self) -> Result<()> {
        if self.config.futures.enabled {
            let journal = Arc::new(TradeJournal::open(
                &self.config.journal.data_dir,
                "futures",
                self.config.journal.winrate_lookback,
            )?);
            let engine = FuturesEngine::new(
                self.config.futures.clone(),
                self.config.scanner.clone(),
                self.config.analyzer.clone(),
                Arc::clone(&self.exchange),
                Arc::clone(&self.hub),
                Arc::clone(&self.blacklist),
                journal,
                Arc::clone(&self.risk),
                Arc::clone(&self.health),
                0.0,
                self.config.global.emergency_portfolio_loss_pct,
            );
            self.register_engine(Arc::new(engine));
        }
        if self.config.spot.enabled {
            let journal = Arc::new(TradeJournal::open(
                &self.config.journal.data_dir,
                "spot",
                self.config.journal.winrate_lookback,
            )?);
            let engine = SpotEngine::new(
                self.config.spot.clone(),
                Arc::clone(&self.exchange),
                Arc::clone(&self.hub),
                journal,
                Arc::clone(&self.risk),
                Arc::clone(&self.health),
                0.0,
            );
            self.register_engine(Arc::new(engine));
        }
        Ok(())
    }

    /// Register an engine with the supervisor. Standard engines arrive
    /// here from the constructor; tests inject their own.
    pub fn register_engine(&mut self, engine: Arc<dyn TradingEngine>) {
        self.health.register(engine.name());
        info!(engine = %engine.name(), "📝 Engine registered");
        self.engines.push(engine);
    }

    pub fn risk_monitor(&self) -> Arc<GlobalRiskMonitor> {
        Arc::clone(&self.risk)
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    pub fn data_hub(&self) -> Arc<DataHub> {
        Arc::clone(&self.hub)
    }

    /// Receiver that flips to true when shutdown begins; auxiliary tasks
    /// (e.g. the ticker feed) follow it
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Validate, authenticate, allocate and spawn everything. Returns
    /// once the system is running; `stop` drains it.
    pub async fn start(&self) -> Result<()> {
        info!("═══════════════════════════════════════════");
        info!("🚀 Unified trading system starting");
        info!(config = %self.config.digest(), "Configuration loaded");
        info!("═══════════════════════════════════════════");

        // Credentials must work before anything trades
        let account = self
            .exchange
            .fetch_account()
            .await
            .context("exchange authentication failed")?;
        let portfolio_value = account.equity;
        let now = Utc::now();
        self.risk.set_starting_value(portfolio_value, now);
        info!(portfolio_value, "Account verified");

        for engine in &self.engines {
            let allocation = self
                .allocator
                .allocation_for(engine.name(), portfolio_value);
            engine.set_allocated_usd(allocation.allocated_usd);
            info!(
                engine = %engine.name(),
                pct = allocation.allocated_pct,
                usd = allocation.allocated_usd,
                "💰 Capital allocated"
            );
            self.spawn_engine(Arc::clone(engine)).await;
        }

        let monitor = self.spawn_monitor_loop();
        *self.monitor_task.lock().await = Some(monitor);
        Ok(())
    }

    async fn spawn_engine(&self, engine: Arc<dyn TradingEngine>) {
        let name = engine.name().to_string();
        self.health.record_start(&name, Utc::now());

        let shutdown_rx = self.shutdown_tx.subscribe();
        let health = Arc::clone(&self.health);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            match engine.run(shutdown_rx).await {
                Ok(()) => health.record_stop(&task_name),
                Err(e) => {
                    error!(engine = %task_name, error = %e, "❌ Engine crashed");
                    health.record_error(&task_name, &e.to_string());
                }
            }
        });

        self.tasks.lock().await.insert(name, handle);
    }

    fn spawn_monitor_loop(&self) -> JoinHandle<()> {
        let exchange = Arc::clone(&self.exchange);
        let engines = self.engines.clone();
        let risk = Arc::clone(&self.risk);
        let shutdown_tx = self.shutdown_tx.clone();
        let tick_secs = self.config.global.monitor_tick_secs;
        let hub = Arc::clone(&self.hub);

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            let mut ticker = interval(Duration::from_secs(tick_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick_count: u64 = 0;

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        tick_count += 1;
                        let now = Utc::now();

                        // Portfolio valuation feeds risk limits
                        let portfolio_value = match exchange.fetch_account().await {
                            Ok(account) => {
                                hub.update_account(account);
                                account.equity
                            }
                            Err(e) => {
                                warn!(error = %e, "Portfolio valuation failed");
                                continue;
                            }
                        };

                        // Engine P&L into the global monitor
                        for engine in &engines {
                            let status = engine.status().await;
                            risk.update_pnl(
                                engine.name(),
                                status.realized_pnl_today + status.unrealized_pnl,
                            );
                        }
                        risk.check_and_trigger(portfolio_value, now);

                        // Cross-engine emergency: flatten everything
                        if risk.take_emergency_close_request() {
                            error!("🚨 Emergency close-all across engines");
                            for engine in &engines {
                                if let Err(e) = engine.close_all_positions().await {
                                    error!(engine = %engine.name(), error = %e, "Close-all failed");
                                }
                            }
                        }

                        // Heartbeat supervision runs on the owner's
                        // `run_until_shutdown` ticker, which has the
                        // task handles needed to restart engines.

                        if tick_count % STATUS_LOG_EVERY == 0 {
                            let state = risk.state();
                            info!(
                                portfolio = portfolio_value,
                                daily_pnl_pct = state.daily_pnl_pct,
                                drawdown_pct = state.drawdown_pct,
                                breaker = state.circuit_breaker_active,
                                "📊 Portfolio status"
                            );
                        }
                    }
                }
            }
        })
    }

    /// One supervision pass: restart engines whose heartbeats went
    /// stale, park those out of budget. Called from `run` (and tests).
    pub async fn supervise(&self) {
        let actions = self.health.check(Utc::now());
        for action in actions {
            match action {
                HealthAction::Warn { .. } => {}
                HealthAction::Restart { engine: name } => {
                    if self.health.can_restart(&name) {
                        self.restart_engine(&name).await;
                    }
                }
                HealthAction::Park { engine: name } => {
                    if let Some(handle) = self.tasks.lock().await.remove(&name) {
                        handle.abort();
                    }
                    self.health
                        .record_error(&name, "restart budget exhausted");
                }
            }
        }
    }

    async fn restart_engine(&self, name: &str) {
        let engine = match self.engines.iter().find(|e| e.name() == name) {
            Some(engine) => Arc::clone(engine),
            None => return,
        };

        warn!(engine = %name, "🔄 Restarting engine");
        if let Some(handle) = self.tasks.lock().await.remove(name) {
            handle.abort();
        }
        self.health.record_restart(name);
        self.spawn_engine(engine).await;
    }

    /// Block until shutdown is requested, running supervision between
    /// checks. `stop` unblocks this.
    pub async fn run_until_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(Duration::from_secs(
            self.config.global.monitor_tick_secs.max(1),
        ));
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.supervise().await;
                }
            }
        }
    }

    /// Cooperative shutdown: signal every loop, wait out the grace
    /// period per engine, abort stragglers, emit the final snapshot.
    pub async fn stop(&self) {
        info!("👋 Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(true);

        let grace = Duration::from_secs(self.config.global.shutdown_grace_secs);
        let mut tasks = self.tasks.lock().await;
        for (name, handle) in tasks.drain() {
            match tokio::time::timeout(grace, handle).await {
                Ok(_) => info!(engine = %name, "Engine drained"),
                Err(_) => {
                    warn!(engine = %name, "Engine did not stop in time, aborting");
                }
            }
        }
        drop(tasks);

        if let Some(monitor) = self.monitor_task.lock().await.take() {
            monitor.abort();
        }

        self.log_final_status().await;
        info!("🛑 Orchestrator stopped");
    }

    pub async fn snapshot(&self) -> PortfolioSnapshot {
        let mut statuses = Vec::new();
        for engine in &self.engines {
            statuses.push(engine.status().await);
        }
        let portfolio_value = self.hub.account().map(|a| a.equity).unwrap_or(0.0);
        PortfolioSnapshot {
            portfolio_value,
            engines: statuses,
            risk: self.risk.state(),
            engine_states: self.health.summary(),
        }
    }

    async fn log_final_status(&self) {
        info!("═══════════════════════════════════════════");
        info!("📊 Final portfolio status");
        for engine in &self.engines {
            let status = engine.status().await;
            info!(
                engine = %status.name,
                positions = status.open_positions,
                realized_today = status.realized_pnl_today,
                unrealized = status.unrealized_pnl,
                "Engine summary"
            );
        }
        let state = self.risk.state();
        info!(
            daily_pnl = state.daily_pnl,
            peak = state.peak_portfolio_value,
            "Risk summary"
        );
        info!("═══════════════════════════════════════════");
    }
}
