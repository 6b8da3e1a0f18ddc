//! Global risk monitor
//!
//! Portfolio-wide circuit breaker over combined daily P&L and drawdown
//! from the running peak. The breaker blocks new entries only; exits
//! always go through. Daily state resets at UTC midnight, the peak does
//! not.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Daily loss that trips the breaker (% of day-start value)
    pub daily_loss_limit_pct: f64,
    /// Drawdown from the peak that trips the breaker (%)
    pub max_drawdown_pct: f64,
    /// Breaker cooldown
    pub cooldown_minutes: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            daily_loss_limit_pct: 5.0,
            max_drawdown_pct: 15.0,
            cooldown_minutes: 60,
        }
    }
}

/// Snapshot of the current risk state
#[derive(Debug, Clone)]
pub struct RiskState {
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub peak_portfolio_value: f64,
    pub drawdown_pct: f64,
    pub circuit_breaker_active: bool,
    pub circuit_breaker_until: Option<DateTime<Utc>>,
    pub circuit_breaker_reason: Option<String>,
}

struct Inner {
    engine_pnl: HashMap<String, f64>,
    day_start_value: f64,
    peak_value: f64,
    last_value: f64,
    breaker_active: bool,
    breaker_until: Option<DateTime<Utc>>,
    breaker_reason: Option<String>,
    day: Option<NaiveDate>,
    emergency_close_requested: bool,
}

pub struct GlobalRiskMonitor {
    limits: RiskLimits,
    inner: RwLock<Inner>,
}

impl GlobalRiskMonitor {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            inner: RwLock::new(Inner {
                engine_pnl: HashMap::new(),
                day_start_value: 0.0,
                peak_value: 0.0,
                last_value: 0.0,
                breaker_active: false,
                breaker_until: None,
                breaker_reason: None,
                day: None,
                emergency_close_requested: false,
            }),
        }
    }

    /// Anchor the daily P&L baseline. Called once the first portfolio
    /// valuation arrives.
    pub fn set_starting_value(&self, portfolio_value: f64, now: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.day_start_value = portfolio_value;
            inner.peak_value = inner.peak_value.max(portfolio_value);
            inner.last_value = portfolio_value;
            inner.day = Some(now.date_naive());
        }
    }

    /// Record one engine's combined P&L (realized today + unrealized)
    pub fn update_pnl(&self, engine: &str, pnl: f64) {
        if let Ok(mut inner) = self.inner.write() {
            inner.engine_pnl.insert(engine.to_string(), pnl);
        }
    }

    /// Track the portfolio peak (running maximum, never reset)
    pub fn mark(&self, portfolio_value: f64) {
        if let Ok(mut inner) = self.inner.write() {
            inner.peak_value = inner.peak_value.max(portfolio_value);
            inner.last_value = portfolio_value;
        }
    }

    fn combined_pnl(inner: &Inner) -> f64 {
        inner.engine_pnl.values().sum()
    }

    fn daily_pnl_pct(inner: &Inner) -> f64 {
        if inner.day_start_value <= 0.0 {
            return 0.0;
        }
        Self::combined_pnl(inner) / inner.day_start_value * 100.0
    }

    fn drawdown_pct(inner: &Inner, portfolio_value: f64) -> f64 {
        if inner.peak_value <= 0.0 {
            return 0.0;
        }
        (inner.peak_value - portfolio_value) / inner.peak_value * 100.0
    }

    /// Whether new entries are allowed right now. Expired breakers clear
    /// themselves on the first check past the cooldown.
    pub fn can_open(&self, now: DateTime<Utc>) -> bool {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(_) => return false,
        };

        if inner.breaker_active {
            if let Some(until) = inner.breaker_until {
                if now >= until {
                    inner.breaker_active = false;
                    inner.breaker_until = None;
                    inner.breaker_reason = None;
                    info!("Circuit breaker cooldown expired, trading resumed");
                    return true;
                }
            }
            return false;
        }

        if Self::daily_pnl_pct(&inner) <= -self.limits.daily_loss_limit_pct {
            return false;
        }
        let drawdown = Self::drawdown_pct(&inner, inner.last_value);
        if inner.last_value > 0.0 && drawdown >= self.limits.max_drawdown_pct {
            return false;
        }
        true
    }

    /// Trip the breaker for `cooldown_minutes`. Exits stay allowed.
    pub fn trigger(&self, reason: &str, now: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.breaker_active = true;
            inner.breaker_until = Some(now + Duration::minutes(self.limits.cooldown_minutes));
            inner.breaker_reason = Some(reason.to_string());
            warn!(
                reason,
                until = ?inner.breaker_until,
                "🚨 Circuit breaker triggered, new entries halted"
            );
        }
    }

    /// Evaluate limits against a fresh portfolio valuation, rolling the
    /// day at UTC midnight. Returns the trigger reason when the breaker
    /// fires on this call.
    pub fn check_and_trigger(&self, portfolio_value: f64, now: DateTime<Utc>) -> Option<String> {
        let reason = {
            let mut inner = self.inner.write().ok()?;

            // Day rollover: reset daily P&L and the breaker, keep the peak
            let today = now.date_naive();
            if let Some(day) = inner.day {
                if today > day {
                    inner.engine_pnl.clear();
                    inner.day_start_value = portfolio_value;
                    inner.day = Some(today);
                    inner.breaker_active = false;
                    inner.breaker_until = None;
                    inner.breaker_reason = None;
                    info!(
                        value = portfolio_value,
                        "Daily P&L reset at UTC midnight"
                    );
                }
            } else {
                inner.day = Some(today);
                inner.day_start_value = portfolio_value;
            }

            inner.peak_value = inner.peak_value.max(portfolio_value);
            inner.last_value = portfolio_value;

            if inner.breaker_active {
                return None;
            }

            let daily_pct = Self::daily_pnl_pct(&inner);
            if daily_pct <= -self.limits.daily_loss_limit_pct {
                Some(format!("daily loss limit exceeded ({daily_pct:.2}%)"))
            } else {
                let drawdown = Self::drawdown_pct(&inner, portfolio_value);
                if drawdown >= self.limits.max_drawdown_pct {
                    Some(format!("max drawdown exceeded ({drawdown:.2}%)"))
                } else {
                    None
                }
            }
        };

        if let Some(reason) = &reason {
            self.trigger(reason, now);
        }
        reason
    }

    /// Engines call this when their portfolio-level emergency trips; the
    /// orchestrator polls and closes everything across engines.
    pub fn request_emergency_close(&self, reason: &str) {
        warn!(reason, "Emergency close-all requested");
        if let Ok(mut inner) = self.inner.write() {
            inner.emergency_close_requested = true;
        }
    }

    /// One-shot poll of the emergency flag
    pub fn take_emergency_close_request(&self) -> bool {
        self.inner
            .write()
            .map(|mut inner| std::mem::take(&mut inner.emergency_close_requested))
            .unwrap_or(false)
    }

    pub fn state(&self) -> RiskState {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => {
                return RiskState {
                    daily_pnl: 0.0,
                    daily_pnl_pct: 0.0,
                    peak_portfolio_value: 0.0,
                    drawdown_pct: 0.0,
                    circuit_breaker_active: false,
                    circuit_breaker_until: None,
                    circuit_breaker_reason: None,
                }
            }
        };
        RiskState {
            daily_pnl: Self::combined_pnl(&inner),
            daily_pnl_pct: Self::daily_pnl_pct(&inner),
            peak_portfolio_value: inner.peak_value,
            drawdown_pct: Self::drawdown_pct(&inner, inner.last_value),
            circuit_breaker_active: inner.breaker_active,
            circuit_breaker_until: inner.breaker_until,
            circuit_breaker_reason: inner.breaker_reason.clone(),
        }
    }
}
