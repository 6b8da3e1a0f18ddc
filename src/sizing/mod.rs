//! Position sizing and leverage
//!
//! Confidence-tier sizing shaped by the gate's attenuation, a Kelly
//! guard fed by journal win rates, and regime/loss-streak-aware leverage
//! under a hard cap.

use tracing::{debug, info};

use crate::types::Regime;

/// Confidence tier → base size (fraction of engine capital)
const SIZE_90_PLUS: f64 = 0.20;
const SIZE_80S: f64 = 0.18;
const SIZE_70S: f64 = 0.15;
const SIZE_60S: f64 = 0.12;

/// Leverage tiers under the hard cap
const HARD_LEVERAGE_CAP: u32 = 8;
const LEVERAGE_90_PLUS: u32 = 8;
const LEVERAGE_80S: u32 = 6;
const LEVERAGE_70S: u32 = 5;
const LEVERAGE_BELOW_70: u32 = 3;

/// Kelly guard parameters
const KELLY_MIN_TRADES: usize = 10;
const KELLY_REWARD_RISK: f64 = 2.0;
const KELLY_CAP_HEALTHY: f64 = 0.25;
const KELLY_CAP_COLD: f64 = 0.15;
const KELLY_HEALTHY_WIN_RATE: f64 = 0.40;

/// Consecutive losses that halve size and leverage
const LOSS_STREAK_THRESHOLD: usize = 2;

#[derive(Debug, Clone)]
pub struct SizerConfig {
    pub size_pct_min: f64,
    pub size_pct_max: f64,
    pub leverage_min: u32,
    pub leverage_max: u32,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            size_pct_min: 0.08,
            size_pct_max: 0.25,
            leverage_min: 2,
            leverage_max: HARD_LEVERAGE_CAP,
        }
    }
}

/// Inputs gathered by the engine before sizing
#[derive(Debug, Clone)]
pub struct SizingInputs {
    /// Final confidence after gate bonuses
    pub confidence: u8,
    pub regime: Regime,
    /// Product of gate attenuation multipliers
    pub attenuation: f64,
    /// Engine capital headroom in USD
    pub available_usd: f64,
    /// Hard cap from the exposure gate
    pub size_cap_usd: f64,
    /// Win rate over the recent window, when enough history exists
    pub win_rate: Option<f64>,
    /// Closed trades behind that win rate
    pub trades_recorded: usize,
    pub consecutive_losses: usize,
}

/// Sizer output consumed by the engine's order path
#[derive(Debug, Clone)]
pub struct SizedTrade {
    pub size_pct: f64,
    pub size_usd: f64,
    pub leverage: u32,
}

pub struct PositionSizer {
    config: SizerConfig,
}

impl PositionSizer {
    pub fn new(config: SizerConfig) -> Self {
        Self { config }
    }

    /// Compute size and leverage. Returns None when the clamped size
    /// cannot fit inside the engine headroom.
    pub fn size(&self, inputs: &SizingInputs) -> Option<SizedTrade> {
        // 1. Base size from the confidence tier
        let mut size_pct = base_size(inputs.confidence);

        // 2. Gate attenuation
        size_pct *= inputs.attenuation;

        // 3. Kelly guard once the symbol has history
        if let Some(win_rate) = inputs.win_rate {
            if inputs.trades_recorded >= KELLY_MIN_TRADES {
                let kelly = win_rate - (1.0 - win_rate) / KELLY_REWARD_RISK;
                let cap_fraction = if win_rate >= KELLY_HEALTHY_WIN_RATE {
                    KELLY_CAP_HEALTHY
                } else {
                    KELLY_CAP_COLD
                };
                let kelly_cap = cap_fraction * kelly.max(0.0);
                if kelly_cap < size_pct {
                    debug!(
                        win_rate,
                        kelly, kelly_cap, "Kelly guard shrinking position"
                    );
                    size_pct = kelly_cap;
                }
            }
        }

        // 4. Loss streak halves the size
        if inputs.consecutive_losses >= LOSS_STREAK_THRESHOLD {
            size_pct *= 0.5;
            info!(
                losses = inputs.consecutive_losses,
                "Loss streak: halving size and leverage"
            );
        }

        // 5. Clamp to the configured band
        let size_pct = size_pct.clamp(self.config.size_pct_min, self.config.size_pct_max);

        let mut size_usd = inputs.available_usd * size_pct;
        // Shrink to the exposure gate's cap rather than rejecting
        if size_usd > inputs.size_cap_usd {
            size_usd = inputs.size_cap_usd;
        }
        if size_usd <= 0.0 {
            return None;
        }

        let leverage = self.leverage(inputs);

        Some(SizedTrade {
            size_pct,
            size_usd,
            leverage,
        })
    }

    /// Leverage from the confidence tier, halved in hostile regimes and
    /// on a loss streak, bounded by configuration and the hard cap.
    pub fn leverage(&self, inputs: &SizingInputs) -> u32 {
        let mut leverage = match inputs.confidence {
            90..=100 => LEVERAGE_90_PLUS,
            80..=89 => LEVERAGE_80S,
            70..=79 => LEVERAGE_70S,
            _ => LEVERAGE_BELOW_70,
        };

        if matches!(inputs.regime, Regime::HighVol | Regime::Choppy) {
            leverage = (leverage + 1) / 2; // round up so 3x stays >= 2x
        }
        if inputs.consecutive_losses >= LOSS_STREAK_THRESHOLD {
            leverage = (leverage + 1) / 2;
        }

        leverage
            .clamp(self.config.leverage_min, self.config.leverage_max)
            .min(HARD_LEVERAGE_CAP)
    }
}

fn base_size(confidence: u8) -> f64 {
    match confidence {
        90..=100 => SIZE_90_PLUS,
        80..=89 => SIZE_80S,
        70..=79 => SIZE_70S,
        _ => SIZE_60S,
    }
}
