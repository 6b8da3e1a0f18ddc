//! Signal quality gate
//!
//! A linear pipeline of filters between the analyzer and the sizer.
//! Each filter consumes the proposal plus shared context and returns a
//! `Decision`; the first rejection aborts, attenuations multiply into
//! the size the sizer will compute. Filters never mutate external state
//! and the whole pipeline is deterministic for identical inputs.
//!
//! Order: blacklist, regime, confidence, direction, momentum, micro
//! alignment, volume, breakout, exposure, correlation, global risk.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::types::{Candle, CorrelationGroup, Proposal, Regime, Side, TrendDirection};

pub mod blacklist;

pub use blacklist::{Blacklist, BlacklistEntry};

/// Outcome of a single filter
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Pass,
    /// Shrink the eventual position by `multiplier`
    Attenuate { multiplier: f64, reason: String },
    Reject { reason: String },
}

/// Gate thresholds; defaults follow the regime-aware contract
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Minimum confidence in TRENDING regime
    pub min_confidence_trending: u8,
    /// Minimum confidence in every other tradable regime
    pub min_confidence_other: u8,
    /// Below this confidence the position is attenuated to 0.5x
    pub full_size_confidence: u8,
    /// Adverse close-to-close move over the momentum window that rejects (%)
    pub momentum_contradiction_pct: f64,
    /// Candles in the momentum window
    pub momentum_window: usize,
    /// RSI bounds on the base timeframe
    pub overbought_rsi: f64,
    pub oversold_rsi: f64,
    /// Micro-alignment confidence bonus
    pub micro_bonus: u8,
    /// Volume thresholds
    pub volume_reject_below: f64,
    pub volume_full_above: f64,
    pub volume_attenuation: f64,
    pub volume_bonus_above: f64,
    pub volume_bonus: u8,
    /// Volume ratio that counts as a surge for breakout detection
    pub volume_surge_threshold: f64,
    pub breakout_bonus: u8,
    /// Max concurrent positions per correlation group
    pub max_per_correlation_group: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_confidence_trending: 60,
            min_confidence_other: 65,
            full_size_confidence: 70,
            momentum_contradiction_pct: 0.3,
            momentum_window: 5,
            overbought_rsi: 70.0,
            oversold_rsi: 30.0,
            micro_bonus: 10,
            volume_reject_below: 0.8,
            volume_full_above: 1.5,
            volume_attenuation: 0.6,
            volume_bonus_above: 2.5,
            volume_bonus: 10,
            volume_surge_threshold: 2.0,
            breakout_bonus: 15,
            max_per_correlation_group: 2,
        }
    }
}

/// Shared context snapshot taken atomically at gate time
pub struct GateContext<'a> {
    pub blacklist: &'a Blacklist,
    /// Recent base-timeframe candles, oldest first
    pub recent_15m: &'a [Candle],
    /// Direction the scanner's momentum implied, if any
    pub scanner_bias: Option<Side>,
    /// Open positions per correlation group for this engine
    pub positions_by_group: &'a HashMap<CorrelationGroup, usize>,
    /// Capital headroom for this engine (allocated - current exposure)
    pub available_usd: f64,
    /// Global risk monitor's canOpen() at gate time
    pub risk_can_open: bool,
    pub now: DateTime<Utc>,
}

/// Accepted-signal summary handed to the sizer
#[derive(Debug, Clone)]
pub struct GateVerdict {
    pub side: Side,
    /// Confidence after micro/volume/breakout bonuses, clamped to 100
    pub confidence: u8,
    /// Product of all attenuation multipliers
    pub attenuation: f64,
    /// Hard dollar cap from the exposure gate
    pub size_cap_usd: f64,
    pub use_tight_trailing: bool,
    /// Human-readable notes from attenuating filters
    pub notes: Vec<String>,
}

/// Final gate output
#[derive(Debug, Clone)]
pub enum GateResult {
    Accepted(GateVerdict),
    Rejected {
        filter: &'static str,
        reason: String,
    },
}

impl GateResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateResult::Accepted(_))
    }

    pub fn verdict(&self) -> Option<&GateVerdict> {
        match self {
            GateResult::Accepted(verdict) => Some(verdict),
            GateResult::Rejected { .. } => None,
        }
    }
}

/// The filter pipeline
pub struct SignalGate {
    config: GateConfig,
}

impl SignalGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Run the proposal through every filter in order
    pub fn evaluate(&self, proposal: &Proposal, ctx: &GateContext) -> GateResult {
        let mut confidence = proposal.confidence;
        let mut attenuation = 1.0;
        let mut notes = Vec::new();
        let mut use_tight_trailing = false;

        // 1. Blacklist
        if ctx.blacklist.is_blacklisted(&proposal.symbol, ctx.now) {
            return rejected("blacklist", "symbol is blacklisted");
        }

        // 2. Regime: no directional trades in unfavorable regimes, no
        // high-confidence bypass
        let regime = proposal.context.regime;
        if matches!(regime, Regime::Choppy | Regime::Sideways) {
            return rejected("regime", &format!("unfavorable regime {regime}"));
        }

        // 3. Confidence, regime-aware minimum
        let min_confidence = if regime == Regime::Trending {
            self.config.min_confidence_trending
        } else {
            self.config.min_confidence_other
        };
        if confidence < min_confidence {
            return rejected(
                "confidence",
                &format!("confidence {confidence} below minimum {min_confidence} for {regime}"),
            );
        }
        if confidence < self.config.full_size_confidence {
            attenuation *= 0.5;
            notes.push(format!("medium confidence {confidence}: 0.5x size"));
        }

        // 4. Direction alignment: the analyzer always wins
        let side = proposal.side;
        if let Some(bias) = ctx.scanner_bias {
            if bias != side {
                warn!(
                    symbol = %proposal.symbol,
                    analyzer = %side,
                    scanner = %bias,
                    "Direction conflict, following the analyzer"
                );
            }
        }

        // 5. Momentum validation over the recent base candles
        if let Decision::Reject { reason } = self.check_momentum(proposal, ctx.recent_15m, side) {
            return rejected("momentum", &reason);
        }

        // 6. Micro-timeframe alignment (only when both views exist)
        match self.check_micro(proposal, side) {
            MicroOutcome::Aligned => {
                confidence = bump(confidence, self.config.micro_bonus);
                debug!(symbol = %proposal.symbol, confidence, "Micro timeframes aligned");
            }
            MicroOutcome::Contradicts => {
                return rejected("micro", "1m and 5m trends both contradict the signal");
            }
            MicroOutcome::Neutral => {}
        }

        // 7. Volume confirmation on the base timeframe
        let volume_ratio = proposal.context.view_15m.volume_ratio;
        match self.check_volume(volume_ratio) {
            Decision::Reject { reason } => return rejected("volume", &reason),
            Decision::Attenuate { multiplier, reason } => {
                attenuation *= multiplier;
                notes.push(reason);
            }
            Decision::Pass => {}
        }
        if volume_ratio > self.config.volume_bonus_above {
            confidence = bump(confidence, self.config.volume_bonus);
        }

        // 8. Breakout detection
        let sr = proposal.context.support_resistance;
        let surge = volume_ratio >= self.config.volume_surge_threshold;
        let breakout = match side {
            Side::Long => surge && proposal.entry_price > sr.nearest_resistance,
            Side::Short => surge && proposal.entry_price < sr.nearest_support,
        };
        if breakout {
            confidence = bump(confidence, self.config.breakout_bonus);
            use_tight_trailing = true;
            info!(symbol = %proposal.symbol, %side, "Breakout confirmed, tight trailing");
        }

        // 9. Exposure: the sizer must fit inside the engine's headroom
        if ctx.available_usd <= 0.0 {
            return rejected("exposure", "no capital headroom left");
        }

        // 10. Correlation group cap
        let group = CorrelationGroup::for_symbol(&proposal.symbol);
        let open_in_group = ctx.positions_by_group.get(&group).copied().unwrap_or(0);
        if open_in_group >= self.config.max_per_correlation_group {
            return rejected(
                "correlation",
                &format!("{open_in_group} positions already open in group {group}"),
            );
        }

        // 11. Global risk
        if !ctx.risk_can_open {
            return rejected("global_risk", "global risk monitor blocks new entries");
        }

        GateResult::Accepted(GateVerdict {
            side,
            confidence,
            attenuation,
            size_cap_usd: ctx.available_usd,
            use_tight_trailing,
            notes,
        })
    }

    /// Volume participation tiers: reject thin books, attenuate middling
    /// ones, pass full participation untouched
    fn check_volume(&self, volume_ratio: f64) -> Decision {
        if volume_ratio < self.config.volume_reject_below {
            return Decision::Reject {
                reason: format!("volume ratio {volume_ratio:.2} below floor"),
            };
        }
        if volume_ratio < self.config.volume_full_above {
            return Decision::Attenuate {
                multiplier: self.config.volume_attenuation,
                reason: format!(
                    "volume ratio {volume_ratio:.2}: {:.1}x size",
                    self.config.volume_attenuation
                ),
            };
        }
        Decision::Pass
    }

    /// Reject entries against fresh adverse momentum or into RSI extremes
    fn check_momentum(&self, proposal: &Proposal, recent: &[Candle], side: Side) -> Decision {
        let window = self.config.momentum_window;
        if recent.len() >= window {
            let start = recent[recent.len() - window].close;
            let end = recent[recent.len() - 1].close;
            if start > 0.0 {
                let change_pct = (end - start) / start * 100.0;
                match side {
                    Side::Long if change_pct < -self.config.momentum_contradiction_pct => {
                        return Decision::Reject {
                            reason: format!(
                                "price fell {:.2}% over the last {window} candles, contradicts LONG",
                                change_pct.abs()
                            ),
                        };
                    }
                    Side::Short if change_pct > self.config.momentum_contradiction_pct => {
                        return Decision::Reject {
                            reason: format!(
                                "price rose {change_pct:.2}% over the last {window} candles, contradicts SHORT"
                            ),
                        };
                    }
                    _ => {}
                }
            }
        }

        let rsi = proposal.context.view_15m.rsi_14;
        match side {
            Side::Long if rsi > self.config.overbought_rsi => Decision::Reject {
                reason: format!("RSI {rsi:.1} overbought, rejecting LONG"),
            },
            Side::Short if rsi < self.config.oversold_rsi => Decision::Reject {
                reason: format!("RSI {rsi:.1} oversold, rejecting SHORT"),
            },
            _ => Decision::Pass,
        }
    }

    fn check_micro(&self, proposal: &Proposal, side: Side) -> MicroOutcome {
        let (view_1m, view_5m) = match (&proposal.context.view_1m, &proposal.context.view_5m) {
            (Some(a), Some(b)) => (a, b),
            _ => return MicroOutcome::Neutral,
        };

        let wanted = match side {
            Side::Long => TrendDirection::Up,
            Side::Short => TrendDirection::Down,
        };
        let against = match side {
            Side::Long => TrendDirection::Down,
            Side::Short => TrendDirection::Up,
        };

        if view_1m.trend_direction == wanted && view_5m.trend_direction == wanted {
            MicroOutcome::Aligned
        } else if view_1m.trend_direction == against && view_5m.trend_direction == against {
            MicroOutcome::Contradicts
        } else {
            MicroOutcome::Neutral
        }
    }
}

enum MicroOutcome {
    Aligned,
    Contradicts,
    Neutral,
}

fn bump(confidence: u8, bonus: u8) -> u8 {
    confidence.saturating_add(bonus).min(100)
}

fn rejected(filter: &'static str, reason: &str) -> GateResult {
    debug!(filter, reason, "Signal rejected");
    GateResult::Rejected {
        filter,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        MarketContext, SupportResistance, Timeframe, TimeframeView, TrendStrength,
    };

    fn view(timeframe: Timeframe, direction: TrendDirection, rsi: f64, volume_ratio: f64) -> TimeframeView {
        TimeframeView {
            timeframe,
            close: 100.0,
            ema_9: 101.0,
            ema_21: 100.0,
            ema_50: 99.0,
            rsi_14: rsi,
            macd_line: 0.5,
            macd_signal: 0.3,
            macd_histogram: 0.2,
            atr_14: 1.0,
            atr_average: 1.0,
            adx_14: 28.0,
            vwap: 100.0,
            volume_ratio,
            trend_direction: direction,
            trend_strength: TrendStrength::Moderate,
        }
    }

    fn make_proposal(confidence: u8, regime: Regime, volume_ratio: f64) -> Proposal {
        let up = TrendDirection::Up;
        Proposal {
            symbol: "ETHUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            confidence,
            stop_loss: 97.0,
            take_profit: 104.5,
            atr: 1.0,
            context: MarketContext {
                view_4h: view(Timeframe::H4, up, 55.0, 1.2),
                view_1h: view(Timeframe::H1, up, 42.0, 1.5),
                view_15m: view(Timeframe::M15, up, 42.0, volume_ratio),
                view_5m: None,
                view_1m: None,
                regime,
                alignment_score: 100,
                dominant_direction: up,
                support_resistance: SupportResistance {
                    nearest_support: 95.0,
                    nearest_resistance: 110.0,
                    at_support: false,
                    at_resistance: false,
                },
                btc_adjustment: 0,
                pause_altcoins: false,
            },
            created_at: Utc::now(),
        }
    }

    /// Flat candles with a given total change over the final window
    fn candles_with_change(change_pct: f64, n: usize) -> Vec<Candle> {
        let per_candle = change_pct / (n as f64 - 1.0);
        (0..n)
            .map(|i| {
                let close = 100.0 * (1.0 + per_candle * i as f64 / 100.0);
                Candle {
                    open_time: i as i64 * 900_000,
                    close_time: (i as i64 + 1) * 900_000,
                    open: close,
                    high: close + 0.1,
                    low: close - 0.1,
                    close,
                    volume: 10.0,
                }
            })
            .collect()
    }

    struct Harness {
        blacklist: Blacklist,
        groups: HashMap<CorrelationGroup, usize>,
        candles: Vec<Candle>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                blacklist: Blacklist::new(60),
                groups: HashMap::new(),
                candles: candles_with_change(0.1, 5),
            }
        }

        fn ctx(&self) -> GateContext<'_> {
            GateContext {
                blacklist: &self.blacklist,
                recent_15m: &self.candles,
                scanner_bias: None,
                positions_by_group: &self.groups,
                available_usd: 10_000.0,
                risk_can_open: true,
                now: Utc::now(),
            }
        }
    }

    #[test]
    fn test_clean_trending_signal_accepted() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        let proposal = make_proposal(82, Regime::Trending, 1.8);

        let result = gate.evaluate(&proposal, &harness.ctx());
        let verdict = result.verdict().expect("should accept");
        assert_eq!(verdict.side, Side::Long);
        assert_eq!(verdict.confidence, 82);
        assert!((verdict.attenuation - 1.0).abs() < 1e-9);
        assert!(!verdict.use_tight_trailing);
    }

    #[test]
    fn test_choppy_rejected_regardless_of_confidence() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        let proposal = make_proposal(95, Regime::Choppy, 1.8);

        match gate.evaluate(&proposal, &harness.ctx()) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "regime"),
            GateResult::Accepted(_) => panic!("choppy must never pass"),
        }
    }

    #[test]
    fn test_blacklist_rejects_first() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        harness
            .blacklist
            .record_stop_loss("ETHUSDT", Utc::now(), "stop loss");
        let proposal = make_proposal(95, Regime::Choppy, 1.8);

        match gate.evaluate(&proposal, &harness.ctx()) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "blacklist"),
            GateResult::Accepted(_) => panic!(),
        }
    }

    #[test]
    fn test_regime_aware_confidence_minimum() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();

        // 62 passes in TRENDING but not in HIGH_VOL (minimum 65)
        let trending = make_proposal(62, Regime::Trending, 1.8);
        assert!(gate.evaluate(&trending, &harness.ctx()).is_accepted());

        let high_vol = make_proposal(62, Regime::HighVol, 1.8);
        match gate.evaluate(&high_vol, &harness.ctx()) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "confidence"),
            GateResult::Accepted(_) => panic!(),
        }
    }

    #[test]
    fn test_medium_confidence_attenuates() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        let proposal = make_proposal(65, Regime::Trending, 1.8);

        let result = gate.evaluate(&proposal, &harness.ctx());
        let verdict = result.verdict().unwrap();
        assert!((verdict.attenuation - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_adverse_momentum_rejects_long() {
        let gate = SignalGate::new(GateConfig::default());
        let mut harness = Harness::new();
        harness.candles = candles_with_change(-0.45, 5);
        let proposal = make_proposal(82, Regime::Trending, 1.8);

        match gate.evaluate(&proposal, &harness.ctx()) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "momentum"),
            GateResult::Accepted(_) => panic!("0.45% drop must reject a LONG"),
        }
    }

    #[test]
    fn test_overbought_rsi_rejects_long() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        let mut proposal = make_proposal(82, Regime::Trending, 1.8);
        proposal.context.view_15m.rsi_14 = 75.0;

        match gate.evaluate(&proposal, &harness.ctx()) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "momentum"),
            GateResult::Accepted(_) => panic!(),
        }
    }

    #[test]
    fn test_micro_alignment_bonus_and_contradiction() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();

        let mut aligned = make_proposal(82, Regime::Trending, 1.8);
        aligned.context.view_1m = Some(view(Timeframe::M1, TrendDirection::Up, 50.0, 1.0));
        aligned.context.view_5m = Some(view(Timeframe::M5, TrendDirection::Up, 50.0, 1.0));
        let verdict = gate.evaluate(&aligned, &harness.ctx());
        assert_eq!(verdict.verdict().unwrap().confidence, 92);

        let mut contradicting = make_proposal(82, Regime::Trending, 1.8);
        contradicting.context.view_1m =
            Some(view(Timeframe::M1, TrendDirection::Down, 50.0, 1.0));
        contradicting.context.view_5m =
            Some(view(Timeframe::M5, TrendDirection::Down, 50.0, 1.0));
        match gate.evaluate(&contradicting, &harness.ctx()) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "micro"),
            GateResult::Accepted(_) => panic!(),
        }
    }

    #[test]
    fn test_volume_tiers() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();

        // Below the floor: reject
        let thin = make_proposal(82, Regime::Trending, 0.7);
        match gate.evaluate(&thin, &harness.ctx()) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "volume"),
            GateResult::Accepted(_) => panic!(),
        }

        // Middling: attenuated
        let middling = make_proposal(82, Regime::Trending, 1.2);
        let verdict = gate.evaluate(&middling, &harness.ctx());
        assert!((verdict.verdict().unwrap().attenuation - 0.6).abs() < 1e-9);

        // Heavy: confidence bonus
        let heavy = make_proposal(82, Regime::Trending, 2.6);
        let verdict = gate.evaluate(&heavy, &harness.ctx());
        assert_eq!(verdict.verdict().unwrap().confidence, 92);
    }

    #[test]
    fn test_breakout_sets_tight_trailing() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        let mut proposal = make_proposal(82, Regime::Trending, 2.2);
        proposal.context.support_resistance.nearest_resistance = 99.0;

        let verdict = gate.evaluate(&proposal, &harness.ctx());
        let verdict = verdict.verdict().unwrap();
        assert!(verdict.use_tight_trailing);
        assert_eq!(verdict.confidence, 97); // 82 + 15 breakout
    }

    #[test]
    fn test_correlation_group_cap() {
        let gate = SignalGate::new(GateConfig::default());
        let mut harness = Harness::new();
        harness.groups.insert(CorrelationGroup::Major, 2);
        let proposal = make_proposal(82, Regime::Trending, 1.8);

        match gate.evaluate(&proposal, &harness.ctx()) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "correlation"),
            GateResult::Accepted(_) => panic!(),
        }
    }

    #[test]
    fn test_global_risk_gate() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        let proposal = make_proposal(82, Regime::Trending, 1.8);

        let mut ctx = harness.ctx();
        ctx.risk_can_open = false;
        match gate.evaluate(&proposal, &ctx) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "global_risk"),
            GateResult::Accepted(_) => panic!(),
        }
    }

    #[test]
    fn test_exposure_headroom_required() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        let proposal = make_proposal(82, Regime::Trending, 1.8);

        let mut ctx = harness.ctx();
        ctx.available_usd = 0.0;
        match gate.evaluate(&proposal, &ctx) {
            GateResult::Rejected { filter, .. } => assert_eq!(filter, "exposure"),
            GateResult::Accepted(_) => panic!(),
        }
    }

    #[test]
    fn test_gate_determinism() {
        let gate = SignalGate::new(GateConfig::default());
        let harness = Harness::new();
        let proposal = make_proposal(82, Regime::Trending, 1.8);
        let now = Utc::now();

        let run = || {
            let mut ctx = harness.ctx();
            ctx.now = now;
            match gate.evaluate(&proposal, &ctx) {
                GateResult::Accepted(v) => (true, v.confidence, v.attenuation),
                GateResult::Rejected { .. } => (false, 0, 0.0),
            }
        };
        assert_eq!(run(), run());
    }
}
