//! Multi-timeframe technical analyzer
//!
//! Folds cached OHLCV into per-timeframe views, derives regime,
//! alignment and confidence, and emits a `Proposal` when the panel
//! agrees strongly enough. All computation is pure and synchronous; the
//! engine supplies candles from the data hub.

use chrono::Utc;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::indicators;
use crate::types::{
    Candle, MarketContext, Proposal, Side, Timeframe, TimeframeView, TrendDirection,
    TrendStrength,
};

pub mod correlation;
pub mod regime;
pub mod sr;

pub use correlation::ReferenceAdjustment;

/// EMA spread thresholds for trend strength (% of price)
const STRONG_SPREAD_PCT: f64 = 1.0;
const MODERATE_SPREAD_PCT: f64 = 0.3;

/// Scoring weights per indicator bucket; they sum to 100
const WEIGHT_TREND_4H: u32 = 25;
const WEIGHT_TREND_1H: u32 = 20;
const WEIGHT_RSI_ZONE: u32 = 15;
const WEIGHT_MACD: u32 = 15;
const WEIGHT_VOLUME: u32 = 10;
const WEIGHT_PRICE_ACTION: u32 = 15;

/// Alignment bonus/penalty applied on top of the bucket score
const FULL_ALIGNMENT_BONUS: i32 = 25;
const CONFLICT_PENALTY: i32 = 15;

/// Timeframe weights for the dominant-direction vote
const WEIGHT_4H: f64 = 0.50;
const WEIGHT_1H: f64 = 0.30;
const WEIGHT_15M: f64 = 0.20;

/// Preliminary stop distance before the regime-adaptive stop calculator
/// refines it: 2x ATR capped at 3% of entry.
const PRELIM_STOP_ATR_MULT: f64 = 2.0;
const PRELIM_STOP_CAP_PCT: f64 = 3.0;
const RISK_REWARD_RATIO: f64 = 1.5;

/// Candle inputs for one analysis pass, oldest first in each series
pub struct CandleSet<'a> {
    pub c4h: &'a [Candle],
    pub c1h: &'a [Candle],
    pub c15m: &'a [Candle],
    pub c5m: Option<&'a [Candle]>,
    pub c1m: Option<&'a [Candle]>,
    /// Reference symbol 4h candles for correlation adjustment
    pub reference_4h: Option<&'a [Candle]>,
}

/// Minimum candles per timeframe for a meaningful indicator panel
pub const MIN_CANDLES: usize = 30;

/// Compute the full indicator panel for one timeframe
pub fn compute_view(timeframe: Timeframe, candles: &[Candle]) -> Option<TimeframeView> {
    if candles.len() < MIN_CANDLES {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let close = *closes.last()?;

    let ema_9 = indicators::ema(&closes, 9);
    let ema_21 = indicators::ema(&closes, 21);
    let ema_50 = indicators::ema(&closes, 50);
    let rsi_14 = indicators::rsi(&closes, 14);
    let (macd_line, macd_signal, macd_histogram) = indicators::macd(&closes, 12, 26, 9);
    let atr_14 = indicators::atr(candles, 14);
    let atr_values = indicators::atr_series(candles, 14);
    let atr_average = if atr_values.is_empty() {
        atr_14
    } else {
        atr_values.iter().sum::<f64>() / atr_values.len() as f64
    };
    let adx_14 = indicators::adx(candles, 14);
    let vwap = indicators::vwap(candles);
    let volume_ratio = indicators::volume_ratio(candles, 20);

    let trend_direction = trend_direction(ema_9, ema_21, close);
    let trend_strength = trend_strength(ema_9, ema_21, close);

    Some(TimeframeView {
        timeframe,
        close,
        ema_9,
        ema_21,
        ema_50,
        rsi_14,
        macd_line,
        macd_signal,
        macd_histogram,
        atr_14,
        atr_average,
        adx_14,
        vwap,
        volume_ratio,
        trend_direction,
        trend_strength,
    })
}

/// UP iff ema9 > ema21 and close above ema9; DOWN iff ema9 < ema21 and
/// close below ema21; SIDEWAYS otherwise.
pub fn trend_direction(ema_9: f64, ema_21: f64, close: f64) -> TrendDirection {
    if ema_9 > ema_21 && close > ema_9 {
        TrendDirection::Up
    } else if ema_9 < ema_21 && close < ema_21 {
        TrendDirection::Down
    } else {
        TrendDirection::Sideways
    }
}

/// Strength from the EMA spread relative to price
pub fn trend_strength(ema_9: f64, ema_21: f64, price: f64) -> TrendStrength {
    if price <= 0.0 {
        return TrendStrength::Weak;
    }
    let spread_pct = (ema_9 - ema_21).abs() / price * 100.0;
    if spread_pct > STRONG_SPREAD_PCT {
        TrendStrength::Strong
    } else if spread_pct > MODERATE_SPREAD_PCT {
        TrendStrength::Moderate
    } else {
        TrendStrength::Weak
    }
}

/// Weighted trend agreement across 4h/1h/15m
#[derive(Debug, Clone, Copy)]
pub struct Alignment {
    /// 100 all agree, 70 two agree, 40 otherwise
    pub score: u8,
    pub dominant: TrendDirection,
    /// +25 when all weighted timeframes agree non-sideways
    pub bonus: i32,
    /// -15 when the 1h contradicts the 4h
    pub penalty: i32,
}

/// Score trend agreement with weights {4h: 0.50, 1h: 0.30, 15m: 0.20}
pub fn alignment(
    trend_4h: TrendDirection,
    trend_1h: TrendDirection,
    trend_15m: TrendDirection,
) -> Alignment {
    let directions = [trend_4h, trend_1h, trend_15m];
    let up_count = directions
        .iter()
        .filter(|d| **d == TrendDirection::Up)
        .count();
    let down_count = directions
        .iter()
        .filter(|d| **d == TrendDirection::Down)
        .count();

    let score = if up_count == 3 || down_count == 3 {
        100
    } else if up_count == 2 || down_count == 2 {
        70
    } else {
        40
    };

    let weights = [WEIGHT_4H, WEIGHT_1H, WEIGHT_15M];
    let mut up_weight = 0.0;
    let mut down_weight = 0.0;
    for (direction, weight) in directions.iter().zip(weights.iter()) {
        match direction {
            TrendDirection::Up => up_weight += weight,
            TrendDirection::Down => down_weight += weight,
            TrendDirection::Sideways => {}
        }
    }
    let dominant = if up_weight > down_weight {
        TrendDirection::Up
    } else if down_weight > up_weight {
        TrendDirection::Down
    } else {
        TrendDirection::Sideways
    };

    let all_aligned = (up_count == 3 || down_count == 3)
        && trend_4h != TrendDirection::Sideways;
    let conflict = trend_4h != TrendDirection::Sideways
        && trend_1h != TrendDirection::Sideways
        && trend_4h != trend_1h;

    Alignment {
        score,
        dominant,
        bonus: if all_aligned { FULL_ALIGNMENT_BONUS } else { 0 },
        penalty: if conflict { CONFLICT_PENALTY } else { 0 },
    }
}

/// Multi-timeframe analyzer producing gate-ready proposals
pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Run one full analysis pass over a candidate symbol.
    ///
    /// Returns None when the panel has too little data, the dominant
    /// direction is sideways, altcoin entries are vetoed, or the final
    /// confidence falls below the configured minimum.
    pub fn analyze(&self, symbol: &str, current_price: f64, candles: &CandleSet) -> Option<Proposal> {
        let view_4h = compute_view(Timeframe::H4, candles.c4h)?;
        let view_1h = compute_view(Timeframe::H1, candles.c1h)?;
        let view_15m = compute_view(Timeframe::M15, candles.c15m)?;
        let view_5m = candles.c5m.and_then(|c| compute_view(Timeframe::M5, c));
        let view_1m = candles.c1m.and_then(|c| compute_view(Timeframe::M1, c));

        let align = alignment(
            view_4h.trend_direction,
            view_1h.trend_direction,
            view_15m.trend_direction,
        );
        if align.dominant == TrendDirection::Sideways {
            debug!(symbol, "No dominant direction, skipping");
            return None;
        }
        let side = match align.dominant {
            TrendDirection::Up => Side::Long,
            TrendDirection::Down => Side::Short,
            TrendDirection::Sideways => unreachable!(),
        };

        let regime = regime::classify(&view_4h, &view_1h, candles.c15m);
        let support_resistance = sr::detect(candles.c15m, current_price);

        // Reference-symbol correlation: skip for the reference itself
        let reference = if symbol == self.config.reference_symbol {
            ReferenceAdjustment::default()
        } else {
            let reference_view = candles
                .reference_4h
                .and_then(|c| compute_view(Timeframe::H4, c));
            correlation::adjust(reference_view.as_ref(), side)
        };
        if reference.pause_altcoins {
            debug!(symbol, "Reference symbol in extreme volatility, pausing altcoins");
            return None;
        }

        let base_score = self.bucket_score(&view_4h, &view_1h, &view_15m, side);
        let mut confidence =
            base_score as i32 + align.bonus - align.penalty + reference.adjustment;
        confidence = confidence.clamp(0, 100);
        let confidence = confidence as u8;

        if confidence < self.config.min_confidence {
            debug!(symbol, confidence, min = self.config.min_confidence, "Below minimum confidence");
            return None;
        }

        // Preliminary stop/target from the 1h ATR; the stop calculator
        // recomputes the effective stop with the regime multiplier.
        let atr = view_1h.atr_14;
        let stop_distance = (PRELIM_STOP_ATR_MULT * atr)
            .min(current_price * PRELIM_STOP_CAP_PCT / 100.0);
        let (stop_loss, take_profit) = match side {
            Side::Long => (
                current_price - stop_distance,
                current_price + stop_distance * RISK_REWARD_RATIO,
            ),
            Side::Short => (
                current_price + stop_distance,
                current_price - stop_distance * RISK_REWARD_RATIO,
            ),
        };

        let context = MarketContext {
            view_4h,
            view_1h,
            view_15m,
            view_5m,
            view_1m,
            regime,
            alignment_score: align.score,
            dominant_direction: align.dominant,
            support_resistance,
            btc_adjustment: reference.adjustment,
            pause_altcoins: reference.pause_altcoins,
        };

        debug!(
            symbol,
            %side,
            confidence,
            %regime,
            alignment = align.score,
            "Proposal generated"
        );

        Some(Proposal {
            symbol: symbol.to_string(),
            side,
            entry_price: current_price,
            confidence,
            stop_loss,
            take_profit,
            atr,
            context,
            created_at: Utc::now(),
        })
    }

    /// Weighted indicator buckets summing to 100 for the proposed side
    fn bucket_score(
        &self,
        view_4h: &TimeframeView,
        view_1h: &TimeframeView,
        view_15m: &TimeframeView,
        side: Side,
    ) -> u32 {
        let mut score = 0u32;
        let wanted = match side {
            Side::Long => TrendDirection::Up,
            Side::Short => TrendDirection::Down,
        };

        // 4H trend
        if view_4h.trend_direction == wanted {
            score += WEIGHT_TREND_4H;
        }
        // 1H agreement with 4H
        if view_1h.trend_direction == wanted && view_4h.trend_direction == wanted {
            score += WEIGHT_TREND_1H;
        }
        // RSI entry zone on the 1H: pullback zone for longs, bounce zone
        // for shorts
        match side {
            Side::Long if (30.0..=45.0).contains(&view_1h.rsi_14) => score += WEIGHT_RSI_ZONE,
            Side::Short if (55.0..=70.0).contains(&view_1h.rsi_14) => score += WEIGHT_RSI_ZONE,
            _ => {}
        }
        // MACD cross on the 1H
        let macd_supports = match side {
            Side::Long => view_1h.macd_line > view_1h.macd_signal,
            Side::Short => view_1h.macd_line < view_1h.macd_signal,
        };
        if macd_supports {
            score += WEIGHT_MACD;
        }
        // Volume participation on the 1H
        if view_1h.volume_ratio >= 1.5 {
            score += WEIGHT_VOLUME;
        }
        // 15M price action for entry timing
        let price_action = match side {
            Side::Long => {
                view_15m.trend_direction == TrendDirection::Up && view_15m.macd_histogram > 0.0
            }
            Side::Short => {
                view_15m.trend_direction == TrendDirection::Down && view_15m.macd_histogram < 0.0
            }
        };
        if price_action {
            score += WEIGHT_PRICE_ACTION;
        }

        score
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    /// Synthetic candle series trending at `step` per candle
    pub fn trending_candles(start: f64, step: f64, n: usize, volume: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = start + step * i as f64;
                let (open, close) = if step >= 0.0 {
                    (base, base + step.abs().max(0.01))
                } else {
                    (base, base - step.abs().max(0.01))
                };
                Candle {
                    open_time: i as i64 * 60_000,
                    close_time: (i as i64 + 1) * 60_000,
                    open,
                    high: open.max(close) * 1.001,
                    low: open.min(close) * 0.999,
                    close,
                    volume,
                }
            })
            .collect()
    }

    /// Flat candle series oscillating slightly around `price`
    pub fn flat_candles(price: f64, n: usize, volume: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let wiggle = if i % 2 == 0 { 0.02 } else { -0.02 };
                Candle {
                    open_time: i as i64 * 60_000,
                    close_time: (i as i64 + 1) * 60_000,
                    open: price,
                    high: price * 1.0005,
                    low: price * 0.9995,
                    close: price + wiggle,
                    volume,
                }
            })
            .collect()
    }
}
