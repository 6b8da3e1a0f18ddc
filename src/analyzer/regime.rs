//! Market regime classification
//!
//! Classifies volatility and price action into the five regimes the
//! gate, sizer and stop calculator key off. Ties resolve in the order
//! CHOPPY > SIDEWAYS > HIGH_VOL > LOW_VOL > TRENDING so the most
//! defensive label wins.

use crate::indicators;
use crate::types::{Candle, Regime, TimeframeView};

/// ATR vs window-average thresholds
const HIGH_VOL_RATIO: f64 = 1.5;
const LOW_VOL_RATIO: f64 = 0.5;

/// Sideways detection: close range within this band over the lookback
const SIDEWAYS_RANGE_PCT: f64 = 2.0;
const LOOKBACK_CANDLES: usize = 20;

/// Choppy detection: more EMA9 crossings than this over the lookback,
/// or directional strength below the ADX floor
const MAX_EMA_CROSSINGS: usize = 4;
const ADX_FLOOR: f64 = 15.0;

/// Classify the current regime from the 4h volatility picture and the
/// base-timeframe (15m) price action.
pub fn classify(view_4h: &TimeframeView, view_1h: &TimeframeView, base_candles: &[Candle]) -> Regime {
    if is_choppy(view_1h, base_candles) {
        return Regime::Choppy;
    }
    if is_sideways(base_candles) {
        return Regime::Sideways;
    }

    let atr_ratio = view_4h.atr_ratio();
    if atr_ratio > HIGH_VOL_RATIO {
        return Regime::HighVol;
    }
    if atr_ratio < LOW_VOL_RATIO {
        return Regime::LowVol;
    }

    Regime::Trending
}

/// Choppy when price keeps crossing its EMA9 or directional strength is
/// below the ADX floor.
fn is_choppy(view_1h: &TimeframeView, base_candles: &[Candle]) -> bool {
    if view_1h.adx_14 > 0.0 && view_1h.adx_14 < ADX_FLOOR {
        return true;
    }
    if base_candles.len() < LOOKBACK_CANDLES {
        return false;
    }

    let closes: Vec<f64> = base_candles.iter().map(|c| c.close).collect();
    let ema9 = indicators::ema_series(&closes, 9);
    indicators::ema_cross_count(&closes, &ema9, LOOKBACK_CANDLES) > MAX_EMA_CROSSINGS
}

/// Sideways when the closes of the last 20 base candles stay within a 2% band
fn is_sideways(base_candles: &[Candle]) -> bool {
    if base_candles.len() < LOOKBACK_CANDLES {
        return false;
    }
    let recent = &base_candles[base_candles.len() - LOOKBACK_CANDLES..];
    let mut highest = f64::MIN;
    let mut lowest = f64::MAX;
    for candle in recent {
        highest = highest.max(candle.close);
        lowest = lowest.min(candle.close);
    }
    if lowest <= 0.0 {
        return false;
    }
    (highest - lowest) / lowest * 100.0 <= SIDEWAYS_RANGE_PCT
}
