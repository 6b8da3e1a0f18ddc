//! Reference-symbol correlation adjustment
//!
//! Altcoins track the reference symbol (BTC) hard in both directions.
//! A strong reference trend against the candidate side costs confidence;
//! extreme reference volatility vetoes altcoin entries entirely.

use crate::types::{Side, TimeframeView, TrendDirection, TrendStrength};

/// Confidence penalty when the reference trends strongly against the side
const CORRELATION_PENALTY: i32 = 20;
/// Reference ATR ratio beyond which altcoin entries pause
const EXTREME_VOL_RATIO: f64 = 2.0;

/// Outcome of the reference correlation check
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceAdjustment {
    /// Points added to confidence, in [-20, 20]
    pub adjustment: i32,
    /// Veto all altcoin entries while the reference is this volatile
    pub pause_altcoins: bool,
}

/// Compute the adjustment for a candidate side given the reference 4h
/// view. Missing reference data means no adjustment.
pub fn adjust(reference_4h: Option<&TimeframeView>, side: Side) -> ReferenceAdjustment {
    let view = match reference_4h {
        Some(v) => v,
        None => return ReferenceAdjustment::default(),
    };

    let pause_altcoins = view.atr_ratio() > EXTREME_VOL_RATIO;

    // Only a strong reference trend moves confidence
    if view.trend_strength != TrendStrength::Strong {
        return ReferenceAdjustment {
            adjustment: 0,
            pause_altcoins,
        };
    }

    let adjustment = match (view.trend_direction, side) {
        (TrendDirection::Down, Side::Long) => -CORRELATION_PENALTY,
        (TrendDirection::Up, Side::Short) => -CORRELATION_PENALTY,
        _ => 0,
    };

    ReferenceAdjustment {
        adjustment,
        pause_altcoins,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn reference_view(
        direction: TrendDirection,
        strength: TrendStrength,
        atr: f64,
        atr_average: f64,
    ) -> TimeframeView {
        TimeframeView {
            timeframe: Timeframe::H4,
            close: 50_000.0,
            ema_9: 50_100.0,
            ema_21: 50_000.0,
            ema_50: 49_500.0,
            rsi_14: 50.0,
            macd_line: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            atr_14: atr,
            atr_average,
            adx_14: 25.0,
            vwap: 50_000.0,
            volume_ratio: 1.0,
            trend_direction: direction,
            trend_strength: strength,
        }
    }

    #[test]
    fn test_no_reference_no_adjustment() {
        let result = adjust(None, Side::Long);
        assert_eq!(result.adjustment, 0);
        assert!(!result.pause_altcoins);
    }

    #[test]
    fn test_strong_downtrend_penalizes_longs() {
        let view = reference_view(TrendDirection::Down, TrendStrength::Strong, 1.0, 1.0);
        assert_eq!(adjust(Some(&view), Side::Long).adjustment, -20);
        assert_eq!(adjust(Some(&view), Side::Short).adjustment, 0);
    }

    #[test]
    fn test_strong_uptrend_penalizes_shorts() {
        let view = reference_view(TrendDirection::Up, TrendStrength::Strong, 1.0, 1.0);
        assert_eq!(adjust(Some(&view), Side::Short).adjustment, -20);
        assert_eq!(adjust(Some(&view), Side::Long).adjustment, 0);
    }

    #[test]
    fn test_moderate_trend_is_neutral() {
        let view = reference_view(TrendDirection::Down, TrendStrength::Moderate, 1.0, 1.0);
        assert_eq!(adjust(Some(&view), Side::Long).adjustment, 0);
    }

    #[test]
    fn test_extreme_volatility_pauses() {
        let view = reference_view(TrendDirection::Up, TrendStrength::Weak, 2.5, 1.0);
        let result = adjust(Some(&view), Side::Long);
        assert!(result.pause_altcoins);
        assert_eq!(result.adjustment, 0);
    }
}
