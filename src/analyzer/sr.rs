//! Support and resistance detection
//!
//! Swing highs/lows over the recent window, with proximity flags the
//! breakout detector uses.

use crate::types::{Candle, SupportResistance};

/// Price within this distance of a level counts as "at" it
const PROXIMITY_PCT: f64 = 0.5;
const LOOKBACK_CANDLES: usize = 20;

/// Detect the nearest support below and resistance above the current
/// price from local swing points. Falls back to ±5% bands when the
/// window has no usable swings.
pub fn detect(candles: &[Candle], current_price: f64) -> SupportResistance {
    let window = if candles.len() > LOOKBACK_CANDLES {
        &candles[candles.len() - LOOKBACK_CANDLES..]
    } else {
        candles
    };

    if window.len() < 3 {
        return SupportResistance {
            nearest_support: current_price * 0.95,
            nearest_resistance: current_price * 1.05,
            at_support: false,
            at_resistance: false,
        };
    }

    let mut swing_highs = Vec::new();
    let mut swing_lows = Vec::new();
    for i in 1..window.len() - 1 {
        if window[i].high > window[i - 1].high && window[i].high > window[i + 1].high {
            swing_highs.push(window[i].high);
        }
        if window[i].low < window[i - 1].low && window[i].low < window[i + 1].low {
            swing_lows.push(window[i].low);
        }
    }
    if swing_highs.is_empty() {
        swing_highs.push(window.iter().map(|c| c.high).fold(f64::MIN, f64::max));
    }
    if swing_lows.is_empty() {
        swing_lows.push(window.iter().map(|c| c.low).fold(f64::MAX, f64::min));
    }

    let nearest_resistance = swing_highs
        .iter()
        .copied()
        .filter(|level| *level > current_price)
        .fold(f64::MAX, f64::min);
    let nearest_resistance = if nearest_resistance == f64::MAX {
        current_price * 1.05
    } else {
        nearest_resistance
    };

    let nearest_support = swing_lows
        .iter()
        .copied()
        .filter(|level| *level < current_price)
        .fold(f64::MIN, f64::max);
    let nearest_support = if nearest_support == f64::MIN {
        current_price * 0.95
    } else {
        nearest_support
    };

    SupportResistance {
        nearest_support,
        nearest_resistance,
        at_support: is_near(current_price, nearest_support),
        at_resistance: is_near(current_price, nearest_resistance),
    }
}

fn is_near(price: f64, level: f64) -> bool {
    if level <= 0.0 {
        return false;
    }
    (price - level).abs() / level * 100.0 <= PROXIMITY_PCT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
        }
    }

    #[test]
    fn test_short_window_fallback_bands() {
        let sr = detect(&[candle(101.0, 99.0)], 100.0);
        assert!((sr.nearest_support - 95.0).abs() < 1e-9);
        assert!((sr.nearest_resistance - 105.0).abs() < 1e-9);
    }

    #[test]
    fn test_swing_levels_found() {
        // A clear swing high at 110 and swing low at 90 in the middle
        let candles = vec![
            candle(101.0, 99.0),
            candle(110.0, 100.0),
            candle(102.0, 98.0),
            candle(100.0, 90.0),
            candle(101.0, 99.0),
        ];
        let sr = detect(&candles, 100.0);
        assert_eq!(sr.nearest_resistance, 110.0);
        assert_eq!(sr.nearest_support, 90.0);
        assert!(!sr.at_resistance);
        assert!(!sr.at_support);
    }

    #[test]
    fn test_proximity_flag() {
        let candles = vec![
            candle(101.0, 99.0),
            candle(110.0, 100.0),
            candle(102.0, 98.0),
            candle(100.0, 90.0),
            candle(101.0, 99.0),
        ];
        // Within 0.5% of the 110 resistance
        let sr = detect(&candles, 109.6);
        assert!(sr.at_resistance);
    }
}
