//! Stop and trailing management
//!
//! Regime-adaptive ATR stops, the trailing state machine (monotone once
//! active), and the partial take-profit ladder. All functions are pure
//! over the position snapshot; the engine applies the results.

use tracing::{debug, info};

use crate::position::Position;
use crate::types::{Regime, Side};

/// Stop distance bounds as a percentage of entry
const MIN_STOP_PCT: f64 = 1.0;
const MAX_STOP_PCT: f64 = 5.0;

/// Risk budget per trade: max loss as a fraction of engine capital.
/// When the ATR stop implies more, the size shrinks instead of the stop.
const MAX_RISK_FRACTION: f64 = 0.02;

/// Trailing multipliers
const NORMAL_TRAIL_MULT: f64 = 1.5;
const TIGHT_TRAIL_MULT: f64 = 1.0;
const BREAKOUT_TRAIL_MULT: f64 = 0.5;
/// Profit (%) at which the trail tightens
const TIGHT_THRESHOLD_PCT: f64 = 3.0;

/// Partial take-profit rungs in ATR multiples of favorable movement
const TP1_ATR_MULT: f64 = 1.5;
const TP2_ATR_MULT: f64 = 2.5;

/// ATR multiplier for the initial stop by regime. CHOPPY has no
/// multiplier: such proposals were already rejected by the gate.
pub fn atr_multiplier(regime: Regime) -> Option<f64> {
    match regime {
        Regime::Trending => Some(2.5),
        Regime::HighVol => Some(3.0),
        Regime::LowVol => Some(2.0),
        Regime::Sideways => Some(2.0),
        Regime::Choppy => None,
    }
}

/// Trailing activation threshold (% profit) by regime
pub fn activation_pct(regime: Regime) -> f64 {
    match regime {
        Regime::Trending => 2.5,
        Regime::Sideways => 1.5,
        _ => 2.0,
    }
}

/// Initial stop for a new position
#[derive(Debug, Clone, Copy)]
pub struct InitialStop {
    pub stop_price: f64,
    /// Distance as a percentage of entry, after bounds
    pub stop_pct: f64,
    pub atr_mult: f64,
}

/// Compute the regime-adaptive initial stop, bounded to [1%, 5%] of
/// entry. Returns None for CHOPPY (treated as rejected upstream).
pub fn initial_stop(entry: f64, side: Side, atr: f64, regime: Regime) -> Option<InitialStop> {
    let atr_mult = atr_multiplier(regime)?;
    if entry <= 0.0 {
        return None;
    }

    let raw_pct = if atr > 0.0 {
        atr_mult * atr / entry * 100.0
    } else {
        // ATR unavailable: fall back to the middle of the band
        3.0
    };
    let stop_pct = raw_pct.clamp(MIN_STOP_PCT, MAX_STOP_PCT);
    let distance = entry * stop_pct / 100.0;
    let stop_price = match side {
        Side::Long => entry - distance,
        Side::Short => entry + distance,
    };

    Some(InitialStop {
        stop_price,
        stop_pct,
        atr_mult,
    })
}

/// Shrink the position size so the max loss at the stop stays within the
/// per-trade risk budget. The stop itself is never tightened for this.
pub fn shrink_for_risk(size_usd: f64, leverage: u32, stop_pct: f64, engine_capital: f64) -> f64 {
    if size_usd <= 0.0 || engine_capital <= 0.0 || stop_pct <= 0.0 {
        return size_usd;
    }
    let max_loss = size_usd * leverage as f64 * stop_pct / 100.0;
    let budget = engine_capital * MAX_RISK_FRACTION;
    if max_loss <= budget {
        return size_usd;
    }
    let shrunk = size_usd * budget / max_loss;
    debug!(
        size_usd,
        shrunk, stop_pct, leverage, "Risk budget shrinking position"
    );
    shrunk
}

/// Result of one trailing update
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailingUpdate {
    /// Still below the activation threshold
    Inactive,
    /// Stop ratcheted (or held) at this level
    Trailing { stop: f64 },
    /// Price fell back through the trail: close the remainder
    StopHit { stop: f64 },
}

/// Trailing state machine step. Mutates the position's peak tracking and
/// stop; the stop only ever ratchets in the position's favor.
pub fn update_trailing(position: &mut Position, current_price: f64, atr: f64, regime: Regime) -> TrailingUpdate {
    let profit_pct = position.pnl_pct(current_price);

    // Track the best excursion even before activation
    let improved = match position.side {
        Side::Long => current_price > position.trailing_peak_price,
        Side::Short => current_price < position.trailing_peak_price,
    };
    if improved {
        position.trailing_peak_price = current_price;
    }
    position.peak_profit_pct = position.peak_profit_pct.max(profit_pct);

    if !position.trailing_active {
        if profit_pct >= activation_pct(regime) {
            position.trailing_active = true;
            info!(
                symbol = %position.symbol,
                profit_pct,
                "Trailing stop activated"
            );
        } else {
            return TrailingUpdate::Inactive;
        }
    }

    let trail_mult = if position.use_tight_trailing {
        BREAKOUT_TRAIL_MULT
    } else if position.peak_profit_pct >= TIGHT_THRESHOLD_PCT {
        TIGHT_TRAIL_MULT
    } else {
        NORMAL_TRAIL_MULT
    };
    let trail_distance = trail_mult * atr;

    // Monotone ratchet: LONG stops only rise, SHORT stops only fall
    let candidate = match position.side {
        Side::Long => position.trailing_peak_price - trail_distance,
        Side::Short => position.trailing_peak_price + trail_distance,
    };
    match position.side {
        Side::Long => position.stop_loss = position.stop_loss.max(candidate),
        Side::Short => position.stop_loss = position.stop_loss.min(candidate),
    }

    if position.stop_hit(current_price) {
        TrailingUpdate::StopHit {
            stop: position.stop_loss,
        }
    } else {
        TrailingUpdate::Trailing {
            stop: position.stop_loss,
        }
    }
}

/// A take-profit rung that should fire now
#[derive(Debug, Clone, Copy)]
pub struct PartialSpec {
    pub rung: u8,
    pub fraction: f64,
}

/// Check the partial take-profit ladder: rung 1 at 1.5x ATR of favorable
/// movement, rung 2 at 2.5x. Fractions come from configuration and must
/// leave a trailed remainder.
pub fn next_partial(
    position: &Position,
    current_price: f64,
    atr: f64,
    tp1_fraction: f64,
    tp2_fraction: f64,
) -> Option<PartialSpec> {
    if atr <= 0.0 || !position.state.is_live() {
        return None;
    }

    let favorable = position.side.sign() * (current_price - position.entry_price);
    let rungs_fired = position.partial_exits.len();

    if rungs_fired == 0 && favorable >= TP1_ATR_MULT * atr {
        return Some(PartialSpec {
            rung: 1,
            fraction: tp1_fraction,
        });
    }
    if rungs_fired == 1 && favorable >= TP2_ATR_MULT * atr {
        return Some(PartialSpec {
            rung: 2,
            fraction: tp2_fraction,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(entry: f64, stop: f64) -> Position {
        Position::new(
            "BTCUSDT".into(),
            Side::Long,
            entry,
            10.0,
            5,
            stop,
            entry * 1.06,
            80,
            false,
            1.0,
            Regime::Trending,
        )
    }

    #[test]
    fn test_atr_multipliers_by_regime() {
        assert_eq!(atr_multiplier(Regime::Trending), Some(2.5));
        assert_eq!(atr_multiplier(Regime::HighVol), Some(3.0));
        assert_eq!(atr_multiplier(Regime::LowVol), Some(2.0));
        assert_eq!(atr_multiplier(Regime::Sideways), Some(2.0));
        assert_eq!(atr_multiplier(Regime::Choppy), None);
    }

    #[test]
    fn test_initial_stop_trending() {
        // 2.5 * 1.2 / 100 = 3% exactly
        let stop = initial_stop(100.0, Side::Long, 1.2, Regime::Trending).unwrap();
        assert!((stop.stop_pct - 3.0).abs() < 1e-9);
        assert!((stop.stop_price - 97.0).abs() < 1e-9);
    }

    #[test]
    fn test_initial_stop_bounds() {
        // Tiny ATR clamps up to 1%
        let tight = initial_stop(100.0, Side::Long, 0.01, Regime::Trending).unwrap();
        assert!((tight.stop_pct - 1.0).abs() < 1e-9);

        // Huge ATR clamps down to 5%
        let wide = initial_stop(100.0, Side::Short, 10.0, Regime::HighVol).unwrap();
        assert!((wide.stop_pct - 5.0).abs() < 1e-9);
        assert!((wide.stop_price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn test_initial_stop_choppy_rejected() {
        assert!(initial_stop(100.0, Side::Long, 1.0, Regime::Choppy).is_none());
    }

    #[test]
    fn test_shrink_for_risk() {
        // 1000 * 5x * 3% = 150 loss vs budget 2% of 5000 = 100
        let shrunk = shrink_for_risk(1_000.0, 5, 3.0, 5_000.0);
        assert!((shrunk - 1_000.0 * 100.0 / 150.0).abs() < 1e-6);

        // Inside budget: untouched
        assert_eq!(shrink_for_risk(100.0, 2, 1.0, 5_000.0), 100.0);
    }

    #[test]
    fn test_trailing_walk_is_monotone() {
        // Scenario: open LONG at 100 with atr=1, trail mult 1.5. Price
        // walks 101, 103, 105, 104, 106; stops never decrease.
        let mut position = long(100.0, 97.0);
        let atr = 1.0;
        // Default regime activation at 2.0%
        let regime = Regime::HighVol;

        assert_eq!(
            update_trailing(&mut position, 101.0, atr, regime),
            TrailingUpdate::Inactive
        );

        let mut last_stop = position.stop_loss;
        for price in [103.0, 105.0, 104.0, 106.0] {
            match update_trailing(&mut position, price, atr, regime) {
                TrailingUpdate::Trailing { stop } | TrailingUpdate::StopHit { stop } => {
                    assert!(stop >= last_stop, "stop regressed: {stop} < {last_stop}");
                    last_stop = stop;
                }
                TrailingUpdate::Inactive => panic!("should be active at {price}"),
            }
        }
        // Peak 106 with tight mult (peak profit 6% >= 3%): stop = 105
        assert!((last_stop - 105.0).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_expected_levels_with_normal_mult() {
        // Keep profits below the tighten threshold so the 1.5x trail holds
        let mut position = long(100.0, 98.5);
        let atr = 1.0;
        let regime = Regime::Sideways; // activates at 1.5%

        update_trailing(&mut position, 101.5, atr, regime);
        assert!(position.trailing_active);
        // peak 101.5 - 1.5 = 100.0; initial stop 98.5 ratchets up
        assert!((position.stop_loss - 100.0).abs() < 1e-9);

        update_trailing(&mut position, 102.5, atr, regime);
        assert!((position.stop_loss - 101.0).abs() < 1e-9);

        // Pullback: stop holds
        update_trailing(&mut position, 102.0, atr, regime);
        assert!((position.stop_loss - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_short_mirrors() {
        let mut position = long(100.0, 103.0);
        position.side = Side::Short;
        let atr = 1.0;
        let regime = Regime::Sideways;

        update_trailing(&mut position, 98.0, atr, regime);
        assert!(position.trailing_active);
        // peak 98 + 1.5 = 99.5; stop falls from 103
        assert!((position.stop_loss - 99.5).abs() < 1e-9);

        // Bounce that clears the trail closes the remainder
        let update = update_trailing(&mut position, 99.6, atr, regime);
        assert!(matches!(update, TrailingUpdate::StopHit { .. }));
    }

    #[test]
    fn test_breakout_tight_trail() {
        let mut position = long(100.0, 98.0);
        position.use_tight_trailing = true;
        let regime = Regime::Trending; // activates at 2.5%

        update_trailing(&mut position, 103.0, 1.0, regime);
        // 0.5x ATR trail: 103 - 0.5 = 102.5
        assert!((position.stop_loss - 102.5).abs() < 1e-9);
    }

    #[test]
    fn test_partial_ladder() {
        let mut position = long(100.0, 97.0);
        let atr = 1.0;

        // Below rung 1
        assert!(next_partial(&position, 101.0, atr, 0.4, 0.3).is_none());

        // Rung 1 at +1.5 ATR
        let tp1 = next_partial(&position, 101.5, atr, 0.4, 0.3).unwrap();
        assert_eq!(tp1.rung, 1);
        assert!((tp1.fraction - 0.4).abs() < 1e-9);
        position.apply_partial(tp1.rung, 101.5, tp1.fraction);

        // Not yet rung 2
        assert!(next_partial(&position, 102.0, atr, 0.4, 0.3).is_none());

        // Rung 2 at +2.5 ATR
        let tp2 = next_partial(&position, 102.5, atr, 0.4, 0.3).unwrap();
        assert_eq!(tp2.rung, 2);
        position.apply_partial(tp2.rung, 102.5, tp2.fraction);

        // Ladder exhausted; the remainder trails
        assert!(next_partial(&position, 110.0, atr, 0.4, 0.3).is_none());
        assert!((position.remaining_fraction - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_partials_need_live_position() {
        let mut position = long(100.0, 97.0);
        position.transition(crate::position::PositionState::Closed, "TEST");
        assert!(next_partial(&position, 105.0, 1.0, 0.4, 0.3).is_none());
    }
}
