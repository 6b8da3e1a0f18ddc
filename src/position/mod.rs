//! Position lifecycle
//!
//! The engine-owned record of an open trade and its state machine:
//! Open → PartialExited(n) → Closed, with EmergencyClosed as the
//! alternate terminal. A trade waiting out its confirmation window is
//! not yet a Position: it lives in the engine's pending-entry record
//! and either executes into an Open position or is cancelled before one
//! exists. Transitions are logged with reason codes; the journal
//! receives the final TradeRecord elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::types::{Regime, Side};

/// Lifecycle states for a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    /// n partial take-profits have fired
    PartialExited(u8),
    Closed,
    EmergencyClosed,
}

impl PositionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionState::Closed | PositionState::EmergencyClosed
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(self, PositionState::Open | PositionState::PartialExited(_))
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::Open => write!(f, "OPEN"),
            PositionState::PartialExited(n) => write!(f, "PARTIAL_EXITED({n})"),
            PositionState::Closed => write!(f, "CLOSED"),
            PositionState::EmergencyClosed => write!(f, "EMERGENCY_CLOSED"),
        }
    }
}

/// One recorded partial take-profit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialExit {
    pub at: DateTime<Utc>,
    pub rung: u8,
    pub price: f64,
    /// Fraction of the original quantity closed at this rung
    pub fraction: f64,
    pub quantity: f64,
    /// Profit in units of initial risk R = |entry - initial stop|
    pub r_multiple: f64,
}

/// An open leveraged position owned by one engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Remaining quantity in base units
    pub quantity: f64,
    pub initial_quantity: f64,
    pub leverage: u32,
    /// Current protective stop (moves with trailing)
    pub stop_loss: f64,
    /// Stop at entry time; the R denominator
    pub initial_stop: f64,
    pub take_profit: f64,
    pub trailing_active: bool,
    /// Best price seen since entry (highest long, lowest short)
    pub trailing_peak_price: f64,
    /// Best profit percentage seen since entry
    pub peak_profit_pct: f64,
    pub partial_exits: Vec<PartialExit>,
    /// Fraction of the original quantity still open
    pub remaining_fraction: f64,
    pub entry_time: DateTime<Utc>,
    pub confidence: u8,
    pub use_tight_trailing: bool,
    pub state: PositionState,
    /// Resting stop-market order on the exchange, when one exists
    pub stop_order_id: Option<String>,
    /// ATR snapshot driving stop and trailing distances; refreshed by
    /// the monitor loop when newer candles are available
    pub atr: f64,
    /// PnL realized so far by partial exits
    pub realized_pnl: f64,
    /// Regime at entry; drives the trailing activation threshold
    pub entry_regime: Regime,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        side: Side,
        entry_price: f64,
        quantity: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
        confidence: u8,
        use_tight_trailing: bool,
        atr: f64,
        entry_regime: Regime,
    ) -> Self {
        Self {
            symbol,
            side,
            entry_price,
            quantity,
            initial_quantity: quantity,
            leverage,
            stop_loss,
            initial_stop: stop_loss,
            take_profit,
            trailing_active: false,
            trailing_peak_price: entry_price,
            peak_profit_pct: 0.0,
            partial_exits: Vec::new(),
            remaining_fraction: 1.0,
            entry_time: Utc::now(),
            confidence,
            use_tight_trailing,
            state: PositionState::Open,
            stop_order_id: None,
            atr,
            realized_pnl: 0.0,
            entry_regime,
        }
    }

    /// Notional value of the remainder at entry price
    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    /// Signed price move in the position's favor, as a percentage
    pub fn pnl_pct(&self, current_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (current_price - self.entry_price) / self.entry_price * 100.0
    }

    /// Unrealized PnL of the remainder in quote currency
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.side.sign() * (current_price - self.entry_price) * self.quantity
    }

    /// Initial risk per unit, the R denominator
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    /// Profit at `price` measured in R multiples
    pub fn r_multiple(&self, price: f64) -> f64 {
        let risk = self.initial_risk();
        if risk <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / risk
    }

    /// Whether the protective stop has traded through
    pub fn stop_hit(&self, current_price: f64) -> bool {
        match self.side {
            Side::Long => current_price <= self.stop_loss,
            Side::Short => current_price >= self.stop_loss,
        }
    }

    /// Record a partial exit and advance the state machine
    pub fn apply_partial(&mut self, rung: u8, price: f64, fraction: f64) -> PartialExit {
        let quantity = self.initial_quantity * fraction;
        let exit = PartialExit {
            at: Utc::now(),
            rung,
            price,
            fraction,
            quantity,
            r_multiple: self.r_multiple(price),
        };

        self.quantity = (self.quantity - quantity).max(0.0);
        self.remaining_fraction = (self.remaining_fraction - fraction).max(0.0);
        self.realized_pnl += self.side.sign() * (price - self.entry_price) * quantity;
        self.partial_exits.push(exit.clone());

        let count = self.partial_exits.len() as u8;
        self.transition(PositionState::PartialExited(count), "PARTIAL_TP");
        exit
    }

    /// Move to a new state with a reason code. Transitions out of a
    /// terminal state are ignored.
    pub fn transition(&mut self, next: PositionState, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        info!(
            symbol = %self.symbol,
            from = %self.state,
            to = %next,
            reason,
            "Position transition"
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position() -> Position {
        Position::new(
            "BTCUSDT".into(),
            Side::Long,
            100.0,
            10.0,
            5,
            97.0,
            106.0,
            80,
            false,
            1.0,
            Regime::Trending,
        )
    }

    #[test]
    fn test_pnl_math_long_and_short() {
        let long = long_position();
        assert!((long.pnl_pct(103.0) - 3.0).abs() < 1e-9);
        assert!((long.unrealized_pnl(103.0) - 30.0).abs() < 1e-9);

        let mut short = long_position();
        short.side = Side::Short;
        assert!((short.pnl_pct(97.0) - 3.0).abs() < 1e-9);
        assert!((short.unrealized_pnl(103.0) + 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_r_multiple() {
        let position = long_position();
        // R = 3.0; at 106 profit = 6.0 = 2R
        assert!((position.r_multiple(106.0) - 2.0).abs() < 1e-9);
        assert!((position.r_multiple(97.0) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_hit_direction() {
        let long = long_position();
        assert!(long.stop_hit(96.9));
        assert!(!long.stop_hit(97.5));

        let mut short = long_position();
        short.side = Side::Short;
        short.stop_loss = 103.0;
        assert!(short.stop_hit(103.5));
        assert!(!short.stop_hit(102.0));
    }

    #[test]
    fn test_partial_exit_bookkeeping() {
        let mut position = long_position();
        let exit = position.apply_partial(1, 104.5, 0.40);

        assert!((exit.quantity - 4.0).abs() < 1e-9);
        assert!((exit.r_multiple - 1.5).abs() < 1e-9);
        assert!((position.quantity - 6.0).abs() < 1e-9);
        assert!((position.remaining_fraction - 0.60).abs() < 1e-9);
        assert_eq!(position.state, PositionState::PartialExited(1));

        position.apply_partial(2, 107.5, 0.30);
        assert!((position.remaining_fraction - 0.30).abs() < 1e-9);
        assert_eq!(position.state, PositionState::PartialExited(2));
        assert!(position.state.is_live());
    }

    #[test]
    fn test_terminal_states_stick() {
        let mut position = long_position();
        position.transition(PositionState::Closed, "TRAILING_STOP");
        assert!(position.state.is_terminal());

        // Further transitions are no-ops
        position.transition(PositionState::Open, "bogus");
        assert_eq!(position.state, PositionState::Closed);
    }

    #[test]
    fn test_remaining_fraction_never_negative() {
        let mut position = long_position();
        position.apply_partial(1, 104.0, 0.6);
        position.apply_partial(2, 105.0, 0.6);
        assert!(position.remaining_fraction >= 0.0);
        assert!(position.quantity >= 0.0);
    }
}
