//! Core types used throughout PerpBot
//!
//! Defines common data structures for symbols, candles, tickers,
//! proposals and accepted trades.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade direction for a leveraged position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The opposite side, used when closing a position with a market order
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Signed multiplier for PnL math (+1 long, -1 short)
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Order side on the exchange (distinct from position side: closing a
/// LONG is a Sell order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn for_entry(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    pub fn for_exit(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Supported timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Exchange interval string (Binance style)
    pub fn interval(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Duration of one candle in seconds
    pub fn duration_secs(&self) -> u64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M15 => 15 * 60,
            Timeframe::H1 => 60 * 60,
            Timeframe::H4 => 4 * 60 * 60,
            Timeframe::D1 => 24 * 60 * 60,
        }
    }

    /// Parse from an interval string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1m" => Some(Timeframe::M1),
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "1d" => Some(Timeframe::D1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interval())
    }
}

/// OHLCV candle. The most recent candle in a series may still be open;
/// all earlier candles are immutable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds
    pub open_time: i64,
    /// Close time in epoch milliseconds
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in base currency
    pub volume: f64,
}

impl Candle {
    /// Typical price used for VWAP
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// 24h ticker snapshot for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    /// Last traded price
    pub last: f64,
    /// 24h quote-currency volume (USD)
    pub quote_volume_24h: f64,
    /// 24h price change percentage
    pub price_change_pct_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
}

/// Trend direction for a single timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Sideways,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendDirection::Up => write!(f, "UP"),
            TrendDirection::Down => write!(f, "DOWN"),
            TrendDirection::Sideways => write!(f, "SIDEWAYS"),
        }
    }
}

/// Trend strength from EMA spread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendStrength {
    Strong,
    Moderate,
    Weak,
}

impl fmt::Display for TrendStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendStrength::Strong => write!(f, "STRONG"),
            TrendStrength::Moderate => write!(f, "MODERATE"),
            TrendStrength::Weak => write!(f, "WEAK"),
        }
    }
}

/// Qualitative market state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Trending,
    Sideways,
    Choppy,
    HighVol,
    LowVol,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Trending => write!(f, "TRENDING"),
            Regime::Sideways => write!(f, "SIDEWAYS"),
            Regime::Choppy => write!(f, "CHOPPY"),
            Regime::HighVol => write!(f, "HIGH_VOL"),
            Regime::LowVol => write!(f, "LOW_VOL"),
        }
    }
}

/// Static correlation group for concurrent-exposure capping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrelationGroup {
    Major,
    Layer1,
    Defi,
    Meme,
    Payments,
    Other,
}

impl CorrelationGroup {
    /// Static symbol → group mapping. Membership is configuration, not
    /// derived from market data.
    pub fn for_symbol(symbol: &str) -> Self {
        match symbol {
            "BTCUSDT" | "ETHUSDT" => CorrelationGroup::Major,
            "SOLUSDT" | "AVAXUSDT" | "ADAUSDT" | "DOTUSDT" | "NEARUSDT" | "APTUSDT"
            | "ATOMUSDT" | "SUIUSDT" => CorrelationGroup::Layer1,
            "LINKUSDT" | "UNIUSDT" | "AAVEUSDT" | "MKRUSDT" => CorrelationGroup::Defi,
            "DOGEUSDT" | "SHIBUSDT" | "PEPEUSDT" | "WIFUSDT" => CorrelationGroup::Meme,
            "XRPUSDT" | "LTCUSDT" | "BCHUSDT" | "XLMUSDT" => CorrelationGroup::Payments,
            _ => CorrelationGroup::Other,
        }
    }
}

impl fmt::Display for CorrelationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationGroup::Major => write!(f, "major"),
            CorrelationGroup::Layer1 => write!(f, "layer1"),
            CorrelationGroup::Defi => write!(f, "defi"),
            CorrelationGroup::Meme => write!(f, "meme"),
            CorrelationGroup::Payments => write!(f, "payments"),
            CorrelationGroup::Other => write!(f, "other"),
        }
    }
}

/// Derived indicator panel for one symbol at one timeframe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeView {
    pub timeframe: Timeframe,
    pub close: f64,
    pub ema_9: f64,
    pub ema_21: f64,
    pub ema_50: f64,
    /// RSI-14, Wilder smoothing, always in [0, 100]
    pub rsi_14: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    /// ATR-14, Wilder smoothing, >= 0
    pub atr_14: f64,
    /// Mean ATR over the window, used for volatility-regime ratios
    pub atr_average: f64,
    pub adx_14: f64,
    pub vwap: f64,
    /// Current volume / mean of last 20 closed candles
    pub volume_ratio: f64,
    pub trend_direction: TrendDirection,
    pub trend_strength: TrendStrength,
}

impl TimeframeView {
    /// ATR relative to its average (1.0 = normal volatility)
    pub fn atr_ratio(&self) -> f64 {
        if self.atr_average <= 0.0 {
            return 1.0;
        }
        self.atr_14 / self.atr_average
    }
}

/// Support and resistance levels near the current price
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SupportResistance {
    pub nearest_support: f64,
    pub nearest_resistance: f64,
    pub at_support: bool,
    pub at_resistance: bool,
}

/// Aggregated multi-timeframe state backing a proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub view_4h: TimeframeView,
    pub view_1h: TimeframeView,
    pub view_15m: TimeframeView,
    pub view_5m: Option<TimeframeView>,
    pub view_1m: Option<TimeframeView>,
    pub regime: Regime,
    /// Weighted trend agreement, 40/70/100
    pub alignment_score: u8,
    pub dominant_direction: TrendDirection,
    pub support_resistance: SupportResistance,
    /// Confidence adjustment from the reference symbol's trend, in [-20, 20]
    pub btc_adjustment: i32,
    /// Reference symbol in extreme volatility: veto all altcoin entries
    pub pause_altcoins: bool,
}

/// A tentative trade produced by the analyzer, consumed by the gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Confidence score in [0, 100]
    pub confidence: u8,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub atr: f64,
    pub context: MarketContext,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    /// Distance from entry to stop as a percentage of entry
    pub fn risk_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (self.entry_price - self.stop_loss).abs() / self.entry_price * 100.0
    }
}

/// A proposal that passed the quality gate, sized and ready to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedTrade {
    pub proposal: Proposal,
    /// Final confidence after gate bonuses
    pub confidence: u8,
    /// Fraction of engine capital, e.g. 0.18
    pub size_pct: f64,
    pub size_usd: f64,
    pub leverage: u32,
    pub stop_loss_pct: f64,
    pub stop_loss_price: f64,
    /// Tighter trail distance requested by the breakout detector
    pub use_tight_trailing: bool,
    /// Entry is delayed until this time while confirmation candles print
    pub confirmation_deadline: Option<DateTime<Utc>>,
}

/// Result of a filled order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub fill_price: f64,
    pub filled_at: DateTime<Utc>,
}

/// Authoritative position view from the exchange, used for reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed quantity: positive long, negative short
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

/// Account balance snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: f64,
    pub equity: f64,
    pub unrealized_pnl: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(OrderSide::for_entry(Side::Short), OrderSide::Sell);
        assert_eq!(OrderSide::for_exit(Side::Short), OrderSide::Buy);
        assert_eq!(Side::Short.sign(), -1.0);
    }

    #[test]
    fn test_timeframe_roundtrip() {
        for tf in [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ] {
            assert_eq!(Timeframe::parse(tf.interval()), Some(tf));
        }
        assert_eq!(Timeframe::parse("3m"), None);
        assert_eq!(Timeframe::H4.duration_secs(), 14_400);
    }

    #[test]
    fn test_correlation_groups() {
        assert_eq!(
            CorrelationGroup::for_symbol("BTCUSDT"),
            CorrelationGroup::Major
        );
        assert_eq!(
            CorrelationGroup::for_symbol("SOLUSDT"),
            CorrelationGroup::Layer1
        );
        assert_eq!(
            CorrelationGroup::for_symbol("FOOUSDT"),
            CorrelationGroup::Other
        );
    }
}
