//! Technical indicator calculations
//!
//! Pure folds over candle slices. Nothing in this module performs I/O or
//! holds state; every function is deterministic for identical inputs so
//! the analyzer and gate stay reproducible.
//!
//! Implemented:
//! - EMA (SMA-seeded, multiplier 2/(n+1))
//! - RSI (Wilder's smoothing)
//! - MACD (12/26/9 with proper EMA signal line)
//! - ATR (Wilder's smoothing of true range)
//! - ADX (Wilder's directional index)
//! - VWAP (typical price, volume weighted)
//! - Volume ratio (current / 20-period average)

use crate::types::Candle;

/// Exponential moving average over the full series, returning the final
/// value. Seeded with the SMA of the first `period` values.
pub fn ema(data: &[f64], period: usize) -> f64 {
    if data.is_empty() || period == 0 {
        return 0.0;
    }
    if data.len() < period {
        return data.iter().sum::<f64>() / data.len() as f64;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut value: f64 = data[..period].iter().sum::<f64>() / period as f64;
    for price in &data[period..] {
        value = (price - value) * multiplier + value;
    }
    value
}

/// EMA for every point in the series (same length as input). Points
/// before the seed window fall back to the running SMA.
pub fn ema_series(data: &[f64], period: usize) -> Vec<f64> {
    if data.is_empty() || period == 0 {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(data.len());
    for (i, price) in data.iter().enumerate() {
        if i < period {
            result.push(data[..=i].iter().sum::<f64>() / (i + 1) as f64);
        } else {
            let prev = result[i - 1];
            result.push((price - prev) * multiplier + prev);
        }
    }
    result
}

/// Relative Strength Index with Wilder's smoothing. Neutral 50 when the
/// series is too short. Always in [0, 100].
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }

    let mut gains = Vec::with_capacity(closes.len() - 1);
    let mut losses = Vec::with_capacity(closes.len() - 1);
    for w in closes.windows(2) {
        let change = w[1] - w[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let mut avg_gain: f64 = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss: f64 = losses[..period].iter().sum::<f64>() / period as f64;
    for i in period..gains.len() {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// MACD: (line, signal, histogram). Line is fast EMA − slow EMA, signal
/// is an EMA of the line over the post-warmup region.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> (f64, f64, f64) {
    if closes.len() < slow {
        return (0.0, 0.0, 0.0);
    }

    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);

    let macd_series: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .enumerate()
        .map(|(i, (f, s))| if i < slow - 1 { 0.0 } else { f - s })
        .collect();

    let valid = &macd_series[slow - 1..];
    let signal_line = if valid.len() < signal {
        if valid.is_empty() {
            0.0
        } else {
            valid.iter().sum::<f64>() / valid.len() as f64
        }
    } else {
        ema(valid, signal)
    };

    let line = *macd_series.last().unwrap_or(&0.0);
    (line, signal_line, line - signal_line)
}

/// True range of a candle given the previous close
fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Average True Range with Wilder's smoothing. Returns 0 when fewer than
/// two candles are available.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < 2 || period == 0 {
        return 0.0;
    }

    let trs: Vec<f64> = candles
        .windows(2)
        .map(|w| true_range(&w[1], w[0].close))
        .collect();

    if trs.len() < period {
        return trs.iter().sum::<f64>() / trs.len() as f64;
    }

    let mut value: f64 = trs[..period].iter().sum::<f64>() / period as f64;
    for tr in &trs[period..] {
        value = (value * (period as f64 - 1.0) + tr) / period as f64;
    }
    value
}

/// ATR for every closed candle after the warmup, used to derive the
/// window average the regime detector compares against.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if candles.len() < 2 || period == 0 {
        return Vec::new();
    }

    let trs: Vec<f64> = candles
        .windows(2)
        .map(|w| true_range(&w[1], w[0].close))
        .collect();
    if trs.len() < period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(trs.len() - period + 1);
    let mut value: f64 = trs[..period].iter().sum::<f64>() / period as f64;
    result.push(value);
    for tr in &trs[period..] {
        value = (value * (period as f64 - 1.0) + tr) / period as f64;
        result.push(value);
    }
    result
}

/// Average Directional Index with Wilder's smoothing. Returns 0 when the
/// series is too short to complete a full smoothing pass.
pub fn adx(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < 2 * period + 1 {
        return 0.0;
    }

    let mut trs = Vec::with_capacity(candles.len() - 1);
    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);

    for w in candles.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        trs.push(true_range(cur, prev.close));

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    // Wilder smoothing of TR and directional movement
    let mut sm_tr: f64 = trs[..period].iter().sum();
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();

    let mut dx_values = Vec::new();
    for i in period..trs.len() {
        sm_tr = sm_tr - sm_tr / period as f64 + trs[i];
        sm_plus = sm_plus - sm_plus / period as f64 + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period as f64 + minus_dm[i];

        if sm_tr <= 0.0 {
            dx_values.push(0.0);
            continue;
        }
        let plus_di = 100.0 * sm_plus / sm_tr;
        let minus_di = 100.0 * sm_minus / sm_tr;
        let di_sum = plus_di + minus_di;
        dx_values.push(if di_sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        });
    }

    if dx_values.len() < period {
        return 0.0;
    }

    let mut adx_value: f64 = dx_values[..period].iter().sum::<f64>() / period as f64;
    for dx in &dx_values[period..] {
        adx_value = (adx_value * (period as f64 - 1.0) + dx) / period as f64;
    }
    adx_value
}

/// Volume-weighted average price over the window
pub fn vwap(candles: &[Candle]) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }
    let total_volume: f64 = candles.iter().map(|c| c.volume).sum();
    if total_volume == 0.0 {
        return candles.last().map(|c| c.close).unwrap_or(0.0);
    }
    candles
        .iter()
        .map(|c| c.typical_price() * c.volume)
        .sum::<f64>()
        / total_volume
}

/// Current volume relative to the mean of the last `period` closed
/// candles (the final candle is treated as current). 1.0 when there is
/// not enough history.
pub fn volume_ratio(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < 2 || period == 0 {
        return 1.0;
    }

    let current = candles[candles.len() - 1].volume;
    let closed = &candles[..candles.len() - 1];
    let window = if closed.len() > period {
        &closed[closed.len() - period..]
    } else {
        closed
    };

    let avg: f64 = window.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64;
    if avg == 0.0 {
        return 1.0;
    }
    current / avg
}

/// Number of times the close crossed the given EMA series over the last
/// `lookback` candles. Feeds choppiness detection.
pub fn ema_cross_count(closes: &[f64], ema_values: &[f64], lookback: usize) -> usize {
    if closes.len() != ema_values.len() || closes.len() < 2 {
        return 0;
    }

    // Only transitions between candles inside the window count
    let start = closes.len().saturating_sub(lookback) + 1;
    let mut crossings = 0;
    for i in (start.max(1))..closes.len() {
        let prev_above = closes[i - 1] > ema_values[i - 1];
        let cur_above = closes[i] > ema_values[i];
        if prev_above != cur_above {
            crossings += 1;
        }
    }
    crossings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn flat_candles(price: f64, volume: f64, n: usize) -> Vec<Candle> {
        (0..n).map(|_| candle(price, price, price, price, volume)).collect()
    }

    #[test]
    fn test_ema_constant_series() {
        let data = vec![10.0; 50];
        assert!((ema(&data, 9) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_follows_trend() {
        let data: Vec<f64> = (1..=60).map(|i| i as f64).collect();
        let fast = ema(&data, 9);
        let slow = ema(&data, 21);
        // In a rising series the short EMA sits above the long EMA
        assert!(fast > slow);
        assert!(fast < 60.0);
    }

    #[test]
    fn test_ema_series_matches_final_ema() {
        let data: Vec<f64> = (1..=40).map(|i| (i as f64).sin() + 10.0).collect();
        let series = ema_series(&data, 9);
        assert_eq!(series.len(), data.len());
        assert!((series.last().unwrap() - ema(&data, 9)).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_bounds() {
        let rising: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        assert!((rsi(&rising, 14) - 100.0).abs() < 1e-9);

        let falling: Vec<f64> = (1..=40).rev().map(|i| i as f64).collect();
        assert!(rsi(&falling, 14) < 1.0);

        let short = vec![1.0, 2.0];
        assert_eq!(rsi(&short, 14), 50.0);
    }

    #[test]
    fn test_rsi_neutral_on_alternating() {
        // Equal-magnitude gains and losses settle near 50
        let data: Vec<f64> = (0..60)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let value = rsi(&data, 14);
        assert!(value > 40.0 && value < 60.0, "rsi={value}");
    }

    #[test]
    fn test_macd_flat_is_zero() {
        let data = vec![50.0; 60];
        let (line, signal, hist) = macd(&data, 12, 26, 9);
        assert!(line.abs() < 1e-9);
        assert!(signal.abs() < 1e-9);
        assert!(hist.abs() < 1e-9);
    }

    #[test]
    fn test_macd_positive_in_uptrend() {
        let data: Vec<f64> = (1..=80).map(|i| i as f64).collect();
        let (line, _, _) = macd(&data, 12, 26, 9);
        assert!(line > 0.0);
    }

    #[test]
    fn test_atr_constant_range() {
        // Every candle spans exactly 2.0 with no gaps
        let candles: Vec<Candle> = (0..40)
            .map(|_| candle(100.0, 101.0, 99.0, 100.0, 1.0))
            .collect();
        assert!((atr(&candles, 14) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_atr_nonnegative_and_gap_aware() {
        // A gap up makes the true range larger than high-low
        let mut candles = flat_candles(100.0, 1.0, 20);
        candles.push(candle(110.0, 111.0, 109.0, 110.0, 1.0));
        let value = atr(&candles, 14);
        assert!(value > 0.0);
    }

    #[test]
    fn test_adx_strong_trend_vs_flat() {
        let trending: Vec<Candle> = (0..80)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 1.0, base - 0.5, base + 0.8, 1.0)
            })
            .collect();
        let flat = flat_candles(100.0, 1.0, 80);

        let adx_trend = adx(&trending, 14);
        let adx_flat = adx(&flat, 14);
        assert!(adx_trend > 25.0, "adx_trend={adx_trend}");
        assert!(adx_flat < adx_trend);
    }

    #[test]
    fn test_vwap_weighted_by_volume() {
        let candles = vec![
            candle(10.0, 10.0, 10.0, 10.0, 1.0),
            candle(20.0, 20.0, 20.0, 20.0, 3.0),
        ];
        // (10*1 + 20*3) / 4 = 17.5
        assert!((vwap(&candles) - 17.5).abs() < 1e-9);
    }

    #[test]
    fn test_volume_ratio() {
        let mut candles = flat_candles(100.0, 10.0, 21);
        candles.last_mut().unwrap().volume = 25.0;
        assert!((volume_ratio(&candles, 20) - 2.5).abs() < 1e-9);

        // Insufficient history defaults to 1.0
        assert_eq!(volume_ratio(&candles[..1], 20), 1.0);
    }

    #[test]
    fn test_ema_cross_count() {
        let closes = vec![10.0, 12.0, 9.0, 12.0, 9.0, 12.0];
        let ema_values = vec![10.5; 6];
        // Crossings at every alternation after the first point
        assert_eq!(ema_cross_count(&closes, &ema_values, 6), 5);
        assert_eq!(ema_cross_count(&closes, &ema_values, 2), 1);
    }
}
