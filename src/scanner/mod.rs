//! Market scanner
//!
//! Ranks candidate symbols by volume participation times short-term
//! momentum. Output is deterministic for identical inputs: ties break on
//! the higher volume ratio, then lexicographically on the symbol.

use tracing::debug;

use crate::config::ScannerConfig;
use crate::indicators;
use crate::types::{Candle, Ticker};

/// Candles needed for a 20-period volume average plus the current candle
const MIN_5M_CANDLES: usize = 21;

/// One ranked scan candidate
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub symbol: String,
    pub price: f64,
    /// Close-to-close change over the last 5m candle (%)
    pub price_change_5m_pct: f64,
    /// Current 5m volume / 20-period average
    pub volume_ratio: f64,
    /// volume_ratio * |price_change_5m_pct|
    pub momentum_score: f64,
}

pub struct MarketScanner {
    config: ScannerConfig,
}

impl MarketScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Whether a symbol passes the universe filters before any market
    /// data is considered
    pub fn is_eligible(&self, ticker: &Ticker) -> bool {
        if !ticker.symbol.ends_with("USDT") {
            return false;
        }
        if ticker.quote_volume_24h < self.config.min_volume_usd {
            return false;
        }
        let base = ticker.symbol.trim_end_matches("USDT");
        !self
            .config
            .excluded_patterns
            .iter()
            .any(|pattern| base.contains(pattern.as_str()))
    }

    /// Rank the universe. `candles_5m` supplies recent 5m candles per
    /// symbol; symbols without enough history for the 20-period volume
    /// average are excluded.
    pub fn scan<'a, F>(&self, tickers: &'a [Ticker], candles_5m: F) -> Vec<ScanCandidate>
    where
        F: Fn(&str) -> Option<Vec<Candle>>,
    {
        let mut candidates: Vec<ScanCandidate> = tickers
            .iter()
            .filter(|t| self.is_eligible(t))
            .filter_map(|ticker| {
                let candles = candles_5m(&ticker.symbol)?;
                if candles.len() < MIN_5M_CANDLES {
                    return None;
                }

                let last = candles[candles.len() - 1];
                let prev = candles[candles.len() - 2];
                if prev.close <= 0.0 {
                    return None;
                }
                let price_change_5m_pct = (last.close - prev.close) / prev.close * 100.0;
                let volume_ratio = indicators::volume_ratio(&candles, 20);

                Some(ScanCandidate {
                    symbol: ticker.symbol.clone(),
                    price: ticker.last,
                    price_change_5m_pct,
                    volume_ratio,
                    momentum_score: volume_ratio * price_change_5m_pct.abs(),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.momentum_score
                .partial_cmp(&a.momentum_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.volume_ratio
                        .partial_cmp(&a.volume_ratio)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.symbol.cmp(&b.symbol))
        });
        candidates.truncate(self.config.top_n);

        debug!(
            candidates = candidates.len(),
            top = candidates
                .first()
                .map(|c| c.symbol.as_str())
                .unwrap_or("-"),
            "Scan complete"
        );

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> MarketScanner {
        MarketScanner::new(ScannerConfig {
            min_volume_usd: 10_000_000.0,
            top_n: 3,
            excluded_patterns: vec!["USDC".into(), "BUSD".into()],
        })
    }

    fn ticker(symbol: &str, volume: f64) -> Ticker {
        Ticker {
            symbol: symbol.into(),
            last: 100.0,
            quote_volume_24h: volume,
            price_change_pct_24h: 2.0,
            high_24h: 102.0,
            low_24h: 98.0,
        }
    }

    /// 21 flat 5m candles ending with a move of `change_pct` and a final
    /// volume of `ratio` times the average
    fn candles_with(change_pct: f64, ratio: f64) -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..20)
            .map(|i| Candle {
                open_time: i * 300_000,
                close_time: (i + 1) * 300_000,
                open: 100.0,
                high: 100.5,
                low: 99.5,
                close: 100.0,
                volume: 10.0,
            })
            .collect();
        let close = 100.0 * (1.0 + change_pct / 100.0);
        candles.push(Candle {
            open_time: 20 * 300_000,
            close_time: 21 * 300_000,
            open: 100.0,
            high: close.max(100.0),
            low: close.min(100.0),
            close,
            volume: 10.0 * ratio,
        });
        candles
    }

    #[test]
    fn test_eligibility_filters() {
        let scanner = scanner();
        assert!(scanner.is_eligible(&ticker("BTCUSDT", 50_000_000.0)));
        // Thin volume
        assert!(!scanner.is_eligible(&ticker("XYZUSDT", 1_000_000.0)));
        // Stable pair excluded by pattern
        assert!(!scanner.is_eligible(&ticker("USDCUSDT", 50_000_000.0)));
        // Wrong quote currency
        assert!(!scanner.is_eligible(&ticker("BTCBUSD", 50_000_000.0)));
    }

    #[test]
    fn test_ranking_by_momentum_score() {
        let scanner = scanner();
        let tickers = vec![
            ticker("AAAUSDT", 20_000_000.0),
            ticker("BBBUSDT", 20_000_000.0),
            ticker("CCCUSDT", 20_000_000.0),
        ];
        let ranked = scanner.scan(&tickers, |symbol| {
            Some(match symbol {
                "AAAUSDT" => candles_with(1.0, 2.0), // score 2.0
                "BBBUSDT" => candles_with(-2.0, 3.0), // score 6.0, direction-agnostic
                _ => candles_with(0.5, 1.0),          // score 0.5
            })
        });

        let symbols: Vec<&str> = ranked.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BBBUSDT", "AAAUSDT", "CCCUSDT"]);
    }

    #[test]
    fn test_insufficient_history_excluded() {
        let scanner = scanner();
        let tickers = vec![ticker("AAAUSDT", 20_000_000.0)];
        let ranked = scanner.scan(&tickers, |_| Some(candles_with(1.0, 2.0)[..10].to_vec()));
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_tie_breaks_on_volume_ratio() {
        let scanner = scanner();
        let tickers = vec![
            ticker("AAAUSDT", 20_000_000.0),
            ticker("BBBUSDT", 20_000_000.0),
        ];
        // Same |change| * ratio product, different components
        let ranked = scanner.scan(&tickers, |symbol| {
            Some(match symbol {
                "AAAUSDT" => candles_with(2.0, 1.5), // score 3.0, ratio 1.5
                _ => candles_with(1.0, 3.0),         // score 3.0, ratio 3.0
            })
        });
        assert_eq!(ranked[0].symbol, "BBBUSDT");
    }

    #[test]
    fn test_top_n_truncation_and_determinism() {
        let scanner = scanner();
        let tickers: Vec<Ticker> = (0..6)
            .map(|i| ticker(&format!("SYM{i}USDT"), 20_000_000.0))
            .collect();
        let run = |_: ()| {
            scanner.scan(&tickers, |_| Some(candles_with(1.0, 2.0)))
        };
        let first = run(());
        let second = run(());
        assert_eq!(first.len(), 3);
        let names: Vec<_> = first.iter().map(|c| c.symbol.clone()).collect();
        let names2: Vec<_> = second.iter().map(|c| c.symbol.clone()).collect();
        assert_eq!(names, names2);
    }
}
