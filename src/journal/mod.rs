//! Trade journal
//!
//! Append-only CSV record of completed trades plus the in-memory
//! statistics the sizer feeds on: per-symbol win rate over the last N
//! closed trades and consecutive-loss streaks. One journal per engine;
//! writes are ordered by completion time.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::types::Side;

/// One completed trade, as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Completion timestamp in epoch milliseconds
    pub completed_at: i64,
    pub engine: String,
    pub symbol: String,
    pub side: Side,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub realized_pnl: f64,
    /// Reason code: STOP_LOSS, TRAILING_STOP, TAKE_PROFIT, EMERGENCY,
    /// EXTERNAL_CLOSE, SHUTDOWN, ...
    pub exit_reason: String,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > 0.0
    }
}

/// Aggregate performance numbers for the status snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct JournalSummary {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
}

/// Append-only CSV trade journal with win-rate feedback
pub struct TradeJournal {
    path: PathBuf,
    engine: String,
    /// Closed trades considered for per-symbol statistics
    lookback: usize,
    records: RwLock<Vec<TradeRecord>>,
}

impl TradeJournal {
    /// Open (or create) the journal for one engine. Existing records are
    /// loaded so win-rate feedback survives restarts.
    pub fn open(data_dir: &str, engine: &str, lookback: usize) -> Result<Self> {
        let dir = PathBuf::from(data_dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data dir {}", dir.display()))?;
        let path = dir.join(format!("trades_{engine}.csv"));

        let records = if path.exists() {
            let mut reader = ReaderBuilder::new()
                .has_headers(true)
                .from_path(&path)
                .with_context(|| format!("Failed to open journal {}", path.display()))?;
            let mut loaded = Vec::new();
            for row in reader.deserialize::<TradeRecord>() {
                match row {
                    Ok(record) => loaded.push(record),
                    Err(e) => warn!(error = %e, "Skipping malformed journal row"),
                }
            }
            info!(
                engine,
                trades = loaded.len(),
                path = %path.display(),
                "Trade journal loaded"
            );
            loaded
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            engine: engine.to_string(),
            lookback,
            records: RwLock::new(records),
        })
    }

    /// In-memory journal for tests; nothing touches the filesystem until
    /// the first append, which writes into the given directory.
    pub fn in_dir(dir: &std::path::Path, engine: &str, lookback: usize) -> Result<Self> {
        Self::open(dir.to_str().unwrap_or("."), engine, lookback)
    }

    /// Append one completed trade. The write is flushed before the
    /// in-memory view is updated so readers never see unpersisted rows.
    pub fn append(&self, record: TradeRecord) -> Result<()> {
        let exists = self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open journal {}", self.path.display()))?;

        let mut writer = WriterBuilder::new().has_headers(!exists).from_writer(file);
        writer
            .serialize(&record)
            .context("Failed to serialize trade record")?;
        writer.flush().context("Failed to flush trade journal")?;

        info!(
            engine = %self.engine,
            symbol = %record.symbol,
            side = %record.side,
            pnl = record.realized_pnl,
            reason = %record.exit_reason,
            "Trade journaled"
        );

        if let Ok(mut records) = self.records.write() {
            records.push(record);
        }
        Ok(())
    }

    /// Win rate for a symbol over the last `lookback` closed trades.
    /// Returns None when fewer than `min_trades` are recorded, so the
    /// Kelly guard can skip symbols without enough history.
    pub fn win_rate(&self, symbol: &str, min_trades: usize) -> Option<f64> {
        let records = self.records.read().ok()?;
        let recent: Vec<&TradeRecord> = records
            .iter()
            .rev()
            .filter(|r| r.symbol == symbol)
            .take(self.lookback)
            .collect();

        if recent.len() < min_trades {
            return None;
        }
        let wins = recent.iter().filter(|r| r.is_win()).count();
        Some(wins as f64 / recent.len() as f64)
    }

    /// Consecutive losses on a symbol counting back from the most recent
    /// trade. A win resets the streak.
    pub fn consecutive_losses(&self, symbol: &str) -> usize {
        let records = match self.records.read() {
            Ok(r) => r,
            Err(_) => return 0,
        };
        records
            .iter()
            .rev()
            .filter(|r| r.symbol == symbol)
            .take_while(|r| !r.is_win())
            .count()
    }

    /// Number of journaled trades, total
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Realized PnL summed over trades completed today (UTC)
    pub fn realized_pnl_today(&self, now: DateTime<Utc>) -> f64 {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(0);
        self.records
            .read()
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.completed_at >= day_start)
                    .map(|r| r.realized_pnl)
                    .sum()
            })
            .unwrap_or(0.0)
    }

    /// Aggregate performance summary
    pub fn summary(&self) -> JournalSummary {
        let records = match self.records.read() {
            Ok(r) => r,
            Err(_) => return JournalSummary::default(),
        };

        let mut summary = JournalSummary {
            total_trades: records.len(),
            ..Default::default()
        };
        for record in records.iter() {
            summary.total_pnl += record.realized_pnl;
            if record.is_win() {
                summary.wins += 1;
                summary.gross_profit += record.realized_pnl;
            } else {
                summary.losses += 1;
                summary.gross_loss += record.realized_pnl.abs();
            }
        }
        if summary.total_trades > 0 {
            summary.win_rate = summary.wins as f64 / summary.total_trades as f64;
        }
        if summary.gross_loss > 0.0 {
            summary.profit_factor = summary.gross_profit / summary.gross_loss;
        }
        summary
    }

    /// Per-symbol trade counts, for diagnostics
    pub fn trades_per_symbol(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        if let Ok(records) = self.records.read() {
            for record in records.iter() {
                *counts.entry(record.symbol.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(symbol: &str, pnl: f64, completed_at: i64) -> TradeRecord {
        TradeRecord {
            completed_at,
            engine: "futures".into(),
            symbol: symbol.into(),
            side: Side::Long,
            entry_time: completed_at - 60_000,
            exit_time: completed_at,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            quantity: 1.0,
            leverage: 5,
            realized_pnl: pnl,
            exit_reason: if pnl > 0.0 { "TAKE_PROFIT" } else { "STOP_LOSS" }.into(),
        }
    }

    fn temp_journal() -> (TradeJournal, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "perpbot_journal_{}_{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let journal = TradeJournal::in_dir(&dir, "futures", 20).unwrap();
        (journal, dir)
    }

    #[test]
    fn test_append_and_reload() {
        let (journal, dir) = temp_journal();
        journal.append(make_record("BTCUSDT", 10.0, 1_000)).unwrap();
        journal.append(make_record("BTCUSDT", -5.0, 2_000)).unwrap();
        assert_eq!(journal.len(), 2);

        // A fresh journal over the same directory sees the same rows
        let reloaded = TradeJournal::in_dir(&dir, "futures", 20).unwrap();
        assert_eq!(reloaded.len(), 2);
        let summary = reloaded.summary();
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.losses, 1);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_win_rate_requires_history() {
        let (journal, dir) = temp_journal();
        for i in 0..6 {
            let pnl = if i % 2 == 0 { 5.0 } else { -5.0 };
            journal
                .append(make_record("ETHUSDT", pnl, i as i64 * 1_000))
                .unwrap();
        }

        assert_eq!(journal.win_rate("ETHUSDT", 10), None);
        let rate = journal.win_rate("ETHUSDT", 5).unwrap();
        assert!((rate - 0.5).abs() < 1e-9);
        assert_eq!(journal.win_rate("BTCUSDT", 1), None);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_consecutive_losses_reset_on_win() {
        let (journal, dir) = temp_journal();
        journal.append(make_record("SOLUSDT", 5.0, 1_000)).unwrap();
        journal.append(make_record("SOLUSDT", -1.0, 2_000)).unwrap();
        journal.append(make_record("SOLUSDT", -1.0, 3_000)).unwrap();
        assert_eq!(journal.consecutive_losses("SOLUSDT"), 2);

        journal.append(make_record("SOLUSDT", 3.0, 4_000)).unwrap();
        assert_eq!(journal.consecutive_losses("SOLUSDT"), 0);
        // Other symbols unaffected
        assert_eq!(journal.consecutive_losses("BTCUSDT"), 0);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_realized_pnl_today_ignores_yesterday() {
        let (journal, dir) = temp_journal();
        let now = Utc::now();
        let today_ms = now.timestamp_millis();
        let yesterday_ms = today_ms - 36 * 60 * 60 * 1_000;

        journal
            .append(make_record("BTCUSDT", -50.0, yesterday_ms))
            .unwrap();
        journal.append(make_record("BTCUSDT", 20.0, today_ms)).unwrap();

        assert!((journal.realized_pnl_today(now) - 20.0).abs() < 1e-9);

        fs::remove_dir_all(dir).ok();
    }
}
