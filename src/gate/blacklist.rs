//! Symbol blacklist
//!
//! Time-bounded veto of symbols after stop-loss exits, shared across
//! engines. Reads are cheap and frequent (every gate evaluation); writes
//! happen only on losses and expiry cleanup.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

/// One active blacklist entry
#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub symbol: String,
    pub entered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

/// Shared stop-loss blacklist
pub struct Blacklist {
    entries: RwLock<HashMap<String, BlacklistEntry>>,
    duration: Duration,
}

impl Blacklist {
    pub fn new(duration_minutes: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            duration: Duration::minutes(duration_minutes),
        }
    }

    /// Record a stop-loss exit; the symbol is vetoed for the configured
    /// duration starting now.
    pub fn record_stop_loss(&self, symbol: &str, now: DateTime<Utc>, reason: &str) {
        let entry = BlacklistEntry {
            symbol: symbol.to_string(),
            entered_at: now,
            expires_at: now + self.duration,
            reason: reason.to_string(),
        };
        warn!(
            symbol,
            until = %entry.expires_at,
            reason,
            "Symbol blacklisted"
        );
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(symbol.to_string(), entry);
        }
    }

    /// Blacklist a symbol for an explicit duration (e.g. 15m after
    /// repeated order rejections)
    pub fn ban_for(&self, symbol: &str, now: DateTime<Utc>, minutes: i64, reason: &str) {
        let entry = BlacklistEntry {
            symbol: symbol.to_string(),
            entered_at: now,
            expires_at: now + Duration::minutes(minutes),
            reason: reason.to_string(),
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(symbol.to_string(), entry);
        }
    }

    /// Whether the symbol is vetoed at `now`. Expired entries read as
    /// clear; they are physically removed by `cleanup_expired`.
    pub fn is_blacklisted(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .get(symbol)
                    .map(|entry| now < entry.expires_at)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        if let Ok(mut entries) = self.entries.write() {
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now >= e.expires_at)
                .map(|(symbol, _)| symbol.clone())
                .collect();
            for symbol in expired {
                entries.remove(&symbol);
                info!(symbol, "Blacklist expired, symbol resumes scanning");
                removed += 1;
            }
        }
        removed
    }

    /// Snapshot of active entries
    pub fn active(&self, now: DateTime<Utc>) -> Vec<BlacklistEntry> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| now < e.expires_at)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
