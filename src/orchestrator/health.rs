//! Engine health monitor
//!
//! Tracks per-engine heartbeats and drives the restart policy: a stale
//! heartbeat first warns, then requests a restart; engines that exhaust
//! their restart budget are parked in ERROR while the others continue.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{error, warn};

/// Supervision status of one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Stopped,
    Error,
    Restarting,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Running => write!(f, "RUNNING"),
            EngineState::Stopped => write!(f, "STOPPED"),
            EngineState::Error => write!(f, "ERROR"),
            EngineState::Restarting => write!(f, "RESTARTING"),
        }
    }
}

/// Health record for one engine
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub name: String,
    pub status: EngineState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

/// Action the supervisor should take after a health check
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAction {
    Warn { engine: String, age_secs: i64 },
    Restart { engine: String },
    /// Restart budget exhausted: park the engine
    Park { engine: String },
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub warn_secs: i64,
    pub restart_secs: i64,
    pub max_restarts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            warn_secs: 60,
            restart_secs: 300,
            max_restarts: 3,
        }
    }
}

pub struct HealthMonitor {
    config: HealthConfig,
    engines: RwLock<HashMap<String, EngineHealth>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, engine: &str) {
        if let Ok(mut engines) = self.engines.write() {
            engines.entry(engine.to_string()).or_insert(EngineHealth {
                name: engine.to_string(),
                status: EngineState::Stopped,
                last_heartbeat: None,
                restart_count: 0,
                last_error: None,
            });
        }
    }

    /// Record a heartbeat at `now`. Heartbeats are monotonic: an older
    /// timestamp never rewinds the recorded one.
    pub fn record_heartbeat_at(&self, engine: &str, now: DateTime<Utc>) {
        if let Ok(mut engines) = self.engines.write() {
            let health = engines.entry(engine.to_string()).or_insert(EngineHealth {
                name: engine.to_string(),
                status: EngineState::Running,
                last_heartbeat: None,
                restart_count: 0,
                last_error: None,
            });
            if health.last_heartbeat.map_or(true, |last| now > last) {
                health.last_heartbeat = Some(now);
            }
            health.status = EngineState::Running;
        }
    }

    pub fn record_heartbeat(&self, engine: &str) {
        self.record_heartbeat_at(engine, Utc::now());
    }

    pub fn record_start(&self, engine: &str, now: DateTime<Utc>) {
        if let Ok(mut engines) = self.engines.write() {
            if let Some(health) = engines.get_mut(engine) {
                health.status = EngineState::Running;
                health.last_heartbeat = Some(now);
                health.last_error = None;
            }
        }
    }

    pub fn record_stop(&self, engine: &str) {
        if let Ok(mut engines) = self.engines.write() {
            if let Some(health) = engines.get_mut(engine) {
                health.status = EngineState::Stopped;
            }
        }
    }

    pub fn record_error(&self, engine: &str, message: &str) {
        if let Ok(mut engines) = self.engines.write() {
            if let Some(health) = engines.get_mut(engine) {
                health.status = EngineState::Error;
                health.last_error = Some(message.to_string());
            }
        }
    }

    pub fn record_restart(&self, engine: &str) {
        if let Ok(mut engines) = self.engines.write() {
            if let Some(health) = engines.get_mut(engine) {
                health.restart_count += 1;
                health.status = EngineState::Restarting;
            }
        }
    }

    pub fn can_restart(&self, engine: &str) -> bool {
        self.engines
            .read()
            .map(|engines| {
                engines
                    .get(engine)
                    .map(|h| h.restart_count < self.config.max_restarts)
                    .unwrap_or(true)
            })
            .unwrap_or(false)
    }

    /// Evaluate every running engine's heartbeat age and emit actions.
    /// Stopped and parked engines are skipped.
    pub fn check(&self, now: DateTime<Utc>) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        let engines = match self.engines.read() {
            Ok(engines) => engines,
            Err(_) => return actions,
        };

        for (name, health) in engines.iter() {
            if matches!(health.status, EngineState::Stopped | EngineState::Error) {
                continue;
            }
            let age_secs = match health.last_heartbeat {
                Some(last) => (now - last).num_seconds(),
                None => continue,
            };

            if age_secs >= self.config.restart_secs {
                if health.restart_count < self.config.max_restarts {
                    error!(
                        engine = %name,
                        age_secs,
                        "🚨 No heartbeat, restart needed"
                    );
                    actions.push(HealthAction::Restart {
                        engine: name.clone(),
                    });
                } else {
                    error!(
                        engine = %name,
                        restarts = health.restart_count,
                        "Restart budget exhausted, parking engine"
                    );
                    actions.push(HealthAction::Park {
                        engine: name.clone(),
                    });
                }
            } else if age_secs >= self.config.warn_secs {
                warn!(engine = %name, age_secs, "⚠️ Heartbeat is stale");
                actions.push(HealthAction::Warn {
                    engine: name.clone(),
                    age_secs,
                });
            }
        }
        actions
    }

    pub fn health_of(&self, engine: &str) -> Option<EngineHealth> {
        self.engines
            .read()
            .ok()
            .and_then(|engines| engines.get(engine).cloned())
    }

    /// name → status string, for the status snapshot
    pub fn summary(&self) -> HashMap<String, String> {
        self.engines
            .read()
            .map(|engines| {
                engines
                    .iter()
                    .map(|(name, health)| (name.clone(), health.status.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            warn_secs: 60,
            restart_secs: 300,
            max_restarts: 3,
        })
    }

    #[test]
    fn test_fresh_heartbeat_no_actions() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.register("futures");
        monitor.record_start("futures", now);
        monitor.record_heartbeat_at("futures", now);
        assert!(monitor.check(now + Duration::seconds(30)).is_empty());
    }

    #[test]
    fn test_warn_then_restart_thresholds() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.register("futures");
        monitor.record_start("futures", now);
        monitor.record_heartbeat_at("futures", now);

        let actions = monitor.check(now + Duration::seconds(90));
        assert_eq!(
            actions,
            vec![HealthAction::Warn {
                engine: "futures".into(),
                age_secs: 90
            }]
        );

        let actions = monitor.check(now + Duration::seconds(301));
        assert_eq!(
            actions,
            vec![HealthAction::Restart {
                engine: "futures".into()
            }]
        );
    }

    #[test]
    fn test_restart_budget_parks_engine() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.register("futures");
        monitor.record_start("futures", now);
        monitor.record_heartbeat_at("futures", now);

        for _ in 0..3 {
            monitor.record_restart("futures");
        }
        assert!(!monitor.can_restart("futures"));

        let actions = monitor.check(now + Duration::seconds(400));
        assert_eq!(
            actions,
            vec![HealthAction::Park {
                engine: "futures".into()
            }]
        );

        // Parked engines stop generating actions
        monitor.record_error("futures", "budget exhausted");
        assert!(monitor.check(now + Duration::seconds(500)).is_empty());
    }

    #[test]
    fn test_heartbeats_are_monotonic() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.record_heartbeat_at("futures", now);
        monitor.record_heartbeat_at("futures", now - Duration::seconds(120));

        let health = monitor.health_of("futures").unwrap();
        assert_eq!(health.last_heartbeat, Some(now));
    }

    #[test]
    fn test_stopped_engines_ignored() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.register("spot");
        monitor.record_start("spot", now);
        monitor.record_stop("spot");
        assert!(monitor.check(now + Duration::seconds(1_000)).is_empty());
    }
}
