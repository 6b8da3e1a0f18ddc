//! Capital allocator
//!
//! Splits portfolio capital across engines and tracks per-engine
//! exposure. Validation fails startup when enabled engines claim more
//! than 100%; a disabled engine's share is redistributed proportionally
//! so the enabled set still totals 100%.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// Capital allocation for a single engine
#[derive(Debug, Clone)]
pub struct CapitalAllocation {
    pub engine_name: String,
    pub allocated_pct: f64,
    pub allocated_usd: f64,
    pub current_exposure_usd: f64,
    pub available_usd: f64,
}

/// One engine's configured share
#[derive(Debug, Clone)]
pub struct EngineShare {
    pub name: String,
    pub enabled: bool,
    pub capital_pct: f64,
}

pub struct CapitalAllocator {
    shares: Vec<EngineShare>,
    exposure: RwLock<HashMap<String, f64>>,
}

impl CapitalAllocator {
    /// Build and validate. Fails when enabled shares sum above 100%.
    pub fn new(shares: Vec<EngineShare>) -> Result<Self> {
        let total: f64 = shares
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.capital_pct)
            .sum();
        if total > 100.0 {
            bail!(
                "Allocation overflow: enabled engines claim {total:.1}% of capital (max 100%)"
            );
        }
        for share in &shares {
            if share.capital_pct < 0.0 {
                bail!("Engine {} has negative capital_pct", share.name);
            }
        }
        Ok(Self {
            shares,
            exposure: RwLock::new(HashMap::new()),
        })
    }

    /// Effective share after redistributing disabled engines' capital
    /// proportionally across the enabled set.
    fn effective_pct(&self, engine: &str) -> f64 {
        let enabled_total: f64 = self
            .shares
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.capital_pct)
            .sum();
        if enabled_total <= 0.0 {
            return 0.0;
        }

        self.shares
            .iter()
            .find(|s| s.name == engine && s.enabled)
            .map(|s| s.capital_pct / enabled_total * 100.0)
            .unwrap_or(0.0)
    }

    /// Allocation snapshot for one engine at the given portfolio value
    pub fn allocation_for(&self, engine: &str, portfolio_value: f64) -> CapitalAllocation {
        let pct = self.effective_pct(engine);
        let allocated_usd = portfolio_value * pct / 100.0;
        let current_exposure = self
            .exposure
            .read()
            .map(|e| e.get(engine).copied().unwrap_or(0.0))
            .unwrap_or(0.0);

        CapitalAllocation {
            engine_name: engine.to_string(),
            allocated_pct: pct,
            allocated_usd,
            current_exposure_usd: current_exposure,
            available_usd: (allocated_usd - current_exposure).max(0.0),
        }
    }

    /// Apply an exposure delta (positive on entry, negative on exit)
    pub fn record_exposure_change(&self, engine: &str, delta_usd: f64) {
        if let Ok(mut exposure) = self.exposure.write() {
            let entry = exposure.entry(engine.to_string()).or_insert(0.0);
            *entry = (*entry + delta_usd).max(0.0);
        }
    }

    /// Overwrite an engine's exposure with the engine's own accounting
    pub fn set_exposure(&self, engine: &str, exposure_usd: f64) {
        if let Ok(mut exposure) = self.exposure.write() {
            exposure.insert(engine.to_string(), exposure_usd.max(0.0));
        }
    }

    pub fn total_exposure(&self) -> f64 {
        self.exposure
            .read()
            .map(|e| e.values().sum())
            .unwrap_or(0.0)
    }

    /// Names of enabled engines, in configured order
    pub fn enabled_engines(&self) -> Vec<String> {
        self.shares
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(name: &str, enabled: bool, pct: f64) -> EngineShare {
        EngineShare {
            name: name.into(),
            enabled,
            capital_pct: pct,
        }
    }

    #[test]
    fn test_overflow_rejected() {
        let err = CapitalAllocator::new(vec![
            share("spot", true, 60.0),
            share("futures", true, 50.0),
        ])
        .err()
        .unwrap();
        assert!(err.to_string().contains("Allocation overflow"));
    }

    #[test]
    fn test_disabled_engines_do_not_count() {
        assert!(CapitalAllocator::new(vec![
            share("spot", false, 90.0),
            share("futures", true, 100.0),
        ])
        .is_ok());
    }

    #[test]
    fn test_proportional_redistribution() {
        // spot disabled: futures and alpha split its share proportionally
        let allocator = CapitalAllocator::new(vec![
            share("spot", false, 40.0),
            share("futures", true, 45.0),
            share("alpha", true, 15.0),
        ])
        .unwrap();

        let futures = allocator.allocation_for("futures", 10_000.0);
        let alpha = allocator.allocation_for("alpha", 10_000.0);
        // 45/(45+15) = 75%, 15/60 = 25%
        assert!((futures.allocated_pct - 75.0).abs() < 1e-9);
        assert!((alpha.allocated_pct - 25.0).abs() < 1e-9);
        assert!((futures.allocated_usd - 7_500.0).abs() < 1e-9);
        assert!((futures.allocated_pct + alpha.allocated_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_engine_gets_nothing() {
        let allocator = CapitalAllocator::new(vec![
            share("spot", false, 40.0),
            share("futures", true, 60.0),
        ])
        .unwrap();
        let spot = allocator.allocation_for("spot", 10_000.0);
        assert_eq!(spot.allocated_pct, 0.0);
        assert_eq!(spot.allocated_usd, 0.0);
    }

    #[test]
    fn test_exposure_tracking() {
        let allocator = CapitalAllocator::new(vec![share("futures", true, 50.0)]).unwrap();
        allocator.record_exposure_change("futures", 2_000.0);
        allocator.record_exposure_change("futures", 1_000.0);
        allocator.record_exposure_change("futures", -500.0);

        let allocation = allocator.allocation_for("futures", 10_000.0);
        assert!((allocation.current_exposure_usd - 2_500.0).abs() < 1e-9);
        // Single enabled engine takes the full 100% after redistribution
        assert!((allocation.allocated_usd - 10_000.0).abs() < 1e-9);
        assert!((allocation.available_usd - 7_500.0).abs() < 1e-9);

        // Exposure never goes negative
        allocator.record_exposure_change("futures", -10_000.0);
        assert_eq!(allocator.total_exposure(), 0.0);
    }

    #[test]
    fn test_available_floors_at_zero() {
        let allocator = CapitalAllocator::new(vec![share("futures", true, 100.0)]).unwrap();
        allocator.set_exposure("futures", 15_000.0);
        let allocation = allocator.allocation_for("futures", 10_000.0);
        assert_eq!(allocation.available_usd, 0.0);
    }
}
