//! Byte budget tracking for bounded cache usage
//!
//! The cache manager keeps one [`MemoryBudget`] for resident tile buffers and
//! one for cache files on disk. A budget only counts bytes; deciding what to
//! evict when an allocation does not fit is left to the manager.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Pressure level of a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum MemoryPressure {
    /// Usage below 50% of the budget
    Low,
    /// Usage between 50% and 75%
    Moderate,
    /// Usage between 75% and 90%
    High,
    /// Usage above 90%
    Critical,
}

impl MemoryPressure {
    /// Pressure level for a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }
}

/// Thresholds of a byte budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudgetConfig {
    /// Total budget in bytes
    pub total_budget: usize,
    /// Fraction of the budget eviction aims to get below
    pub target_utilization: f64,
}

impl Default for MemoryBudgetConfig {
    fn default() -> Self {
        Self {
            total_budget: 512 * 1024 * 1024,
            target_utilization: 0.5,
        }
    }
}

impl MemoryBudgetConfig {
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            ..Default::default()
        }
    }

    /// Set the target utilization after eviction (0.0 to 1.0)
    pub fn with_target_utilization(mut self, target: f64) -> Self {
        self.target_utilization = target.clamp(0.0, 1.0);
        self
    }
}

/// Atomic byte counter with a limit
///
/// The limit itself is atomic too, so a shared budget can be reset or
/// disabled at runtime.
#[derive(Debug)]
pub struct MemoryBudget {
    total_budget: AtomicUsize,
    /// Target utilization in per mille
    target_permille: AtomicUsize,
    current_usage: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(config: MemoryBudgetConfig) -> Self {
        Self {
            total_budget: AtomicUsize::new(config.total_budget),
            target_permille: AtomicUsize::new(to_permille(config.target_utilization)),
            current_usage: AtomicUsize::new(0),
        }
    }

    /// Budget with a limit in bytes and the default target
    pub fn with_limit(total_budget: usize) -> Self {
        Self::new(MemoryBudgetConfig::new(total_budget))
    }

    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Acquire)
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget.load(Ordering::Acquire)
    }

    pub fn target_utilization(&self) -> f64 {
        self.target_permille.load(Ordering::Acquire) as f64 / 1000.0
    }

    /// Bytes eviction aims to get below
    pub fn target_bytes(&self) -> usize {
        (self.total_budget() as f64 * self.target_utilization()) as usize
    }

    /// Current utilization ratio (0.0 to 1.0 unless over budget)
    pub fn utilization(&self) -> f64 {
        let total = self.total_budget();
        if total == 0 {
            0.0
        } else {
            self.current_usage() as f64 / total as f64
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    /// Whether `bytes` more would still fit in the budget
    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.current_usage().saturating_add(bytes) <= self.total_budget()
    }

    /// Whether `used + bytes` is below the eviction target
    pub fn is_below_target(&self, bytes: usize) -> bool {
        self.current_usage().saturating_add(bytes) < self.target_bytes()
    }

    pub fn record_allocation(&self, bytes: usize) {
        self.current_usage.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Record released bytes, saturating at zero
    pub fn record_deallocation(&self, bytes: usize) {
        self.current_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }

    /// Overwrite the usage counter, used after recounting
    pub fn set_usage(&self, bytes: usize) {
        self.current_usage.store(bytes, Ordering::Release);
    }

    pub fn set_total_budget(&self, bytes: usize) {
        self.total_budget.store(bytes, Ordering::Release);
    }

    pub fn set_target_utilization(&self, target: f64) {
        self.target_permille
            .store(to_permille(target), Ordering::Release);
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::new(MemoryBudgetConfig::default())
    }
}

fn to_permille(fraction: f64) -> usize {
    (fraction.clamp(0.0, 1.0) * 1000.0).round() as usize
}
