//! Capacity budgets
//!
//! A budget tracks one resource dimension (GPU memory, system memory,
//! concurrent downloads, concurrent compute jobs) against an optional item
//! limit and an optional byte limit. Admission never pushes usage past either
//! limit; callers that need room must evict first.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CapacityError;

/// The four resource dimensions managed by the queue managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BudgetKind {
    GpuMemory,
    SystemMemory,
    Downloads,
    Compute,
}

impl BudgetKind {
    pub const ALL: [BudgetKind; 4] = [
        BudgetKind::GpuMemory,
        BudgetKind::SystemMemory,
        BudgetKind::Downloads,
        BudgetKind::Compute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetKind::GpuMemory => "gpu_memory",
            BudgetKind::SystemMemory => "system_memory",
            BudgetKind::Downloads => "concurrent_downloads",
            BudgetKind::Compute => "concurrent_compute",
        }
    }
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item and byte limits of one budget; `None` means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapacityLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<usize>,
}

impl CapacityLimits {
    pub fn new(item_limit: Option<usize>, size_limit: Option<usize>) -> Self {
        Self { item_limit, size_limit }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Limit on item count only
    pub fn items(limit: usize) -> Self {
        Self::new(Some(limit), None)
    }

    /// Limit on total bytes only
    pub fn bytes(limit: usize) -> Self {
        Self::new(None, Some(limit))
    }

    /// Reject limits that could never admit anything
    pub fn validate(&self, kind: BudgetKind) -> Result<(), CapacityError> {
        if self.item_limit == Some(0) || self.size_limit == Some(0) {
            return Err(CapacityError::ZeroLimit { budget: kind });
        }
        Ok(())
    }
}

/// Memory pressure level derived from budget utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum MemoryPressure {
    /// Usage is low (< 50% utilization)
    Low,
    /// Usage is moderate (50-75% utilization)
    Moderate,
    /// Usage is high (75-90% utilization)
    High,
    /// Usage is critical (> 90% utilization)
    Critical,
}

impl MemoryPressure {
    /// Get the pressure level from a utilization ratio (0.0 to 1.0)
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

/// Point-in-time view of a budget, for statistics and logging
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub kind: BudgetKind,
    pub limits: CapacityLimits,
    pub item_count: usize,
    pub size_bytes: usize,
    pub utilization: f64,
    pub pressure: MemoryPressure,
}

/// Usage of one resource dimension against its limits
#[derive(Debug, Clone)]
pub struct CapacityBudget {
    kind: BudgetKind,
    limits: CapacityLimits,
    item_count: usize,
    size_bytes: usize,
}

impl CapacityBudget {
    pub fn new(kind: BudgetKind, limits: CapacityLimits) -> Self {
        Self {
            kind,
            limits,
            item_count: 0,
            size_bytes: 0,
        }
    }

    pub fn kind(&self) -> BudgetKind {
        self.kind
    }

    pub fn limits(&self) -> CapacityLimits {
        self.limits
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Replace the limits; usage may now be over capacity until the owner evicts
    pub fn set_limits(&mut self, limits: CapacityLimits) {
        self.limits = limits;
    }

    /// Check that a single item of `size` could ever fit in an empty budget
    pub fn check_item(&self, size: usize) -> Result<(), CapacityError> {
        self.limits.validate(self.kind)?;
        match self.limits.size_limit {
            Some(limit) if size > limit => Err(CapacityError::ItemExceedsSizeLimit {
                budget: self.kind,
                size,
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// True if one more item of `size` bytes stays within both limits
    pub fn fits(&self, size: usize) -> bool {
        let items_ok = self
            .limits
            .item_limit
            .map_or(true, |limit| self.item_count < limit);
        let size_ok = self
            .limits
            .size_limit
            .map_or(true, |limit| self.size_bytes.saturating_add(size) <= limit);
        items_ok && size_ok
    }

    /// Admit an item if it fits; returns false (and changes nothing) otherwise
    pub fn try_admit(&mut self, size: usize) -> bool {
        if !self.fits(size) {
            return false;
        }
        self.item_count += 1;
        self.size_bytes += size;
        true
    }

    /// Release an item previously admitted with the same size
    pub fn release(&mut self, size: usize) {
        debug_assert!(self.item_count > 0, "release on empty {} budget", self.kind);
        debug_assert!(self.size_bytes >= size, "release larger than usage in {}", self.kind);
        self.item_count = self.item_count.saturating_sub(1);
        self.size_bytes = self.size_bytes.saturating_sub(size);
    }

    /// True if usage exceeds either limit (possible only after `set_limits`)
    pub fn is_over_capacity(&self) -> bool {
        self.limits.item_limit.map_or(false, |l| self.item_count > l)
            || self.limits.size_limit.map_or(false, |l| self.size_bytes > l)
    }

    /// True if no further item of any size can be admitted
    pub fn is_saturated(&self) -> bool {
        !self.fits(0)
    }

    /// Fraction of the tighter limit in use; 0.0 for unbounded budgets
    pub fn utilization(&self) -> f64 {
        let items = self
            .limits
            .item_limit
            .map_or(0.0, |l| ratio(self.item_count, l));
        let bytes = self
            .limits
            .size_limit
            .map_or(0.0, |l| ratio(self.size_bytes, l));
        items.max(bytes)
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            kind: self.kind,
            limits: self.limits,
            item_count: self.item_count,
            size_bytes: self.size_bytes,
            utilization: self.utilization(),
            pressure: self.pressure(),
        }
    }
}

fn ratio(used: usize, limit: usize) -> f64 {
    if limit == 0 {
        1.0
    } else {
        used as f64 / limit as f64
    }
}
