//! Capability sets: per-group capacity limits.

use crate::utils::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper bound for every percentage-valued capability field, and for the
/// cross-group sum of `memory_limit_pct`.
pub const MAX_PERCENT: u8 = 100;

/// Upper bound for `concurrency_limit`. Generously above anything a real
/// deployment configures; mainly guards against nonsense input.
pub const MAX_CONCURRENCY: u32 = 1 << 20;

/// Immutable value type describing one group's limits.
///
/// Per-field bounds are checked by [`CapabilitySet::validate`]; the
/// cross-group invariant (sum of `memory_limit_pct` over all groups is at
/// most 100) is enforced by the catalog at DDL time, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// Maximum concurrent slots; 0 means unlimited.
    pub concurrency_limit: u32,
    /// Share of total memory, in percent. 0 disables memory accounting
    /// for the group.
    pub memory_limit_pct: u8,
    /// CPU share, in percent. Validated and stored; scheduling is the
    /// host engine's concern.
    pub cpu_rate_pct: u8,
    /// Portion of the group's memory usable as shared quota, in percent.
    pub memory_shared_quota_pct: u8,
    /// Spill threshold as a percentage of per-query memory.
    pub memory_spill_ratio: u8,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            concurrency_limit: 0,
            memory_limit_pct: 0,
            cpu_rate_pct: 0,
            memory_shared_quota_pct: 80,
            memory_spill_ratio: 0,
        }
    }
}

impl CapabilitySet {
    /// Checks every field against its individual bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit > MAX_CONCURRENCY {
            return Err(Error::InvalidCapability {
                field: "concurrency_limit",
                value: u64::from(self.concurrency_limit),
                max: u64::from(MAX_CONCURRENCY),
            });
        }
        for (field, value) in [
            ("memory_limit_pct", self.memory_limit_pct),
            ("cpu_rate_pct", self.cpu_rate_pct),
            ("memory_shared_quota_pct", self.memory_shared_quota_pct),
            ("memory_spill_ratio", self.memory_spill_ratio),
        ] {
            if value > MAX_PERCENT {
                return Err(Error::InvalidCapability {
                    field,
                    value: u64::from(value),
                    max: u64::from(MAX_PERCENT),
                });
            }
        }
        Ok(())
    }

    /// Derives the group's absolute memory budget from the engine-wide total.
    ///
    /// Returns `None` when `memory_limit_pct` is 0 (accounting disabled).
    #[must_use]
    pub fn memory_budget(&self, total_memory_bytes: u64) -> Option<u64> {
        if self.memory_limit_pct == 0 {
            None
        } else {
            Some(total_memory_bytes / 100 * u64::from(self.memory_limit_pct))
        }
    }
}

/// Per-field overrides carried by DDL statements.
///
/// `CREATE` applies them over [`CapabilitySet::default`]; `ALTER` merges
/// them over the group's current capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityOptions {
    /// New concurrency limit, if given.
    pub concurrency_limit: Option<u32>,
    /// New memory share, if given.
    pub memory_limit_pct: Option<u8>,
    /// New CPU share, if given.
    pub cpu_rate_pct: Option<u8>,
    /// New shared quota, if given.
    pub memory_shared_quota_pct: Option<u8>,
    /// New spill ratio, if given.
    pub memory_spill_ratio: Option<u8>,
}

impl CapabilityOptions {
    /// Applies the given fields over `base`, leaving absent fields as-is.
    #[must_use]
    pub fn apply_to(&self, base: CapabilitySet) -> CapabilitySet {
        CapabilitySet {
            concurrency_limit: self.concurrency_limit.unwrap_or(base.concurrency_limit),
            memory_limit_pct: self.memory_limit_pct.unwrap_or(base.memory_limit_pct),
            cpu_rate_pct: self.cpu_rate_pct.unwrap_or(base.cpu_rate_pct),
            memory_shared_quota_pct: self
                .memory_shared_quota_pct
                .unwrap_or(base.memory_shared_quota_pct),
            memory_spill_ratio: self.memory_spill_ratio.unwrap_or(base.memory_spill_ratio),
        }
    }

    /// Returns true if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
