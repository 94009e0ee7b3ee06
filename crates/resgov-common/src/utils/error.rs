//! Error types for resgov.
//!
//! One taxonomy covers the whole subsystem: catalog/DDL failures are
//! detected before any durable mutation, admission failures abort only the
//! requesting statement. Counter underflow in the runtime registry is not
//! represented here; it panics, since continuing with corrupt accounting is
//! worse than dying.

use std::time::Duration;
use thiserror::Error;

/// Result type alias used throughout resgov.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors surfaced by the resource-group subsystem.
#[derive(Debug, Error)]
pub enum Error {
    /// A capability field is out of its individual bounds.
    #[error("invalid capability: {field} = {value} exceeds maximum {max}")]
    InvalidCapability {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: u64,
        /// The field's upper bound.
        max: u64,
    },

    /// A group with this name already exists.
    #[error("resource group \"{0}\" already exists")]
    DuplicateName(String),

    /// No group with this name or id exists.
    #[error("resource group \"{0}\" does not exist")]
    UnknownGroup(String),

    /// The default group cannot be dropped.
    #[error("cannot drop the default resource group")]
    CannotDropDefault,

    /// Drop blocked by live slot holders; the caller may retry.
    #[error("resource group \"{name}\" is in use ({slots_in_use} slots held)")]
    GroupInUse {
        /// Name of the busy group.
        name: String,
        /// Slots held at the instant of the attempt.
        slots_in_use: u32,
    },

    /// The bounded admission wait elapsed without a slot becoming available.
    #[error("admission to resource group \"{group}\" timed out after {waited:?}")]
    AdmissionTimeout {
        /// Name of the target group.
        group: String,
        /// Total time spent waiting.
        waited: Duration,
    },

    /// A blocked admission request was cancelled by its session or an
    /// external deadline.
    #[error("admission request cancelled")]
    Cancelled,

    /// The mutation would drive the cross-group memory sum over 100.
    #[error("memory limit sum would exceed capacity: requested {requested}%, {available}% available")]
    CapacityExceeded {
        /// Percentage the candidate group asked for.
        requested: u8,
        /// Percentage still unclaimed across all groups.
        available: u8,
    },

    /// Filesystem failure while persisting or loading the catalog snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot encode/decode failure.
    #[error("snapshot codec error: {0}")]
    Snapshot(String),
}

impl Error {
    /// Returns true for conditions the caller may meaningfully retry
    /// (nothing is retried inside the subsystem itself).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GroupInUse { .. } | Self::AdmissionTimeout { .. })
    }
}
