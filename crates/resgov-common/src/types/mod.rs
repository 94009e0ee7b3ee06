//! Core type definitions for resgov.
//!
//! This module contains all fundamental types used throughout the subsystem:
//! - Identifier types ([`GroupId`], [`RoleId`], [`SessionId`])
//! - Capability types ([`CapabilitySet`], [`CapabilityOptions`])
//! - Catalog lock selection ([`LockMode`])

mod caps;
mod id;
mod lock;

pub use caps::{CapabilityOptions, CapabilitySet, MAX_CONCURRENCY, MAX_PERCENT};
pub use id::{GroupId, RoleId, SessionId};
pub use lock::LockMode;
