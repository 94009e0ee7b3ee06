//! # resgov-common
//!
//! Foundation layer for resgov: identifier types, capability sets, and
//! error definitions.
//!
//! This crate provides the fundamental building blocks used by all other
//! resgov crates. It has no internal dependencies and should be kept minimal.
//!
//! ## Modules
//!
//! - [`types`] - Core type definitions (GroupId, RoleId, CapabilitySet, etc.)
//! - [`utils`] - Utility functions and helpers (errors)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod types;
pub mod utils;

// Re-export commonly used types at crate root
pub use types::{CapabilityOptions, CapabilitySet, GroupId, LockMode, RoleId, SessionId};
pub use utils::error::{Error, Result};
