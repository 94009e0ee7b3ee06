//! # resgov-core
//!
//! Core layer for resgov: the durable group catalog and the shared runtime
//! registry. It depends only on `resgov-common`.
//!
//! ## Modules
//!
//! - [`catalog`] - Durable group definitions, role bindings, snapshot store
//! - [`registry`] - Live per-group counters, wait queues, and grants

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod registry;

// Re-export commonly used types
pub use catalog::{CatalogSnapshot, GroupCatalog, ResourceGroup, SnapshotStore};
pub use registry::{Admission, CancelToken, Grant, GroupStats, RuntimeRegistry, WaiterHandle, Wakeup};
