//! # resgov-engine
//!
//! The main entry point for resgov: governor lifecycle, admission control,
//! resource-group DDL, and session management.
//!
//! ## Modules
//!
//! - [`governor`] - ResourceGovernor struct and lifecycle management
//! - [`session`] - Session management and the end-of-transaction hook
//! - [`config`] - Configuration options
//! - [`admission`] - Blocking slot acquisition with timeout and cancellation
//! - [`ddl`] - Resource-group DDL statements and their executor

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod config;
pub mod ddl;
pub mod governor;
pub mod session;

pub use admission::AdmissionController;
pub use config::Config;
pub use ddl::{
    AlterResourceGroupStmt, AlterRoleGroupStmt, CreateResourceGroupStmt, DdlExecutor,
    DropResourceGroupStmt, GroupTarget,
};
pub use governor::ResourceGovernor;
pub use session::Session;
