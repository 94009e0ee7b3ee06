//! Utility modules shared across resgov crates.

pub mod error;
