//! Governor configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use resgov_common::types::CapabilitySet;

/// Configuration for a [`ResourceGovernor`](crate::ResourceGovernor).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the catalog snapshot; `None` keeps the catalog in
    /// memory only.
    pub path: Option<PathBuf>,
    /// Bound on how long one admission request may wait for a slot.
    /// `None` waits indefinitely (cancellation still applies).
    pub admission_timeout: Option<Duration>,
    /// Engine-wide memory that group percentages are shares of.
    pub total_memory_bytes: u64,
    /// Capabilities the default group is created with.
    pub default_group_caps: CapabilitySet,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            admission_timeout: Some(Duration::from_secs(30)),
            // 4 GiB unless the host engine says otherwise.
            total_memory_bytes: 4 * 1024 * 1024 * 1024,
            default_group_caps: CapabilitySet::default(),
        }
    }
}

impl Config {
    /// In-memory configuration: no snapshot persistence.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Persistent configuration rooted at `path`.
    #[must_use]
    pub fn persistent(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Sets the admission wait bound.
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Sets the engine-wide memory total.
    #[must_use]
    pub fn with_total_memory(mut self, bytes: u64) -> Self {
        self.total_memory_bytes = bytes;
        self
    }

    /// Sets the default group's capabilities.
    #[must_use]
    pub fn with_default_group_caps(mut self, caps: CapabilitySet) -> Self {
        self.default_group_caps = caps;
        self
    }
}
