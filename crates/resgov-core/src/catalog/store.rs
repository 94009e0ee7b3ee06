//! Snapshot persistence for the group catalog.
//!
//! One file holds the whole catalog: every group row, every role binding,
//! and the id allocator position. Writes go through a temp file and an
//! atomic rename, so a crash mid-write leaves the previous snapshot intact.
//! The surrounding engine's transaction visibility rules are not modeled
//! here; the snapshot is written after each committed DDL mutation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use resgov_common::types::{GroupId, RoleId};
use resgov_common::utils::error::{Error, Result};
use resgov_common::CapabilitySet;

use super::ResourceGroup;

/// Serialized form of the entire catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// All group rows, in creation order.
    pub groups: Vec<ResourceGroup>,
    /// All explicit role bindings.
    pub bindings: Vec<(RoleId, GroupId)>,
    /// Next id to assign; preserved so dropped ids are never reused.
    pub next_id: u32,
}

impl CatalogSnapshot {
    /// A minimal snapshot holding only a default group.
    #[must_use]
    pub fn initial(default_caps: CapabilitySet) -> Self {
        Self {
            groups: vec![ResourceGroup {
                id: GroupId::new(1),
                name: super::DEFAULT_GROUP_NAME.to_string(),
                caps: default_caps,
            }],
            bindings: Vec::new(),
            next_id: 2,
        }
    }
}

/// File-backed store for [`CatalogSnapshot`]s.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Creates a store writing to the given file, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Whether a snapshot file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes a snapshot atomically (temp file + rename).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Snapshot`] on encoding failure or [`Error::Io`] on
    /// filesystem failure.
    pub fn save(&self, snapshot: &CatalogSnapshot) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| Error::Snapshot(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), groups = snapshot.groups.len(), "saved catalog snapshot");
        Ok(())
    }

    /// Reads the snapshot back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read or
    /// [`Error::Snapshot`] if it does not decode.
    pub fn load(&self) -> Result<CatalogSnapshot> {
        let bytes = fs::read(&self.path)?;
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| Error::Snapshot(e.to_string()))?;
        Ok(snapshot)
    }
}
