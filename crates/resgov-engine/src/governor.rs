//! Governor lifecycle: open, recover, and serve sessions.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use resgov_common::types::{CapabilitySet, GroupId, LockMode, RoleId, SessionId};
use resgov_common::utils::error::Result;
use resgov_core::catalog::{GroupCatalog, ResourceGroup, SnapshotStore};
use resgov_core::registry::{GroupStats, RuntimeRegistry};

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::ddl::{
    AlterResourceGroupStmt, AlterRoleGroupStmt, CreateResourceGroupStmt, DdlExecutor,
    DropResourceGroupStmt,
};
use crate::session::Session;

/// The top-level handle: catalog, live registry, admission, and DDL behind
/// one facade.
///
/// A governor is shared across threads behind an `Arc` (or by reference);
/// all methods take `&self`. Sessions hand out the per-worker mutable
/// surface.
#[derive(Debug)]
pub struct ResourceGovernor {
    catalog: Arc<GroupCatalog>,
    registry: Arc<RuntimeRegistry>,
    admission: Arc<AdmissionController>,
    ddl: DdlExecutor,
    next_session_id: AtomicU64,
}

impl ResourceGovernor {
    /// Creates an in-memory governor with default configuration. Intended
    /// for tests and embedding.
    ///
    /// # Panics
    ///
    /// Panics if the default configuration is rejected, which cannot happen.
    #[must_use]
    pub fn new_in_memory() -> Self {
        Self::with_config(Config::in_memory()).expect("default config is valid")
    }

    /// Opens (or initializes) a persistent governor at the given snapshot
    /// path.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read or decoded, or the
    /// path's parent directory cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(Config::persistent(path))
    }

    /// Builds a governor from explicit configuration.
    ///
    /// With a snapshot path set, an existing snapshot is loaded and the
    /// catalog rebuilt from it; otherwise a fresh catalog (default group
    /// only) is created and written out. Live counters always start at
    /// zero: slots and memory reservations do not survive a restart, only
    /// group definitions and role bindings do.
    ///
    /// # Errors
    ///
    /// Returns an error on snapshot I/O or decode failure, or if the
    /// configured default-group capabilities are invalid.
    pub fn with_config(config: Config) -> Result<Self> {
        let (catalog, store) = match &config.path {
            Some(path) => {
                let store = SnapshotStore::new(path)?;
                let catalog = if store.exists() {
                    let snapshot = store.load()?;
                    tracing::info!(
                        path = %path.display(),
                        groups = snapshot.groups.len(),
                        "recovered catalog from snapshot"
                    );
                    GroupCatalog::from_snapshot(snapshot)?
                } else {
                    let catalog = GroupCatalog::new(config.default_group_caps)?;
                    store.save(&catalog.snapshot())?;
                    catalog
                };
                (Arc::new(catalog), Some(store))
            }
            None => (
                Arc::new(GroupCatalog::new(config.default_group_caps)?),
                None,
            ),
        };

        let registry = Arc::new(RuntimeRegistry::new(config.total_memory_bytes));
        for group in catalog.list() {
            registry.materialize(group.id, group.caps);
        }

        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            &config,
        ));
        let ddl = DdlExecutor::new(Arc::clone(&catalog), Arc::clone(&registry), store);

        Ok(Self {
            catalog,
            registry,
            admission,
            ddl,
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Opens a new session running as `role`. Session ids are unique for
    /// the lifetime of this governor.
    #[must_use]
    pub fn session(&self, role: RoleId) -> Session {
        let id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        Session::new(id, role, Arc::clone(&self.admission))
    }

    /// Executes `CREATE RESOURCE GROUP`, returning the new group's id.
    ///
    /// # Errors
    ///
    /// See [`DdlExecutor::create`].
    pub fn execute_create(&self, stmt: &CreateResourceGroupStmt) -> Result<GroupId> {
        self.ddl.create(stmt)
    }

    /// Executes `ALTER RESOURCE GROUP`, returning the altered group's id.
    ///
    /// # Errors
    ///
    /// See [`DdlExecutor::alter`].
    pub fn execute_alter(&self, stmt: &AlterResourceGroupStmt) -> Result<GroupId> {
        self.ddl.alter(stmt)
    }

    /// Executes `DROP RESOURCE GROUP`.
    ///
    /// # Errors
    ///
    /// See [`DdlExecutor::drop_group`].
    pub fn execute_drop(&self, stmt: &DropResourceGroupStmt) -> Result<()> {
        self.ddl.drop_group(stmt)
    }

    /// Executes `ALTER ROLE ... RESOURCE GROUP`.
    ///
    /// # Errors
    ///
    /// See [`DdlExecutor::alter_role`].
    pub fn execute_alter_role(&self, stmt: &AlterRoleGroupStmt) -> Result<()> {
        self.ddl.alter_role(stmt)
    }

    /// The built-in default group's id.
    #[must_use]
    pub fn default_group_id(&self) -> GroupId {
        self.catalog.default_group_id()
    }

    /// Resolves a group name to its id.
    ///
    /// # Errors
    ///
    /// [`resgov_common::Error::UnknownGroup`] if no group has that name.
    pub fn group_id_for_name(&self, name: &str, mode: LockMode) -> Result<GroupId> {
        self.catalog.group_id_for_name(name, mode)
    }

    /// Resolves a group id to its name.
    ///
    /// # Errors
    ///
    /// [`resgov_common::Error::UnknownGroup`] if the id is not in the
    /// catalog.
    pub fn group_name_for_id(&self, id: GroupId, mode: LockMode) -> Result<String> {
        self.catalog.group_name_for_id(id, mode)
    }

    /// The group a role resolves to: its explicit binding, or the default
    /// group.
    #[must_use]
    pub fn group_id_for_role(&self, role: RoleId) -> GroupId {
        self.catalog.group_id_for_role(role)
    }

    /// A group's current capability settings.
    ///
    /// # Errors
    ///
    /// [`resgov_common::Error::UnknownGroup`] if the id is not in the
    /// catalog.
    pub fn group_capabilities(&self, id: GroupId) -> Result<CapabilitySet> {
        self.catalog.capabilities(id)
    }

    /// All groups in creation order.
    #[must_use]
    pub fn list_groups(&self) -> Vec<ResourceGroup> {
        self.catalog.list()
    }

    /// Live counters for one group, or `None` if it has no registry entry.
    #[must_use]
    pub fn group_stats(&self, id: GroupId) -> Option<GroupStats> {
        self.registry.group_stats(id)
    }
}
