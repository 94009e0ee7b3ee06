//! Resource-group DDL: statements and their executor.
//!
//! Statement structs mirror what the external SQL parser produces; this
//! module neither parses nor prints SQL. Every mutation validates against
//! the catalog before any durable write, then propagates to the runtime
//! registry. Snapshot persistence failures after a committed catalog
//! mutation are logged, not surfaced; the in-memory catalog is
//! authoritative and the next successful DDL rewrites the whole snapshot.

use std::sync::Arc;

use resgov_common::types::{CapabilityOptions, CapabilitySet, GroupId, LockMode, RoleId};
use resgov_common::utils::error::{Error, Result};
use resgov_core::catalog::{GroupCatalog, SnapshotStore};
use resgov_core::registry::RuntimeRegistry;

/// How a statement names its target group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupTarget {
    /// By stable id.
    ById(GroupId),
    /// By name.
    ByName(String),
}

impl From<GroupId> for GroupTarget {
    fn from(id: GroupId) -> Self {
        Self::ById(id)
    }
}

impl From<&str> for GroupTarget {
    fn from(name: &str) -> Self {
        Self::ByName(name.to_string())
    }
}

/// `CREATE RESOURCE GROUP name WITH (...)`.
#[derive(Debug, Clone)]
pub struct CreateResourceGroupStmt {
    /// Name of the new group.
    pub name: String,
    /// Capability fields given in the statement; absent fields take
    /// defaults.
    pub options: CapabilityOptions,
}

/// `ALTER RESOURCE GROUP target SET (...)`.
#[derive(Debug, Clone)]
pub struct AlterResourceGroupStmt {
    /// The group to alter.
    pub target: GroupTarget,
    /// Fields to change; absent fields keep their current values.
    pub options: CapabilityOptions,
}

/// `DROP RESOURCE GROUP target`.
#[derive(Debug, Clone)]
pub struct DropResourceGroupStmt {
    /// The group to drop.
    pub target: GroupTarget,
}

/// `ALTER ROLE role RESOURCE GROUP group` (or `NONE` to reset).
#[derive(Debug, Clone)]
pub struct AlterRoleGroupStmt {
    /// The role whose binding changes.
    pub role: RoleId,
    /// Group to bind to, or `None` to fall back to the default group.
    pub group: Option<GroupTarget>,
}

/// Executes resource-group DDL against the catalog and registry.
#[derive(Debug)]
pub struct DdlExecutor {
    catalog: Arc<GroupCatalog>,
    registry: Arc<RuntimeRegistry>,
    store: Option<SnapshotStore>,
}

impl DdlExecutor {
    /// Creates an executor; `store` enables snapshot persistence after each
    /// successful mutation.
    #[must_use]
    pub fn new(
        catalog: Arc<GroupCatalog>,
        registry: Arc<RuntimeRegistry>,
        store: Option<SnapshotStore>,
    ) -> Self {
        Self {
            catalog,
            registry,
            store,
        }
    }

    /// Creates a group and materializes its live entry.
    ///
    /// If materialization were to be skipped (for instance a crash between
    /// catalog commit and registry update on a restarted peer), the group
    /// self-heals: admission lazily materializes from the catalog row on
    /// first use.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapability`], [`Error::CapacityExceeded`], or
    /// [`Error::DuplicateName`].
    pub fn create(&self, stmt: &CreateResourceGroupStmt) -> Result<GroupId> {
        let caps = stmt.options.apply_to(CapabilitySet::default());
        let id = self.catalog.create(&stmt.name, caps)?;
        self.persist();
        self.registry.materialize(id, caps);
        tracing::info!(group = %id, name = %stmt.name, "CREATE RESOURCE GROUP");
        Ok(id)
    }

    /// Alters a group's capabilities and updates its live limits in place.
    ///
    /// Existing grants are never revoked; a lowered concurrency limit takes
    /// effect as slots free.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`], [`Error::InvalidCapability`], or
    /// [`Error::CapacityExceeded`].
    pub fn alter(&self, stmt: &AlterResourceGroupStmt) -> Result<GroupId> {
        let id = self.resolve(&stmt.target, LockMode::Exclusive)?;
        let current = self.catalog.capabilities(id)?;
        let caps = stmt.options.apply_to(current);
        self.catalog.alter(id, caps)?;
        self.persist();
        self.registry.materialize(id, caps);
        tracing::info!(group = %id, "ALTER RESOURCE GROUP");
        Ok(id)
    }

    /// Drops a group.
    ///
    /// The runtime entry is retired and the catalog row removed under one
    /// catalog write lock, so a [`Error::GroupInUse`] failure leaves no
    /// partial state and a concurrent lazy materialization cannot slip in
    /// between the two and resurrect the group. `GroupInUse` is reported
    /// for the caller to retry; nothing retries here.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`], [`Error::CannotDropDefault`], or
    /// [`Error::GroupInUse`].
    pub fn drop_group(&self, stmt: &DropResourceGroupStmt) -> Result<()> {
        let id = self.resolve(&stmt.target, LockMode::Exclusive)?;
        let group = self
            .catalog
            .drop_group_with(id, |group| self.registry.retire(group.id, &group.name))?;
        self.persist();
        tracing::info!(group = %id, name = %group.name, "DROP RESOURCE GROUP");
        Ok(())
    }

    /// Binds a role to a group, or resets it to the default group.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] if the target group does not exist.
    pub fn alter_role(&self, stmt: &AlterRoleGroupStmt) -> Result<()> {
        match &stmt.group {
            Some(target) => {
                let id = self.resolve(target, LockMode::Exclusive)?;
                self.catalog.bind_role(stmt.role, id)?;
            }
            None => self.catalog.unbind_role(stmt.role),
        }
        self.persist();
        tracing::info!(role = %stmt.role, "ALTER ROLE ... RESOURCE GROUP");
        Ok(())
    }

    fn resolve(&self, target: &GroupTarget, mode: LockMode) -> Result<GroupId> {
        match target {
            GroupTarget::ById(id) => {
                // Resolving the name validates existence under the lock.
                self.catalog.group_name_for_id(*id, mode)?;
                Ok(*id)
            }
            GroupTarget::ByName(name) => self.catalog.group_id_for_name(name, mode),
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.catalog.snapshot()) {
                tracing::warn!("failed to persist catalog snapshot: {e}");
            }
        }
    }
}
