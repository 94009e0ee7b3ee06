//! The durable group catalog.
//!
//! [`GroupCatalog`] is the source of truth for group definitions and role
//! bindings, mutated only through DDL. All state sits behind a single
//! `RwLock`: DDL is rare, so coarse catalog locking is deliberate. The
//! hot admission path only touches the runtime registry. Holding the write
//! lock across both validation and mutation is what makes the cross-group
//! memory-sum invariant transactional.

mod store;

pub use store::{CatalogSnapshot, SnapshotStore};

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use resgov_common::types::{CapabilitySet, GroupId, LockMode, RoleId, MAX_PERCENT};
use resgov_common::utils::error::{Error, Result};

/// Name of the always-present fallback group.
pub const DEFAULT_GROUP_NAME: &str = "default_group";

/// One durable catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Stable identity, never reused while the group exists.
    pub id: GroupId,
    /// Unique name, immutable post-creation.
    pub name: String,
    /// The group's capacity limits.
    pub caps: CapabilitySet,
}

#[derive(Debug)]
struct CatalogInner {
    /// Groups in creation order; stable iteration keeps the sum check and
    /// listings deterministic.
    groups: IndexMap<GroupId, ResourceGroup>,
    names: HashMap<String, GroupId>,
    bindings: HashMap<RoleId, GroupId>,
    next_id: u32,
}

impl CatalogInner {
    fn memory_pct_sum(&self) -> u32 {
        self.groups
            .values()
            .map(|g| u32::from(g.caps.memory_limit_pct))
            .sum()
    }

    /// Rejects a candidate memory share that would drive the sum over 100.
    /// `exclude` carries the group being altered, whose current share does
    /// not count against the candidate.
    fn check_memory_sum(&self, candidate_pct: u8, exclude: Option<GroupId>) -> Result<()> {
        let mut sum = self.memory_pct_sum();
        if let Some(id) = exclude {
            if let Some(group) = self.groups.get(&id) {
                sum -= u32::from(group.caps.memory_limit_pct);
            }
        }
        if sum + u32::from(candidate_pct) > u32::from(MAX_PERCENT) {
            return Err(Error::CapacityExceeded {
                requested: candidate_pct,
                available: (u32::from(MAX_PERCENT) - sum) as u8,
            });
        }
        Ok(())
    }
}

/// Persistent mapping from group identity to capabilities and role bindings.
///
/// Constructed with the default group already present; the default group
/// resolves unbound roles and cannot be dropped.
#[derive(Debug)]
pub struct GroupCatalog {
    inner: RwLock<CatalogInner>,
    default_id: GroupId,
}

impl GroupCatalog {
    /// Creates a catalog containing only the default group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the default capabilities are
    /// out of bounds.
    pub fn new(default_caps: CapabilitySet) -> Result<Self> {
        default_caps.validate()?;
        let default_id = GroupId::new(1);
        let mut groups = IndexMap::new();
        groups.insert(
            default_id,
            ResourceGroup {
                id: default_id,
                name: DEFAULT_GROUP_NAME.to_string(),
                caps: default_caps,
            },
        );
        let mut names = HashMap::new();
        names.insert(DEFAULT_GROUP_NAME.to_string(), default_id);
        Ok(Self {
            inner: RwLock::new(CatalogInner {
                groups,
                names,
                bindings: HashMap::new(),
                next_id: 2,
            }),
            default_id,
        })
    }

    /// Restores a catalog from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Snapshot`] if the snapshot lacks the default group.
    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Result<Self> {
        let default_id = snapshot
            .groups
            .iter()
            .find(|g| g.name == DEFAULT_GROUP_NAME)
            .map(|g| g.id)
            .ok_or_else(|| Error::Snapshot("snapshot has no default group".to_string()))?;
        let mut groups = IndexMap::new();
        let mut names = HashMap::new();
        for group in snapshot.groups {
            names.insert(group.name.clone(), group.id);
            groups.insert(group.id, group);
        }
        Ok(Self {
            inner: RwLock::new(CatalogInner {
                groups,
                names,
                bindings: snapshot.bindings.into_iter().collect(),
                next_id: snapshot.next_id,
            }),
            default_id,
        })
    }

    /// Captures a consistent snapshot of the whole catalog.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let inner = self.inner.read();
        CatalogSnapshot {
            groups: inner.groups.values().cloned().collect(),
            bindings: inner.bindings.iter().map(|(&r, &g)| (r, g)).collect(),
            next_id: inner.next_id,
        }
    }

    /// Id of the default group.
    #[must_use]
    pub fn default_group_id(&self) -> GroupId {
        self.default_id
    }

    /// Creates a new group.
    ///
    /// Validation order: per-field bounds, then the cross-group memory sum,
    /// then name uniqueness, all under one write lock, before the row is
    /// inserted.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapability`], [`Error::CapacityExceeded`], or
    /// [`Error::DuplicateName`].
    pub fn create(&self, name: &str, caps: CapabilitySet) -> Result<GroupId> {
        caps.validate()?;
        let mut inner = self.inner.write();
        inner.check_memory_sum(caps.memory_limit_pct, None)?;
        if inner.names.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        let id = GroupId::new(inner.next_id);
        inner.next_id += 1;
        inner.names.insert(name.to_string(), id);
        inner.groups.insert(
            id,
            ResourceGroup {
                id,
                name: name.to_string(),
                caps,
            },
        );
        tracing::debug!(group = %id, name, "created resource group");
        Ok(id)
    }

    /// Replaces a group's capabilities, returning the previous set.
    ///
    /// Lowering `concurrency_limit` below the group's live `slots_in_use` is
    /// accepted here; the registry never revokes held grants, so the new
    /// ceiling takes effect as slots free.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`], [`Error::InvalidCapability`], or
    /// [`Error::CapacityExceeded`].
    pub fn alter(&self, id: GroupId, caps: CapabilitySet) -> Result<CapabilitySet> {
        caps.validate()?;
        let mut inner = self.inner.write();
        if !inner.groups.contains_key(&id) {
            return Err(Error::UnknownGroup(id.to_string()));
        }
        inner.check_memory_sum(caps.memory_limit_pct, Some(id))?;
        let group = inner.groups.get_mut(&id).expect("checked above");
        let previous = group.caps;
        group.caps = caps;
        tracing::debug!(group = %id, "altered resource group capabilities");
        Ok(previous)
    }

    /// Removes a group's catalog row, clearing any role bindings to it.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] or [`Error::CannotDropDefault`].
    pub fn drop_group(&self, id: GroupId) -> Result<ResourceGroup> {
        self.drop_group_with(id, |_| Ok(()))
    }

    /// Removes a group's catalog row after `guard` approves it, both under
    /// the catalog write lock.
    ///
    /// `guard` sees the row that is about to go; if it fails, the row stays
    /// and the error is returned. Holding the write lock across both steps
    /// means no reader can resolve the row between the guard running and
    /// the removal, which is what keeps a concurrent lazy materialization
    /// from resurrecting a dropped group.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`], [`Error::CannotDropDefault`], or whatever
    /// `guard` returns.
    pub fn drop_group_with(
        &self,
        id: GroupId,
        guard: impl FnOnce(&ResourceGroup) -> Result<()>,
    ) -> Result<ResourceGroup> {
        if id == self.default_id {
            return Err(Error::CannotDropDefault);
        }
        let mut inner = self.inner.write();
        let group = inner
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::UnknownGroup(id.to_string()))?;
        guard(&group)?;
        inner.groups.shift_remove(&id);
        inner.names.remove(&group.name);
        // Roles bound to the dropped group fall back to the default group.
        inner.bindings.retain(|_, bound| *bound != id);
        tracing::debug!(group = %id, name = %group.name, "dropped resource group");
        Ok(group)
    }

    /// Resolves a group name to its id.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] if no group has this name.
    pub fn group_id_for_name(&self, name: &str, mode: LockMode) -> Result<GroupId> {
        let lookup = |inner: &CatalogInner| {
            inner
                .names
                .get(name)
                .copied()
                .ok_or_else(|| Error::UnknownGroup(name.to_string()))
        };
        match mode {
            LockMode::Share => lookup(&self.inner.read()),
            LockMode::Exclusive => lookup(&self.inner.write()),
        }
    }

    /// Resolves a group id to its name.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] if no group has this id.
    pub fn group_name_for_id(&self, id: GroupId, mode: LockMode) -> Result<String> {
        let lookup = |inner: &CatalogInner| {
            inner
                .groups
                .get(&id)
                .map(|g| g.name.clone())
                .ok_or_else(|| Error::UnknownGroup(id.to_string()))
        };
        match mode {
            LockMode::Share => lookup(&self.inner.read()),
            LockMode::Exclusive => lookup(&self.inner.write()),
        }
    }

    /// Resolves a role to its group, falling back to the default group for
    /// unbound roles. Never fails.
    #[must_use]
    pub fn group_id_for_role(&self, role: RoleId) -> GroupId {
        self.inner
            .read()
            .bindings
            .get(&role)
            .copied()
            .unwrap_or(self.default_id)
    }

    /// Returns a group's current capabilities.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] if no group has this id.
    pub fn capabilities(&self, id: GroupId) -> Result<CapabilitySet> {
        self.inner
            .read()
            .groups
            .get(&id)
            .map(|g| g.caps)
            .ok_or_else(|| Error::UnknownGroup(id.to_string()))
    }

    /// Runs `f` with a group's capabilities while holding the catalog read
    /// lock, so the row cannot be dropped out from under the call.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] if no group has this id.
    pub fn with_capabilities<R>(&self, id: GroupId, f: impl FnOnce(CapabilitySet) -> R) -> Result<R> {
        let inner = self.inner.read();
        let caps = inner
            .groups
            .get(&id)
            .map(|g| g.caps)
            .ok_or_else(|| Error::UnknownGroup(id.to_string()))?;
        Ok(f(caps))
    }

    /// Binds a role to a group, replacing any existing binding.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] if the target group does not exist.
    pub fn bind_role(&self, role: RoleId, group: GroupId) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.groups.contains_key(&group) {
            return Err(Error::UnknownGroup(group.to_string()));
        }
        inner.bindings.insert(role, group);
        Ok(())
    }

    /// Removes a role's explicit binding; the role resolves to the default
    /// group afterwards.
    pub fn unbind_role(&self, role: RoleId) {
        self.inner.write().bindings.remove(&role);
    }

    /// All groups in creation order.
    #[must_use]
    pub fn list(&self) -> Vec<ResourceGroup> {
        self.inner.read().groups.values().cloned().collect()
    }

    /// Current sum of `memory_limit_pct` over all groups.
    #[must_use]
    pub fn memory_pct_sum(&self) -> u32 {
        self.inner.read().memory_pct_sum()
    }
}
