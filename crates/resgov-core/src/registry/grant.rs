//! Admission grants.

use std::sync::Arc;

use resgov_common::types::GroupId;

use super::RuntimeGroupState;

/// A session's successful acquisition of one slot (and memory quota) from a
/// group.
///
/// Owned exclusively by the requesting session. Release happens exactly once,
/// when the grant is consumed: dropping it returns the slot and memory to the
/// [`RuntimeGroupState`] it was issued against and wakes the longest-waiting
/// queued request. The grant pins its issuing state, so release targets the
/// right counters even if the group's capabilities changed mid-transaction.
#[derive(Debug)]
pub struct Grant {
    group_id: GroupId,
    state: Option<Arc<RuntimeGroupState>>,
    memory_bytes: u64,
}

impl Grant {
    pub(crate) fn new(group_id: GroupId, state: Arc<RuntimeGroupState>, memory_bytes: u64) -> Self {
        Self {
            group_id,
            state: Some(state),
            memory_bytes,
        }
    }

    /// The group this grant was issued against.
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Memory quota reserved with the slot.
    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.release_one(self.memory_bytes);
        }
    }
}
