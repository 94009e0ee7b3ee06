//! Session management and the end-of-transaction hook.

use std::sync::Arc;

use resgov_common::types::{GroupId, RoleId, SessionId};
use resgov_common::utils::error::Result;
use resgov_core::registry::{CancelToken, Grant};

use crate::admission::AdmissionController;

/// One worker's view of the governor: holds at most one [`Grant`] at a time.
///
/// Sessions provide isolation between concurrent users and carry the
/// transaction-scoped admission state. The transaction manager must call
/// [`at_eoxact`](Self::at_eoxact) once per transaction end; that hook is the
/// safety net that returns the slot when a session aborts mid-query.
#[derive(Debug)]
pub struct Session {
    /// This session's identity.
    id: SessionId,
    /// The role admission resolves through.
    role: RoleId,
    /// Shared admission controller.
    admission: Arc<AdmissionController>,
    /// Cancellation handle for the in-flight (or next) acquisition.
    cancel: CancelToken,
    /// The grant held for the current statement, if any.
    grant: Option<Grant>,
}

impl Session {
    pub(crate) fn new(id: SessionId, role: RoleId, admission: Arc<AdmissionController>) -> Self {
        Self {
            id,
            role,
            admission,
            cancel: CancelToken::new(),
            grant: None,
        }
    }

    /// This session's id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The role this session runs as.
    #[must_use]
    pub fn role(&self) -> RoleId {
        self.role
    }

    /// Acquires a slot (no memory reservation) before query execution.
    ///
    /// A session already holding a grant keeps it: one statement, one slot.
    ///
    /// # Errors
    ///
    /// Admission errors: `AdmissionTimeout`, `Cancelled`, `UnknownGroup`.
    pub fn acquire(&mut self) -> Result<()> {
        self.acquire_with_memory(0)
    }

    /// Acquires a slot plus `memory_bytes` of the group's memory budget.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire).
    pub fn acquire_with_memory(&mut self, memory_bytes: u64) -> Result<()> {
        if self.grant.is_some() {
            return Ok(());
        }
        let grant = self.admission.acquire(self.role, memory_bytes, &self.cancel)?;
        self.grant = Some(grant);
        Ok(())
    }

    /// Whether a grant is currently held.
    #[must_use]
    pub fn holds_grant(&self) -> bool {
        self.grant.is_some()
    }

    /// The group the held grant was issued against, if any.
    #[must_use]
    pub fn granted_group(&self) -> Option<GroupId> {
        self.grant.as_ref().map(Grant::group_id)
    }

    /// Releases the held grant on normal statement completion. No-op when
    /// nothing is held.
    pub fn release_grant(&mut self) {
        if let Some(grant) = self.grant.take() {
            self.admission.release(grant);
        }
    }

    /// A handle other threads can use to cancel this session's blocked
    /// acquisition.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// End-of-transaction hook, called once per transaction by the
    /// transaction manager with the commit/abort flag.
    ///
    /// Releases any grant still held: the abort path, and the safety net
    /// for statements that never released explicitly. Idempotent: with no
    /// grant held this is a no-op. Also re-arms the cancellation token so a
    /// cancel aimed at the finished transaction cannot leak into the next.
    pub fn at_eoxact(&mut self, is_commit: bool) {
        if let Some(grant) = self.grant.take() {
            tracing::debug!(
                session = %self.id,
                group = %grant.group_id(),
                is_commit,
                "releasing grant at transaction end"
            );
            self.admission.release(grant);
        }
        self.cancel = CancelToken::new();
    }
}
