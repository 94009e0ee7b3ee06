//! Admission control: the checkpoint every query passes before executing.
//!
//! The fast path is one `try_acquire` against the runtime registry. The slow
//! path parks the session on the group's FIFO wait queue until a release
//! hands the slot forward, the configured timeout elapses, or the request is
//! cancelled. A woken waiter always re-runs the admission check (the
//! group's capabilities may have shrunk while it slept) and rejoins the
//! tail if still short, with the request's original deadline bounding total
//! wait across requeues.

use std::sync::Arc;
use std::time::Instant;

use resgov_common::types::{GroupId, LockMode, RoleId};
use resgov_common::utils::error::{Error, Result};
use resgov_core::catalog::GroupCatalog;
use resgov_core::registry::{Admission, CancelToken, Grant, RuntimeRegistry, WaitOutcome, WaiterHandle};

use crate::config::Config;

/// Acquires and releases slots against the runtime registry on behalf of
/// sessions.
#[derive(Debug)]
pub struct AdmissionController {
    catalog: Arc<GroupCatalog>,
    registry: Arc<RuntimeRegistry>,
    timeout: Option<std::time::Duration>,
}

impl AdmissionController {
    /// Creates a controller over the given catalog and registry.
    #[must_use]
    pub fn new(catalog: Arc<GroupCatalog>, registry: Arc<RuntimeRegistry>, config: &Config) -> Self {
        Self {
            catalog,
            registry,
            timeout: config.admission_timeout,
        }
    }

    /// Acquires a slot for `role`, resolving its group through the catalog
    /// (unbound roles land in the default group).
    ///
    /// # Errors
    ///
    /// [`Error::AdmissionTimeout`], [`Error::Cancelled`], or
    /// [`Error::UnknownGroup`] if the group is dropped while waiting.
    pub fn acquire(
        &self,
        role: RoleId,
        memory_bytes: u64,
        cancel: &CancelToken,
    ) -> Result<Grant> {
        let group_id = self.catalog.group_id_for_role(role);
        self.acquire_group(group_id, memory_bytes, cancel)
    }

    /// Acquires a slot from a specific group.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire).
    pub fn acquire_group(
        &self,
        group_id: GroupId,
        memory_bytes: u64,
        cancel: &CancelToken,
    ) -> Result<Grant> {
        // Self-healing: a group whose catalog row committed without a live
        // entry (or after a restart race) is materialized on first use. The
        // capabilities read and the materialize run under the catalog read
        // lock, so a concurrent drop (which holds the write lock across
        // retire and row removal) can never be resurrected from a row that
        // is already gone.
        if !self.registry.is_materialized(group_id) {
            self.catalog.with_capabilities(group_id, |caps| {
                self.registry.materialize(group_id, caps);
            })?;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.registry.acquire_or_enqueue(group_id, memory_bytes)? {
            Admission::Granted(grant) => Ok(grant),
            Admission::Queued(handle) => {
                self.wait_for_slot(group_id, memory_bytes, handle, cancel)
            }
        }
    }

    /// Releases a grant, handing the slot to the longest-waiting request.
    pub fn release(&self, grant: Grant) {
        self.registry.release(grant);
    }

    fn wait_for_slot(
        &self,
        group_id: GroupId,
        memory_bytes: u64,
        handle: WaiterHandle,
        cancel: &CancelToken,
    ) -> Result<Grant> {
        let started = Instant::now();
        let deadline = self.timeout.map(|t| started + t);
        cancel.attach(&handle);
        // A cancel that fired between the flag check and attach would have
        // missed the channel; re-check now that it cannot.
        if cancel.is_cancelled() {
            cancel.detach();
            self.registry.dequeue(handle);
            return Err(Error::Cancelled);
        }
        tracing::debug!(group = %group_id, "session blocked waiting for slot");

        loop {
            match handle.wait_until(deadline) {
                WaitOutcome::Slot => {
                    if cancel.is_cancelled() {
                        // Granted a wakeup and cancelled at once: the wakeup
                        // is forwarded, never leaked.
                        cancel.detach();
                        self.registry.dequeue(handle);
                        return Err(Error::Cancelled);
                    }
                    match self.registry.retry_or_requeue(&handle, memory_bytes) {
                        Ok(Some(grant)) => {
                            cancel.detach();
                            tracing::debug!(
                                group = %group_id,
                                waited = ?started.elapsed(),
                                "admitted after wait"
                            );
                            return Ok(grant);
                        }
                        Ok(None) => {
                            // Capabilities shrank while we slept; the retry
                            // rejoined the tail atomically. Jumping back to
                            // the head would let one session starve everyone
                            // behind it.
                            if deadline.is_some_and(|d| Instant::now() >= d) {
                                cancel.detach();
                                self.registry.dequeue(handle);
                                return Err(self.timeout_error(group_id, started));
                            }
                        }
                        Err(e) => {
                            // Group retired while we were blocked.
                            cancel.detach();
                            return Err(e);
                        }
                    }
                }
                WaitOutcome::Cancel => {
                    cancel.detach();
                    self.registry.dequeue(handle);
                    return Err(Error::Cancelled);
                }
                WaitOutcome::TimedOut => {
                    cancel.detach();
                    self.registry.dequeue(handle);
                    return Err(self.timeout_error(group_id, started));
                }
            }
        }
    }

    fn timeout_error(&self, group_id: GroupId, started: Instant) -> Error {
        let group = self
            .catalog
            .group_name_for_id(group_id, LockMode::Share)
            .unwrap_or_else(|_| group_id.to_string());
        Error::AdmissionTimeout {
            group,
            waited: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resgov_common::types::CapabilitySet;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn caps(concurrency: u32, memory_pct: u8) -> CapabilitySet {
        CapabilitySet {
            concurrency_limit: concurrency,
            memory_limit_pct: memory_pct,
            ..CapabilitySet::default()
        }
    }

    fn setup(
        concurrency: u32,
        timeout: Option<Duration>,
    ) -> (Arc<AdmissionController>, Arc<RuntimeRegistry>, GroupId) {
        let catalog = Arc::new(GroupCatalog::new(caps(0, 0)).unwrap());
        let etl = catalog.create("etl", caps(concurrency, 0)).unwrap();
        let registry = Arc::new(RuntimeRegistry::new(0));
        let config = Config::in_memory().with_admission_timeout(timeout);
        let admission = Arc::new(AdmissionController::new(
            catalog,
            Arc::clone(&registry),
            &config,
        ));
        (admission, registry, etl)
    }

    fn wait_for_waiters(registry: &RuntimeRegistry, group: GroupId, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry
            .group_stats(group)
            .map_or(0, |s| s.waiter_count)
            < count
        {
            assert!(Instant::now() < deadline, "waiters never queued");
            thread::yield_now();
        }
    }

    #[test]
    fn test_lazy_materialization_on_first_acquire() {
        let (admission, registry, etl) = setup(2, None);
        assert!(!registry.is_materialized(etl));
        let grant = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();
        assert!(registry.is_materialized(etl));
        admission.release(grant);
    }

    #[test]
    fn test_unbound_role_admitted_via_default_group() {
        let (admission, _registry, _etl) = setup(2, None);
        let grant = admission
            .acquire(RoleId::new(42), 0, &CancelToken::new())
            .unwrap();
        assert_eq!(grant.group_id(), GroupId::new(1));
        admission.release(grant);
    }

    #[test]
    fn test_timeout_when_group_saturated() {
        let (admission, registry, etl) = setup(1, Some(Duration::from_millis(50)));
        let held = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();

        let started = Instant::now();
        let err = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        // The timed-out waiter left no queue entry behind.
        assert_eq!(registry.group_stats(etl).unwrap().waiter_count, 0);
        admission.release(held);
    }

    #[test]
    fn test_cancel_before_acquire() {
        let (admission, _registry, etl) = setup(1, None);
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            admission.acquire_group(etl, 0, &token),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_cancel_unblocks_waiting_session() {
        let (admission, registry, etl) = setup(1, None);
        let held = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();

        let token = CancelToken::new();
        let waiter = {
            let admission = Arc::clone(&admission);
            let token = token.clone();
            thread::spawn(move || admission.acquire_group(etl, 0, &token))
        };
        wait_for_waiters(&registry, etl, 1);

        token.cancel();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(registry.group_stats(etl).unwrap().waiter_count, 0);
        // The held slot is intact and the freed queue admits new work.
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 1);
        admission.release(held);
    }

    #[test]
    fn test_cancel_racing_release_forwards_slot() {
        let (admission, registry, etl) = setup(1, None);
        let held = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();

        let token = CancelToken::new();
        let cancelled = {
            let admission = Arc::clone(&admission);
            let token = token.clone();
            thread::spawn(move || admission.acquire_group(etl, 0, &token))
        };
        wait_for_waiters(&registry, etl, 1);
        let survivor = {
            let admission = Arc::clone(&admission);
            thread::spawn(move || admission.acquire_group(etl, 0, &CancelToken::new()))
        };
        wait_for_waiters(&registry, etl, 2);

        // Fire both sides of the race; whichever way it lands, the slot must
        // end up with the survivor.
        token.cancel();
        admission.release(held);

        assert!(matches!(cancelled.join().unwrap(), Err(Error::Cancelled)));
        let grant = survivor.join().unwrap().unwrap();
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 1);
        admission.release(grant);
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 0);
    }

    #[test]
    fn test_fifo_wake_order() {
        let (admission, registry, etl) = setup(1, None);
        let held = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for n in 0..3 {
            let admission = Arc::clone(&admission);
            let order = Arc::clone(&order);
            waiters.push(thread::spawn(move || {
                let grant = admission
                    .acquire_group(etl, 0, &CancelToken::new())
                    .unwrap();
                order.lock().unwrap().push(n);
                admission.release(grant);
            }));
            // Arrival order is the queue order; wait until this session is
            // actually queued before starting the next.
            wait_for_waiters(&registry, etl, n + 1);
        }

        admission.release(held);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_etl_two_slots_third_blocks() {
        let (admission, registry, etl) = setup(2, None);
        let g1 = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();
        let g2 = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();

        let third = {
            let admission = Arc::clone(&admission);
            thread::spawn(move || admission.acquire_group(etl, 0, &CancelToken::new()))
        };
        wait_for_waiters(&registry, etl, 1);
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 2);

        admission.release(g1);
        let g3 = third.join().unwrap().unwrap();
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 2);
        admission.release(g2);
        admission.release(g3);
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 0);
    }

    #[test]
    fn test_concurrent_churn_never_wedges() {
        // Rapid release/acquire cycles over one slot exercise the window
        // between observing Busy and joining the queue; a release landing
        // there must still find the waiter. A lost wakeup here shows up as
        // a timeout.
        let (admission, registry, etl) = setup(1, Some(Duration::from_secs(10)));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let admission = Arc::clone(&admission);
            workers.push(thread::spawn(move || {
                for _ in 0..100 {
                    let grant = admission
                        .acquire_group(etl, 0, &CancelToken::new())
                        .unwrap();
                    admission.release(grant);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        let stats = registry.group_stats(etl).unwrap();
        assert_eq!(stats.slots_in_use, 0);
        assert_eq!(stats.waiter_count, 0);
    }

    #[test]
    fn test_alter_shrink_keeps_existing_grants() {
        let (admission, registry, etl) = setup(2, None);
        let g1 = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();
        let g2 = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();

        // Shrink to 1 while 2 slots are held; holders are untouched.
        registry.materialize(etl, caps(1, 0));
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 2);

        let blocked = {
            let admission = Arc::clone(&admission);
            thread::spawn(move || admission.acquire_group(etl, 0, &CancelToken::new()))
        };
        wait_for_waiters(&registry, etl, 1);

        // One release is not enough under the new limit of 1.
        admission.release(g1);
        thread::sleep(Duration::from_millis(20));
        assert!(!blocked.is_finished());
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 1);

        admission.release(g2);
        let g3 = blocked.join().unwrap().unwrap();
        assert_eq!(registry.group_stats(etl).unwrap().slots_in_use, 1);
        admission.release(g3);
    }

    #[test]
    fn test_group_dropped_while_waiting_surfaces_unknown_group() {
        let (admission, registry, etl) = setup(1, None);
        let held = admission
            .acquire_group(etl, 0, &CancelToken::new())
            .unwrap();
        let blocked = {
            let admission = Arc::clone(&admission);
            thread::spawn(move || admission.acquire_group(etl, 0, &CancelToken::new()))
        };
        wait_for_waiters(&registry, etl, 1);

        admission.release(held);
        // Retire can only succeed once the slot is free; the woken waiter
        // may win the race and acquire instead, so accept either outcome.
        let mut retired = false;
        for _ in 0..100 {
            if registry.retire(etl, "etl").is_ok() {
                retired = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        match blocked.join().unwrap() {
            Ok(grant) => {
                assert!(!retired);
                admission.release(grant);
            }
            Err(err) => assert!(matches!(err, Error::UnknownGroup(_))),
        }
    }
}
