//! The runtime registry: live per-group counters and wait queues.
//!
//! This is the synchronization point every session touches on query start
//! and end. Counter mutations are serialized per group behind each group's
//! own mutex; unrelated groups' admission paths never contend. The table of
//! groups itself sits behind a read-mostly `RwLock`; it changes only on DDL.
//!
//! The Busy observation and the queue entry are a single atomic step
//! ([`RuntimeRegistry::acquire_or_enqueue`]): a releaser that takes the
//! group mutex after the observation finds the waiter already queued, so a
//! wakeup cannot fall between "saw no capacity" and "joined the queue".
//!
//! All grants and wakeups flow through this interface, so the backing
//! transport can be swapped (shared memory segment, coordinator service)
//! without touching admission or DDL logic.

mod grant;
mod waiter;

pub use grant::Grant;
pub use waiter::{CancelToken, WaitOutcome, WaiterHandle, Wakeup};

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use resgov_common::types::{CapabilitySet, GroupId};
use resgov_common::utils::error::{Error, Result};

use waiter::Waiter;

/// Point-in-time view of one group's live counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    /// Slots currently held.
    pub slots_in_use: u32,
    /// Memory currently reserved, in bytes.
    pub memory_in_use: u64,
    /// Sessions queued for a slot.
    pub waiter_count: usize,
    /// The live concurrency ceiling (0 = unlimited).
    pub concurrency_limit: u32,
}

/// Outcome of one fused admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// Capacity was available; the caller holds the grant.
    Granted(Grant),
    /// The group was busy; the caller is queued in FIFO order.
    Queued(WaiterHandle),
}

#[derive(Debug)]
struct GroupInner {
    caps: CapabilitySet,
    /// Absolute budget derived from `caps.memory_limit_pct`; `None` when
    /// memory accounting is disabled for the group.
    memory_budget: Option<u64>,
    slots_in_use: u32,
    memory_in_use: u64,
    waiters: VecDeque<Arc<Waiter>>,
    /// Set by [`RuntimeRegistry::retire`] under this mutex. A pinned state
    /// can outlive its table entry; the flag keeps late waiters from
    /// granting against, or requeueing onto, a dead group.
    retired: bool,
}

impl GroupInner {
    /// Grants a slot if capacity allows. New arrivals (`from_queue` false)
    /// defer to queued waiters so they cannot jump the FIFO line; a woken
    /// waiter (`from_queue` true) was already popped from the queue and
    /// checks raw capacity only.
    fn try_grant(&mut self, memory_bytes: u64, from_queue: bool) -> bool {
        if !from_queue && !self.waiters.is_empty() {
            return false;
        }
        if self.caps.concurrency_limit != 0 && self.slots_in_use >= self.caps.concurrency_limit {
            return false;
        }
        // Overflow counts as over budget even with accounting disabled; a
        // wrapped counter would corrupt every later release.
        let Some(next_memory) = self.memory_in_use.checked_add(memory_bytes) else {
            return false;
        };
        if self.memory_budget.is_some_and(|budget| next_memory > budget) {
            return false;
        }
        self.slots_in_use += 1;
        self.memory_in_use = next_memory;
        true
    }

    /// Pops and signals the longest-waiting queued request. Pop and send
    /// happen under the group mutex, so once a waiter is absent from the
    /// queue its wakeup is already in its channel.
    fn wake_head(&mut self) {
        if let Some(waiter) = self.waiters.pop_front() {
            let _ = waiter.tx.send(Wakeup::Slot);
        }
    }
}

/// Live state of one materialized group.
#[derive(Debug)]
pub struct RuntimeGroupState {
    group_id: GroupId,
    inner: Mutex<GroupInner>,
}

impl RuntimeGroupState {
    /// Returns the slot and memory held by a grant, then wakes the next
    /// waiter. Called from [`Grant::drop`] only.
    ///
    /// Counter underflow means the shared accounting is corrupt; continuing
    /// would admit work against garbage limits, so this aborts the process.
    pub(crate) fn release_one(&self, memory_bytes: u64) {
        let mut inner = self.inner.lock();
        inner.slots_in_use = inner.slots_in_use.checked_sub(1).unwrap_or_else(|| {
            panic!("slot counter underflow for {}", self.group_id);
        });
        inner.memory_in_use = inner.memory_in_use.checked_sub(memory_bytes).unwrap_or_else(|| {
            panic!("memory counter underflow for {}", self.group_id);
        });
        inner.wake_head();
    }
}

/// Process-shared table of live group state, addressed by group id.
///
/// Share via `Arc` across worker sessions. Rebuilt from the catalog with
/// zeroed counters on restart; counters reflect only currently-running work.
#[derive(Debug)]
pub struct RuntimeRegistry {
    groups: RwLock<HashMap<GroupId, Arc<RuntimeGroupState>>>,
    total_memory_bytes: u64,
}

impl RuntimeRegistry {
    /// Creates an empty registry. `total_memory_bytes` is the engine-wide
    /// budget that group memory percentages are taken of.
    #[must_use]
    pub fn new(total_memory_bytes: u64) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            total_memory_bytes,
        }
    }

    /// Creates or updates the live entry for a group.
    ///
    /// An update rewrites the limits in place and never touches the
    /// counters: existing grants are not revoked, and a lowered ceiling
    /// takes effect as slots free.
    pub fn materialize(&self, group_id: GroupId, caps: CapabilitySet) {
        let mut groups = self.groups.write();
        if let Some(state) = groups.get(&group_id) {
            let mut inner = state.inner.lock();
            inner.caps = caps;
            inner.memory_budget = caps.memory_budget(self.total_memory_bytes);
        } else {
            groups.insert(
                group_id,
                Arc::new(RuntimeGroupState {
                    group_id,
                    inner: Mutex::new(GroupInner {
                        caps,
                        memory_budget: caps.memory_budget(self.total_memory_bytes),
                        slots_in_use: 0,
                        memory_in_use: 0,
                        waiters: VecDeque::new(),
                        retired: false,
                    }),
                }),
            );
        }
        tracing::debug!(group = %group_id, "materialized runtime group state");
    }

    /// Removes a group's live entry.
    ///
    /// # Errors
    ///
    /// [`Error::GroupInUse`] if any slot is still held at the instant of the
    /// attempt, reported to the caller and never retried here. Queued waiters
    /// are woken so their retry surfaces [`Error::UnknownGroup`] instead of
    /// blocking until timeout.
    pub fn retire(&self, group_id: GroupId, name: &str) -> Result<()> {
        let mut groups = self.groups.write();
        let Some(state) = groups.get(&group_id).cloned() else {
            // Never materialized (or already retired); nothing to tear down.
            return Ok(());
        };
        let mut inner = state.inner.lock();
        if inner.slots_in_use > 0 {
            return Err(Error::GroupInUse {
                name: name.to_string(),
                slots_in_use: inner.slots_in_use,
            });
        }
        inner.retired = true;
        let orphans: Vec<_> = inner.waiters.drain(..).collect();
        drop(inner);
        for waiter in orphans {
            let _ = waiter.tx.send(Wakeup::Slot);
        }
        groups.remove(&group_id);
        tracing::debug!(group = %group_id, "retired runtime group state");
        Ok(())
    }

    /// Whether a live entry exists for the group.
    #[must_use]
    pub fn is_materialized(&self, group_id: GroupId) -> bool {
        self.groups.read().contains_key(&group_id)
    }

    /// Attempts to acquire a slot and `memory_bytes` of quota.
    ///
    /// `Ok(None)` means busy: the group is at its concurrency limit, its
    /// memory budget cannot cover the request, or waiters are already
    /// queued (new arrivals never jump the FIFO line).
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] when the group has no live entry.
    pub fn try_acquire(&self, group_id: GroupId, memory_bytes: u64) -> Result<Option<Grant>> {
        let state = self.state(group_id)?;
        let granted = {
            let mut inner = state.inner.lock();
            if inner.retired {
                return Err(Error::UnknownGroup(group_id.to_string()));
            }
            inner.try_grant(memory_bytes, false)
        };
        Ok(granted.then(|| Grant::new(group_id, state, memory_bytes)))
    }

    /// Attempts to acquire a slot and, on Busy, joins the group's FIFO wait
    /// queue, all under the group mutex.
    ///
    /// Because the check and the queue entry are one atomic step, a release
    /// that lands right after the Busy observation sees the waiter and
    /// signals it; there is no window in which the wakeup can be lost.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] when the group has no live entry.
    pub fn acquire_or_enqueue(&self, group_id: GroupId, memory_bytes: u64) -> Result<Admission> {
        let state = self.state(group_id)?;
        let mut inner = state.inner.lock();
        if inner.retired {
            return Err(Error::UnknownGroup(group_id.to_string()));
        }
        if inner.try_grant(memory_bytes, false) {
            drop(inner);
            return Ok(Admission::Granted(Grant::new(group_id, state, memory_bytes)));
        }
        let (waiter, rx) = waiter::new_waiter();
        inner.waiters.push_back(Arc::clone(&waiter));
        drop(inner);
        Ok(Admission::Queued(WaiterHandle {
            group_id,
            state,
            waiter,
            rx,
        }))
    }

    /// Re-runs the admission check for a waiter that was just woken and, if
    /// still short, re-appends it at the queue tail, all under the group
    /// mutex.
    ///
    /// The waiter was popped from the queue by the releaser, so the check
    /// ignores the (remaining) queue. Rejoining the tail (never the head)
    /// preserves fairness after a capability shrink; the caller's retry
    /// budget bounds total wait time.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownGroup`] when the group was retired while the waiter
    /// was blocked. A retired group's queue is never drained again, so the
    /// waiter must not rejoin it.
    pub fn retry_or_requeue(
        &self,
        handle: &WaiterHandle,
        memory_bytes: u64,
    ) -> Result<Option<Grant>> {
        let mut inner = handle.state.inner.lock();
        if inner.retired {
            return Err(Error::UnknownGroup(handle.group_id.to_string()));
        }
        if inner.try_grant(memory_bytes, true) {
            drop(inner);
            return Ok(Some(Grant::new(
                handle.group_id,
                Arc::clone(&handle.state),
                memory_bytes,
            )));
        }
        inner.waiters.push_back(Arc::clone(&handle.waiter));
        Ok(None)
    }

    /// Removes a waiter on cancellation or timeout.
    ///
    /// If the waiter was already popped by a releaser, its slot wakeup is in
    /// flight; it is forwarded to the next queued waiter under the same
    /// mutex, so a request that loses the grant/cancel race never strands
    /// the signal.
    pub fn dequeue(&self, handle: WaiterHandle) {
        let mut inner = handle.state.inner.lock();
        let position = inner
            .waiters
            .iter()
            .position(|w| Arc::ptr_eq(w, &handle.waiter));
        match position {
            Some(index) => {
                inner.waiters.remove(index);
            }
            None => {
                // Popped and signaled concurrently; pass the wakeup on.
                inner.wake_head();
            }
        }
    }

    /// Releases a grant, returning its slot and memory and waking the next
    /// waiter. Equivalent to dropping the grant; provided for call sites
    /// that want the release spelled out.
    pub fn release(&self, grant: Grant) {
        drop(grant);
    }

    /// Live counters for one group, if materialized.
    #[must_use]
    pub fn group_stats(&self, group_id: GroupId) -> Option<GroupStats> {
        let state = self.groups.read().get(&group_id).cloned()?;
        let inner = state.inner.lock();
        Some(GroupStats {
            slots_in_use: inner.slots_in_use,
            memory_in_use: inner.memory_in_use,
            waiter_count: inner.waiters.len(),
            concurrency_limit: inner.caps.concurrency_limit,
        })
    }

    /// Number of materialized groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    fn state(&self, group_id: GroupId) -> Result<Arc<RuntimeGroupState>> {
        self.groups
            .read()
            .get(&group_id)
            .cloned()
            .ok_or_else(|| Error::UnknownGroup(group_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn caps(concurrency: u32, memory_pct: u8) -> CapabilitySet {
        CapabilitySet {
            concurrency_limit: concurrency,
            memory_limit_pct: memory_pct,
            ..CapabilitySet::default()
        }
    }

    fn registry_with(concurrency: u32, memory_pct: u8) -> (RuntimeRegistry, GroupId) {
        let registry = RuntimeRegistry::new(1000);
        let id = GroupId::new(2);
        registry.materialize(id, caps(concurrency, memory_pct));
        (registry, id)
    }

    fn queued(admission: Admission) -> WaiterHandle {
        match admission {
            Admission::Queued(handle) => handle,
            Admission::Granted(_) => panic!("expected the group to be busy"),
        }
    }

    #[test]
    fn test_acquire_up_to_limit_then_busy() {
        let (registry, id) = registry_with(2, 0);
        let g1 = registry.try_acquire(id, 0).unwrap().unwrap();
        let g2 = registry.try_acquire(id, 0).unwrap().unwrap();
        assert!(registry.try_acquire(id, 0).unwrap().is_none());
        assert_eq!(registry.group_stats(id).unwrap().slots_in_use, 2);

        drop(g1);
        assert!(registry.try_acquire(id, 0).unwrap().is_some());
        drop(g2);
    }

    #[test]
    fn test_zero_concurrency_means_unlimited() {
        let (registry, id) = registry_with(0, 0);
        let grants: Vec<_> = (0..64)
            .map(|_| registry.try_acquire(id, 0).unwrap().unwrap())
            .collect();
        assert_eq!(registry.group_stats(id).unwrap().slots_in_use, 64);
        drop(grants);
        assert_eq!(registry.group_stats(id).unwrap().slots_in_use, 0);
    }

    #[test]
    fn test_memory_budget_enforced() {
        // 30% of 1000 bytes = 300 bytes budget.
        let (registry, id) = registry_with(0, 30);
        let g1 = registry.try_acquire(id, 200).unwrap().unwrap();
        assert!(registry.try_acquire(id, 200).unwrap().is_none());
        let g2 = registry.try_acquire(id, 100).unwrap().unwrap();
        assert_eq!(registry.group_stats(id).unwrap().memory_in_use, 300);
        drop(g1);
        assert_eq!(registry.group_stats(id).unwrap().memory_in_use, 100);
        drop(g2);
    }

    #[test]
    fn test_memory_accounting_disabled_at_zero_pct() {
        let (registry, id) = registry_with(0, 0);
        let g = registry.try_acquire(id, u64::MAX / 2).unwrap().unwrap();
        drop(g);
    }

    #[test]
    fn test_unknown_group() {
        let registry = RuntimeRegistry::new(0);
        assert!(matches!(
            registry.try_acquire(GroupId::new(9), 0),
            Err(Error::UnknownGroup(_))
        ));
        assert!(registry.acquire_or_enqueue(GroupId::new(9), 0).is_err());
    }

    #[test]
    fn test_new_arrival_defers_to_queued_waiters() {
        let (registry, id) = registry_with(1, 0);
        let held = registry.try_acquire(id, 0).unwrap().unwrap();
        let handle = queued(registry.acquire_or_enqueue(id, 0).unwrap());

        drop(held);
        // The freed slot belongs to the queued waiter, not a new arrival.
        assert!(registry.try_acquire(id, 0).unwrap().is_none());
        assert_eq!(handle.wait_until(None), WaitOutcome::Slot);
        let grant = registry.retry_or_requeue(&handle, 0).unwrap().unwrap();
        drop(grant);
    }

    #[test]
    fn test_release_right_after_busy_observation_wakes_waiter() {
        let (registry, id) = registry_with(1, 0);
        let held = registry.try_acquire(id, 0).unwrap().unwrap();

        // Busy observation and queue entry are one step, so a release
        // landing immediately afterwards finds the waiter and signals it.
        let handle = queued(registry.acquire_or_enqueue(id, 0).unwrap());
        drop(held);

        let deadline = Instant::now() + Duration::from_millis(200);
        assert_eq!(handle.wait_until(Some(deadline)), WaitOutcome::Slot);
        let grant = registry.retry_or_requeue(&handle, 0).unwrap().unwrap();
        drop(grant);
        assert!(registry.try_acquire(id, 0).unwrap().is_some());
    }

    #[test]
    fn test_release_wakes_waiters_in_fifo_order() {
        let (registry, id) = registry_with(1, 0);
        let held = registry.try_acquire(id, 0).unwrap().unwrap();
        let first = queued(registry.acquire_or_enqueue(id, 0).unwrap());
        let second = queued(registry.acquire_or_enqueue(id, 0).unwrap());
        assert_eq!(registry.group_stats(id).unwrap().waiter_count, 2);

        drop(held);
        // Only the head is signaled.
        assert_eq!(first.wait_until(None), WaitOutcome::Slot);
        assert!(second.rx.is_empty());

        let grant = registry.retry_or_requeue(&first, 0).unwrap().unwrap();
        drop(grant);
        assert_eq!(second.wait_until(None), WaitOutcome::Slot);
        registry.dequeue(second);
    }

    #[test]
    fn test_dequeue_forwards_raced_wakeup() {
        let (registry, id) = registry_with(1, 0);
        let held = registry.try_acquire(id, 0).unwrap().unwrap();
        let first = queued(registry.acquire_or_enqueue(id, 0).unwrap());
        let second = queued(registry.acquire_or_enqueue(id, 0).unwrap());

        // First waiter is popped and signaled...
        drop(held);
        // ...but abandons (timeout/cancel) without consuming the slot.
        registry.dequeue(first);
        // The wakeup must have been forwarded to the second waiter.
        assert_eq!(second.wait_until(None), WaitOutcome::Slot);
        let grant = registry.retry_or_requeue(&second, 0).unwrap().unwrap();
        drop(grant);
    }

    #[test]
    fn test_dequeue_while_still_queued_removes_silently() {
        let (registry, id) = registry_with(1, 0);
        let held = registry.try_acquire(id, 0).unwrap().unwrap();
        let first = queued(registry.acquire_or_enqueue(id, 0).unwrap());
        let second = queued(registry.acquire_or_enqueue(id, 0).unwrap());

        registry.dequeue(first);
        assert_eq!(registry.group_stats(id).unwrap().waiter_count, 1);
        // Second is now head and gets the next release.
        drop(held);
        assert_eq!(second.wait_until(None), WaitOutcome::Slot);
    }

    #[test]
    fn test_retire_busy_group_fails() {
        let (registry, id) = registry_with(2, 0);
        let held = registry.try_acquire(id, 0).unwrap().unwrap();
        let err = registry.retire(id, "etl").unwrap_err();
        assert!(matches!(
            err,
            Error::GroupInUse {
                slots_in_use: 1,
                ..
            }
        ));
        assert!(registry.is_materialized(id));

        drop(held);
        registry.retire(id, "etl").unwrap();
        assert!(!registry.is_materialized(id));
    }

    #[test]
    fn test_retire_wakes_orphaned_waiters() {
        let (registry, id) = registry_with(1, 0);
        let held = registry.try_acquire(id, 0).unwrap().unwrap();
        let first = queued(registry.acquire_or_enqueue(id, 0).unwrap());
        let orphan = queued(registry.acquire_or_enqueue(id, 0).unwrap());

        drop(held);
        // First is popped and signaled; the orphan stays queued with the
        // slot count at zero, so a retire now succeeds and must drain it.
        assert_eq!(first.wait_until(None), WaitOutcome::Slot);
        registry.retire(id, "etl").unwrap();
        assert_eq!(orphan.wait_until(None), WaitOutcome::Slot);
        assert!(matches!(
            registry.retry_or_requeue(&orphan, 0),
            Err(Error::UnknownGroup(_))
        ));
        assert!(matches!(
            registry.retry_or_requeue(&first, 0),
            Err(Error::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_retry_after_retire_fails_instead_of_requeueing() {
        let (registry, id) = registry_with(1, 0);
        let held = registry.try_acquire(id, 0).unwrap().unwrap();
        let handle = queued(registry.acquire_or_enqueue(id, 0).unwrap());
        drop(held);
        assert_eq!(handle.wait_until(None), WaitOutcome::Slot);

        // Retire lands between the wakeup and the retry. The pinned state
        // is marked retired, so the waiter fails instead of rejoining a
        // queue that nothing will ever drain.
        registry.retire(id, "etl").unwrap();
        assert!(matches!(
            registry.retry_or_requeue(&handle, 0),
            Err(Error::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_memory_counter_never_wraps() {
        // Accounting disabled: no budget, but the counter itself must not
        // wrap on caller-sized requests.
        let (registry, id) = registry_with(0, 0);
        let g1 = registry.try_acquire(id, u64::MAX - 1).unwrap().unwrap();
        assert!(registry.try_acquire(id, 2).unwrap().is_none());
        let g2 = registry.try_acquire(id, 1).unwrap().unwrap();
        drop(g1);
        drop(g2);
        assert_eq!(registry.group_stats(id).unwrap().memory_in_use, 0);
    }

    #[test]
    fn test_materialize_update_keeps_counters() {
        let (registry, id) = registry_with(4, 0);
        let g1 = registry.try_acquire(id, 0).unwrap().unwrap();
        let g2 = registry.try_acquire(id, 0).unwrap().unwrap();

        registry.materialize(id, caps(1, 0));
        let stats = registry.group_stats(id).unwrap();
        assert_eq!(stats.slots_in_use, 2);
        assert_eq!(stats.concurrency_limit, 1);
        // Over the new ceiling: no new grants until both release.
        assert!(registry.try_acquire(id, 0).unwrap().is_none());

        drop(g1);
        assert!(registry.try_acquire(id, 0).unwrap().is_none());
        drop(g2);
        let g = registry.try_acquire(id, 0).unwrap().unwrap();
        assert!(registry.try_acquire(id, 0).unwrap().is_none());
        drop(g);
    }

    #[test]
    fn test_retire_unmaterialized_is_noop() {
        let registry = RuntimeRegistry::new(0);
        registry.retire(GroupId::new(5), "ghost").unwrap();
    }
}
