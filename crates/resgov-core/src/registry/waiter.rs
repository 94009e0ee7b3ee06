//! Waiter queue machinery: wakeup delivery and cancellation.
//!
//! Each blocked admission request owns one end of an unbounded crossbeam
//! channel. Releasers pop the queue head and send [`Wakeup::Slot`] under the
//! group mutex; cancellation sends [`Wakeup::Cancel`] from outside. Putting
//! both on one channel is what makes the grant/cancel race resolvable: the
//! waiter observes exactly one message first and the other path (if any) is
//! forwarded, never dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use resgov_common::types::GroupId;

use super::RuntimeGroupState;

/// Message delivered to a blocked waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A slot was released and this waiter is next in FIFO order. The waiter
    /// re-runs its admission check; this is a signal, not a grant.
    Slot,
    /// The request was cancelled by its session or an external deadline.
    Cancel,
}

/// Outcome of one blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken for a retry.
    Slot,
    /// Cancelled while blocked.
    Cancel,
    /// The deadline elapsed first.
    TimedOut,
}

/// Queue entry shared between the group's deque and the waiting session.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) tx: Sender<Wakeup>,
}

/// A session's position in one group's wait queue.
///
/// Returned by [`RuntimeRegistry::acquire_or_enqueue`] when the group is
/// busy; the owning session blocks on [`wait_until`](Self::wait_until) and
/// must hand the handle back via [`RuntimeRegistry::dequeue`] on every exit
/// path that did not consume a granted retry.
///
/// [`RuntimeRegistry::acquire_or_enqueue`]: super::RuntimeRegistry::acquire_or_enqueue
/// [`RuntimeRegistry::dequeue`]: super::RuntimeRegistry::dequeue
#[derive(Debug)]
pub struct WaiterHandle {
    pub(crate) group_id: GroupId,
    pub(crate) state: Arc<RuntimeGroupState>,
    pub(crate) waiter: Arc<Waiter>,
    pub(crate) rx: Receiver<Wakeup>,
}

impl WaiterHandle {
    /// The group this waiter is queued against.
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Blocks until woken, cancelled, or past `deadline` (`None` waits
    /// forever). Cooperative suspension on the channel; no spinning.
    #[must_use]
    pub fn wait_until(&self, deadline: Option<Instant>) -> WaitOutcome {
        let received = match deadline {
            Some(deadline) => self.rx.recv_deadline(deadline),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Wakeup::Slot) => WaitOutcome::Slot,
            Ok(Wakeup::Cancel) => WaitOutcome::Cancel,
            // Timeout, or the registry side vanished entirely.
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

/// Cloneable cancellation handle for one admission request.
///
/// Safe to trigger from any thread; cancelling an idle token is a no-op.
/// The flag persists across requeues, so a request cancelled between two
/// waits still observes the cancellation before blocking again.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Sender<Wakeup>>>>,
}

impl CancelToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation, interrupting a blocked wait if one is attached.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(tx) = self.waker.lock().as_ref() {
            // The waiter may have already exited; a closed channel is fine.
            let _ = tx.send(Wakeup::Cancel);
        }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Routes future [`cancel`](Self::cancel) calls to this waiter.
    pub fn attach(&self, handle: &WaiterHandle) {
        *self.waker.lock() = Some(handle.waiter.tx.clone());
    }

    /// Detaches the current waiter; the flag remains as-is.
    pub fn detach(&self) {
        *self.waker.lock() = None;
    }
}

pub(crate) fn new_waiter() -> (Arc<Waiter>, Receiver<Wakeup>) {
    let (tx, rx) = unbounded();
    (Arc::new(Waiter { tx }), rx)
}
