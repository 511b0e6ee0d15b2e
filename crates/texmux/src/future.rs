//! Single-assignment blocking result cell.
//!
//! `BlockingFuture` is the only handshake primitive used between the
//! controlling thread and a render thread: it carries the outcome of context
//! creation, the completion of teardown, and the acknowledgement of attach and
//! detach requests. It is a oneshot cell built on `Mutex` + `Condvar`; waiters
//! sleep on the condition variable and never spin.

use std::convert::Infallible;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Misuse of a [`BlockingFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FutureError {
    /// A second `set`/`set_error` was attempted on a completed cell.
    #[error("future already completed")]
    AlreadyCompleted,
}

enum Slot<T, E> {
    Pending,
    Resolved(T),
    Failed(E),
}

impl<T, E> Slot<T, E> {
    fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending)
    }
}

/// Blocking cell completed exactly once with a value or an error.
///
/// Any number of threads may block in [`get`](Self::get); all of them wake up
/// when the cell transitions and observe the same outcome. The owner may
/// [`reset`](Self::reset) the cell back to pending once the outcome has been
/// read, which lets a single cell serve repeated handoffs.
pub struct BlockingFuture<T, E = Infallible> {
    slot: Mutex<Slot<T, E>>,
    ready: Condvar,
}

impl<T, E> BlockingFuture<T, E> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    /// Completes the cell with `value`.
    pub fn set(&self, value: T) -> Result<(), FutureError> {
        self.complete(Slot::Resolved(value))
    }

    /// Completes the cell with `error`.
    pub fn set_error(&self, error: E) -> Result<(), FutureError> {
        self.complete(Slot::Failed(error))
    }

    pub fn is_complete(&self) -> bool {
        !self.lock().is_pending()
    }

    /// Blocks until the cell completes, discarding the outcome.
    pub fn wait(&self) {
        let guard = self.lock();
        let _guard = self
            .ready
            .wait_while(guard, |slot| slot.is_pending())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Returns the cell to pending so it can be completed again.
    pub fn reset(&self) {
        *self.lock() = Slot::Pending;
    }

    fn complete(&self, outcome: Slot<T, E>) -> Result<(), FutureError> {
        let mut slot = self.lock();
        if !slot.is_pending() {
            return Err(FutureError::AlreadyCompleted);
        }
        *slot = outcome;
        drop(slot);
        self.ready.notify_all();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T, E>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone, E: Clone> BlockingFuture<T, E> {
    /// Blocks until the cell completes and returns its outcome.
    pub fn get(&self) -> Result<T, E> {
        let mut guard = self.lock();
        loop {
            if let Some(outcome) = Self::outcome(&guard) {
                return outcome;
            }
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`, returning `None`
    /// if the cell is still pending.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        let guard = self.lock();
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |slot| slot.is_pending())
            .unwrap_or_else(PoisonError::into_inner);
        Self::outcome(&guard)
    }

    /// Returns the outcome without blocking.
    pub fn try_get(&self) -> Option<Result<T, E>> {
        Self::outcome(&self.lock())
    }

    fn outcome(slot: &Slot<T, E>) -> Option<Result<T, E>> {
        match slot {
            Slot::Pending => None,
            Slot::Resolved(value) => Some(Ok(value.clone())),
            Slot::Failed(error) => Some(Err(error.clone())),
        }
    }
}

impl<T, E> Default for BlockingFuture<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for BlockingFuture<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            Slot::Pending => "pending",
            Slot::Resolved(_) => "resolved",
            Slot::Failed(_) => "failed",
        };
        f.debug_struct("BlockingFuture")
            .field("state", &state)
            .finish()
    }
}
