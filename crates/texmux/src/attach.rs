//! Attach/detach request protocol.
//!
//! Requests come from any thread and block until the thread that owns the
//! consuming context applies them at the top of its next loop iteration:
//!
//! ```text
//!   controller thread                 render thread (owner)
//!   ─────────────────                 ─────────────────────
//!   request_detach() ──┐              loop {
//!        blocks        ├─ pending ──▶   apply_pending(cb)  ── on_detach()
//!        ◀─────────────┘ resolved  ◀─                       ── attached = false
//!                                       draw / present
//!                                     }
//! ```
//!
//! When both an attach and a detach are pending, the one requested last is
//! applied last, so the controller always settles on the newest intent.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::future::BlockingFuture;

/// Failure reported to a caller blocked on an attach or detach request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("{0} request timed out before the render thread applied it")]
    TimedOut(Intent),
    #[error("attach controller closed; the owning render thread has stopped")]
    Closed,
    #[error("{intent} failed on the owning thread: {reason}")]
    Failed { intent: Intent, reason: String },
}

/// Direction of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Attach,
    Detach,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Attach => f.write_str("attach"),
            Intent::Detach => f.write_str("detach"),
        }
    }
}

/// Hooks invoked on the owning thread while a request is applied.
pub trait AttachCallback {
    type Error: fmt::Display;

    fn on_attach(&mut self) -> Result<(), Self::Error>;
    fn on_detach(&mut self) -> Result<(), Self::Error>;
}

type Ack = Arc<BlockingFuture<(), AttachError>>;

#[derive(Default)]
struct State {
    attached: bool,
    closed: bool,
    attach: Option<Ack>,
    detach: Option<Ack>,
    last: Option<Intent>,
}

impl State {
    fn desired(&self) -> bool {
        match self.last {
            Some(intent) => intent == Intent::Attach,
            None => self.attached,
        }
    }

    fn slot(&mut self, intent: Intent) -> &mut Option<Ack> {
        match intent {
            Intent::Attach => &mut self.attach,
            Intent::Detach => &mut self.detach,
        }
    }
}

/// Coalesces attach/detach requests for one consuming context.
#[derive(Default)]
pub struct AttachController {
    state: Mutex<State>,
}

impl AttachController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the owning thread has attached. Returns immediately if the
    /// controller already settles on attached.
    pub fn request_attach(&self) -> Result<(), AttachError> {
        self.request(Intent::Attach, None)
    }

    pub fn request_detach(&self) -> Result<(), AttachError> {
        self.request(Intent::Detach, None)
    }

    /// Bounded variant of [`request_attach`](Self::request_attach). On timeout
    /// the request is withdrawn, and every caller sharing it gets
    /// [`AttachError::TimedOut`].
    pub fn request_attach_timeout(&self, timeout: Duration) -> Result<(), AttachError> {
        self.request(Intent::Attach, Some(timeout))
    }

    pub fn request_detach_timeout(&self, timeout: Duration) -> Result<(), AttachError> {
        self.request(Intent::Detach, Some(timeout))
    }

    /// Last-applied state. Only meaningful on the owning thread.
    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub fn has_pending(&self) -> bool {
        let state = self.lock();
        state.attach.is_some() || state.detach.is_some()
    }

    /// Seeds the applied state from the owning thread, e.g. when the context
    /// starts out holding the resource.
    pub fn mark_attached(&self, attached: bool) {
        self.lock().attached = attached;
    }

    /// Applies pending requests in request order and resolves their waiters.
    /// A request that matches the applied state resolves without a callback.
    ///
    /// Must run on the owning thread. The callbacks run under the controller
    /// lock and must not call back into the controller. Returns the first
    /// callback failure; the matching waiter receives [`AttachError::Failed`]
    /// and the applied state is left unchanged for that request.
    pub fn apply_pending<C: AttachCallback>(&self, callback: &mut C) -> Result<(), C::Error> {
        let mut state = self.lock();
        let order = match state.last {
            Some(Intent::Detach) => [Intent::Attach, Intent::Detach],
            _ => [Intent::Detach, Intent::Attach],
        };
        state.last = None;

        let mut first_error = None;
        for intent in order {
            let Some(ack) = state.slot(intent).take() else {
                continue;
            };
            if state.attached == (intent == Intent::Attach) {
                let _ = ack.set(());
                continue;
            }
            let result = match intent {
                Intent::Attach => callback.on_attach(),
                Intent::Detach => callback.on_detach(),
            };
            match result {
                Ok(()) => {
                    state.attached = intent == Intent::Attach;
                    let _ = ack.set(());
                    tracing::debug!(%intent, "attach request applied");
                }
                Err(err) => {
                    tracing::warn!(%intent, error = %err, "attach request failed");
                    let _ = ack.set_error(AttachError::Failed {
                        intent,
                        reason: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fails every pending request with [`AttachError::Closed`] and rejects new
    /// ones. Called by the owning thread on teardown.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.last = None;
        for ack in [state.attach.take(), state.detach.take()].into_iter().flatten() {
            let _ = ack.set_error(AttachError::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn request(&self, intent: Intent, timeout: Option<Duration>) -> Result<(), AttachError> {
        let ack = {
            let mut state = self.lock();
            if state.closed {
                return Err(AttachError::Closed);
            }
            let wants_attached = intent == Intent::Attach;
            let existing = state.slot(intent).clone();
            match existing {
                Some(ack) => {
                    state.last = Some(intent);
                    ack
                }
                None if state.desired() == wants_attached => return Ok(()),
                None => {
                    let ack: Ack = Arc::new(BlockingFuture::new());
                    *state.slot(intent) = Some(Arc::clone(&ack));
                    state.last = Some(intent);
                    ack
                }
            }
        };

        let Some(timeout) = timeout else {
            return ack.get();
        };
        match ack.get_timeout(timeout) {
            Some(outcome) => outcome,
            None => self.withdraw(intent, &ack),
        }
    }

    /// Removes a request whose caller gave up. If the owning thread applied it
    /// in the meantime, that outcome is returned instead.
    fn withdraw(&self, intent: Intent, ack: &Ack) -> Result<(), AttachError> {
        let mut state = self.lock();
        let pending = state
            .slot(intent)
            .as_ref()
            .is_some_and(|installed| Arc::ptr_eq(installed, ack));
        if !pending {
            drop(state);
            return ack.get();
        }
        state.slot(intent).take();
        if state.last == Some(intent) {
            state.last = match intent {
                Intent::Attach if state.detach.is_some() => Some(Intent::Detach),
                Intent::Detach if state.attach.is_some() => Some(Intent::Attach),
                _ => None,
            };
        }
        drop(state);
        let _ = ack.set_error(AttachError::TimedOut(intent));
        tracing::debug!(%intent, "timed-out request withdrawn");
        Err(AttachError::TimedOut(intent))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AttachController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("AttachController")
            .field("attached", &state.attached)
            .field("attach_pending", &state.attach.is_some())
            .field("detach_pending", &state.detach.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Intent>,
        fail_attach: bool,
    }

    impl AttachCallback for Recorder {
        type Error = String;

        fn on_attach(&mut self) -> Result<(), String> {
            self.calls.push(Intent::Attach);
            if self.fail_attach {
                Err("no texture".into())
            } else {
                Ok(())
            }
        }

        fn on_detach(&mut self) -> Result<(), String> {
            self.calls.push(Intent::Detach);
            Ok(())
        }
    }

    fn wait_for_pending(controller: &AttachController) {
        while !controller.has_pending() {
            thread::yield_now();
        }
    }

    #[test]
    fn requests_matching_current_state_return_immediately() {
        let controller = AttachController::new();
        controller.request_detach().unwrap();
        controller.mark_attached(true);
        controller.request_attach().unwrap();
        assert!(!controller.has_pending());
    }

    #[test]
    fn attach_blocks_until_applied() {
        let controller = Arc::new(AttachController::new());
        let requester = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.request_attach())
        };
        wait_for_pending(&controller);

        let mut recorder = Recorder::default();
        controller.apply_pending(&mut recorder).unwrap();
        assert_eq!(requester.join().unwrap(), Ok(()));
        assert_eq!(recorder.calls, vec![Intent::Attach]);
        assert!(controller.is_attached());
    }

    #[test]
    fn identical_requests_share_one_pending_slot() {
        let controller = Arc::new(AttachController::new());
        let requesters: Vec<_> = (0..3)
            .map(|_| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || controller.request_attach())
            })
            .collect();
        wait_for_pending(&controller);
        // Give the remaining requesters a chance to join the same slot.
        thread::sleep(Duration::from_millis(20));

        let mut recorder = Recorder::default();
        controller.apply_pending(&mut recorder).unwrap();
        for requester in requesters {
            assert_eq!(requester.join().unwrap(), Ok(()));
        }
        let attaches = recorder
            .calls
            .iter()
            .filter(|intent| **intent == Intent::Attach)
            .count();
        assert_eq!(attaches, 1);
        assert!(controller.is_attached());
    }

    #[test]
    fn detach_then_attach_applies_detach_first() {
        let controller = Arc::new(AttachController::new());
        controller.mark_attached(true);

        let detach = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.request_detach())
        };
        wait_for_pending(&controller);
        let attach = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.request_attach())
        };
        while controller.lock().attach.is_none() {
            thread::yield_now();
        }

        let mut recorder = Recorder::default();
        controller.apply_pending(&mut recorder).unwrap();
        assert_eq!(recorder.calls, vec![Intent::Detach, Intent::Attach]);
        assert!(controller.is_attached());
        assert_eq!(detach.join().unwrap(), Ok(()));
        assert_eq!(attach.join().unwrap(), Ok(()));
    }

    #[test]
    fn attach_then_detach_settles_detached() {
        let controller = Arc::new(AttachController::new());

        let attach = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.request_attach())
        };
        wait_for_pending(&controller);
        let detach = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.request_detach())
        };
        while controller.lock().detach.is_none() {
            thread::yield_now();
        }

        let mut recorder = Recorder::default();
        controller.apply_pending(&mut recorder).unwrap();
        assert_eq!(recorder.calls, vec![Intent::Attach, Intent::Detach]);
        assert!(!controller.is_attached());
        assert_eq!(attach.join().unwrap(), Ok(()));
        assert_eq!(detach.join().unwrap(), Ok(()));
    }

    #[test]
    fn failed_callback_reaches_the_waiter() {
        let controller = Arc::new(AttachController::new());
        let requester = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.request_attach())
        };
        wait_for_pending(&controller);

        let mut recorder = Recorder {
            fail_attach: true,
            ..Recorder::default()
        };
        assert_eq!(
            controller.apply_pending(&mut recorder),
            Err("no texture".to_string())
        );
        assert!(!controller.is_attached());
        assert!(matches!(
            requester.join().unwrap(),
            Err(AttachError::Failed {
                intent: Intent::Attach,
                ..
            })
        ));
    }

    #[test]
    fn close_releases_blocked_callers() {
        let controller = Arc::new(AttachController::new());
        let requester = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.request_attach())
        };
        wait_for_pending(&controller);
        controller.close();
        assert_eq!(requester.join().unwrap(), Err(AttachError::Closed));
        assert_eq!(controller.request_attach(), Err(AttachError::Closed));
    }

    #[test]
    fn timed_out_request_is_withdrawn() {
        let controller = AttachController::new();
        assert_eq!(
            controller.request_attach_timeout(Duration::from_millis(10)),
            Err(AttachError::TimedOut(Intent::Attach))
        );
        assert!(!controller.has_pending());
        let mut recorder = Recorder::default();
        controller.apply_pending(&mut recorder).unwrap();
        assert!(recorder.calls.is_empty());
        assert!(!controller.is_attached());

        // The withdrawn intent no longer counts as the desired state.
        let requester = {
            let controller = Arc::new(controller);
            let remote = Arc::clone(&controller);
            let handle = thread::spawn(move || remote.request_attach());
            wait_for_pending(&controller);
            controller.apply_pending(&mut recorder).unwrap();
            handle
        };
        assert_eq!(requester.join().unwrap(), Ok(()));
        assert_eq!(recorder.calls, vec![Intent::Attach]);
    }

    #[test]
    fn withdrawn_detach_leaves_the_earlier_attach_in_charge() {
        let controller = Arc::new(AttachController::new());
        let attach = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.request_attach())
        };
        wait_for_pending(&controller);
        assert_eq!(
            controller.request_detach_timeout(Duration::from_millis(10)),
            Err(AttachError::TimedOut(Intent::Detach))
        );

        let mut recorder = Recorder::default();
        controller.apply_pending(&mut recorder).unwrap();
        assert_eq!(recorder.calls, vec![Intent::Attach]);
        assert!(controller.is_attached());
        assert_eq!(attach.join().unwrap(), Ok(()));
    }

    #[test]
    fn settled_requests_skip_their_callback() {
        let controller = Arc::new(AttachController::new());
        let spawn_request = |intent: Intent| {
            let controller = Arc::clone(&controller);
            thread::spawn(move || match intent {
                Intent::Attach => controller.request_attach(),
                Intent::Detach => controller.request_detach(),
            })
        };

        // attach, detach, then attach again joining the first slot.
        let first = spawn_request(Intent::Attach);
        wait_for_pending(&controller);
        let detach = spawn_request(Intent::Detach);
        while controller.lock().detach.is_none() {
            thread::yield_now();
        }
        let second = spawn_request(Intent::Attach);
        while controller.lock().last != Some(Intent::Attach) {
            thread::yield_now();
        }

        let mut recorder = Recorder::default();
        controller.apply_pending(&mut recorder).unwrap();
        assert_eq!(recorder.calls, vec![Intent::Attach]);
        assert!(controller.is_attached());
        for requester in [first, detach, second] {
            assert_eq!(requester.join().unwrap(), Ok(()));
        }
    }
}
