use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// Violation of a [`ThreadAffinityGuard`].
///
/// These are programmer errors: every variant means a thread-bound handle was
/// reached from the wrong place, never a transient condition worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AffinityError {
    #[error("{guard}: already bound to thread '{label}' ({thread:?})")]
    AlreadyInitialized {
        guard: String,
        thread: ThreadId,
        label: String,
    },
    #[error("{guard}: not bound to any thread")]
    NotInitialized { guard: String },
    #[error("{guard}: called on {actual:?}, expected thread '{expected_label}' ({expected:?})")]
    WrongThread {
        guard: String,
        expected: ThreadId,
        expected_label: String,
        actual: ThreadId,
    },
}

#[derive(Debug, Clone)]
struct Binding {
    thread: ThreadId,
    label: String,
}

/// Runtime assertion that a resource is only touched from the thread that
/// bound it.
#[derive(Debug)]
pub struct ThreadAffinityGuard {
    name: String,
    binding: Mutex<Option<Binding>>,
}

impl ThreadAffinityGuard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binding: Mutex::new(None),
        }
    }

    /// Binds the guard to the calling thread.
    pub fn init(&self) -> Result<(), AffinityError> {
        let mut binding = self.lock();
        if let Some(bound) = binding.as_ref() {
            return Err(AffinityError::AlreadyInitialized {
                guard: self.name.clone(),
                thread: bound.thread,
                label: bound.label.clone(),
            });
        }
        let current = thread::current();
        *binding = Some(Binding {
            thread: current.id(),
            label: current.name().unwrap_or("<unnamed>").to_string(),
        });
        Ok(())
    }

    /// Fails unless the calling thread is the bound thread.
    pub fn check(&self) -> Result<(), AffinityError> {
        let binding = self.lock();
        self.check_binding(binding.as_ref())
    }

    /// Clears the binding; only the bound thread may do this.
    pub fn deinit(&self) -> Result<(), AffinityError> {
        let mut binding = self.lock();
        self.check_binding(binding.as_ref())?;
        *binding = None;
        Ok(())
    }

    /// Drops the binding regardless of the calling thread. Used when the bound
    /// thread is known to be gone.
    pub fn force_clear(&self) {
        *self.lock() = None;
    }

    pub fn bound_thread(&self) -> Option<ThreadId> {
        self.lock().as_ref().map(|binding| binding.thread)
    }

    pub fn is_current(&self) -> bool {
        self.bound_thread() == Some(thread::current().id())
    }

    fn check_binding(&self, binding: Option<&Binding>) -> Result<(), AffinityError> {
        let Some(binding) = binding else {
            return Err(AffinityError::NotInitialized {
                guard: self.name.clone(),
            });
        };
        let actual = thread::current().id();
        if binding.thread != actual {
            let err = AffinityError::WrongThread {
                guard: self.name.clone(),
                expected: binding.thread,
                expected_label: binding.label.clone(),
                actual,
            };
            tracing::error!(%err, "thread affinity violated");
            return Err(err);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Binding>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn check_before_init_is_rejected() {
        let guard = ThreadAffinityGuard::new("texture");
        assert!(matches!(
            guard.check(),
            Err(AffinityError::NotInitialized { .. })
        ));
        assert!(matches!(
            guard.deinit(),
            Err(AffinityError::NotInitialized { .. })
        ));
    }

    #[test]
    fn double_init_is_rejected() {
        let guard = ThreadAffinityGuard::new("texture");
        guard.init().unwrap();
        assert!(matches!(
            guard.init(),
            Err(AffinityError::AlreadyInitialized { .. })
        ));
        guard.deinit().unwrap();
        guard.init().unwrap();
    }

    #[test]
    fn foreign_thread_sees_expected_identity() {
        let guard = Arc::new(ThreadAffinityGuard::new("texture"));
        guard.init().unwrap();
        let owner = thread::current().id();

        let remote = Arc::clone(&guard);
        let (check, deinit) = thread::Builder::new()
            .name("intruder".into())
            .spawn(move || (remote.check(), remote.deinit()))
            .unwrap()
            .join()
            .unwrap();

        match check {
            Err(AffinityError::WrongThread {
                expected, actual, ..
            }) => {
                assert_eq!(expected, owner);
                assert_ne!(actual, owner);
            }
            other => panic!("unexpected check result: {other:?}"),
        }
        assert!(matches!(deinit, Err(AffinityError::WrongThread { .. })));
        assert!(guard.check().is_ok());
    }

    #[test]
    fn force_clear_releases_binding_from_any_thread() {
        let guard = Arc::new(ThreadAffinityGuard::new("texture"));
        guard.init().unwrap();
        let remote = Arc::clone(&guard);
        thread::spawn(move || remote.force_clear()).join().unwrap();
        assert_eq!(guard.bound_thread(), None);
    }
}
