//! Internal monitor shared by every lock in the crate.
//!
//! Each lock owns exactly one `Monitor<S>`: a guard protecting its queue and
//! counter state, and a single condition signal that every state change
//! broadcasts on. Blocking operations loop on their own predicate, so a
//! spurious wakeup that finds the predicate still false re-blocks instead of
//! proceeding. Timed operations race the predicate against an [`Instant`]
//! deadline, checking the predicate first on every pass.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub(crate) struct Monitor<S> {
    state: Mutex<S>,
    signal: Condvar,
}

impl<S> Monitor<S> {
    pub(crate) const fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            signal: Condvar::new(),
        }
    }

    /// Acquires the internal guard.
    ///
    /// No user code ever runs while the guard is held, so a poisoned state
    /// is still consistent and the poison flag is discarded.
    pub(crate) fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `done` holds, releasing the guard while blocked.
    pub(crate) fn wait<'a>(
        &self,
        mut guard: MutexGuard<'a, S>,
        mut done: impl FnMut(&S) -> bool,
    ) -> MutexGuard<'a, S> {
        while !done(&guard) {
            guard = self
                .signal
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        guard
    }

    /// Blocks until `done` holds or `deadline` passes, whichever comes first.
    ///
    /// Returns `true` when the predicate won. The predicate is re-checked
    /// before the clock on every pass, so a waiter whose turn arrives as its
    /// deadline expires is admitted rather than timed out.
    pub(crate) fn wait_deadline<'a>(
        &self,
        mut guard: MutexGuard<'a, S>,
        deadline: Instant,
        mut done: impl FnMut(&S) -> bool,
    ) -> (MutexGuard<'a, S>, bool) {
        loop {
            if done(&guard) {
                return (guard, true);
            }
            let Some(timeout) = deadline.checked_duration_since(Instant::now()) else {
                return (guard, false);
            };
            (guard, _) = self
                .signal
                .wait_timeout(guard, timeout)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes every blocked waiter; each one re-checks its own predicate.
    pub(crate) fn broadcast(&self) {
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread::spawn;
    use std::time::Duration;

    #[test]
    fn test_wait_deadline_predicate_wins() {
        let monitor = Monitor::new(true);

        // An already-satisfied predicate is admitted even with no time left.
        let deadline = Instant::now();
        let (_guard, admitted) = monitor.wait_deadline(monitor.lock(), deadline, |ready| *ready);
        assert!(admitted);
    }

    #[test]
    fn test_wait_deadline_expires() {
        let monitor = Monitor::new(false);

        let deadline = Instant::now() + Duration::from_millis(20);
        let (_guard, admitted) = monitor.wait_deadline(monitor.lock(), deadline, |ready| *ready);
        assert!(!admitted);
    }

    #[test]
    fn test_wait_sees_broadcast() {
        let monitor = Arc::new(Monitor::new(false));

        let waiter = spawn({
            let monitor = monitor.clone();
            move || {
                let guard = monitor.wait(monitor.lock(), |ready| *ready);
                assert!(*guard);
            }
        });

        *monitor.lock() = true;
        monitor.broadcast();
        waiter.join().unwrap();
    }
}
