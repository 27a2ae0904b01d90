//! Fair read-write lock.
//!
//! This module implements a reader/writer lock built on an explicit FIFO
//! wait queue. Writers are granted strictly in arrival order; readers are
//! admitted in batches whose composition is governed by a [`Fairness`]
//! policy chosen as a type parameter:
//!
//! - [`TaskFair`]: on release, only the run of readers contiguous with the
//!   queue head is promoted. Readers parked behind an earlier writer wait
//!   for that writer's own turn.
//! - [`PhaseFair`] (the default): on release, every queued reader joins one
//!   phase ahead of the remaining writers, bounding the number of writer
//!   turns between two reader phases to one, and vice versa.
//!
//! Note that rustc currently requires that you at least specify either the
//! fairness policy (and will infer the type of `T`) or the type of `T` (and
//! will use the default `PhaseFair` policy).
//!
//! ```rust
//! # use turnstile::rw::{FairRwLock, TaskFair};
//! #
//! let lock = FairRwLock::<u32>::new(0); // `PhaseFair` is used
//! let lock = FairRwLock::<_, TaskFair>::new(0_u32); // `T` is inferred
//! ```
//!
//! ```rust,compile_fail
//! # use turnstile::rw::FairRwLock;
//! let lock = FairRwLock::new(0);
//! ```
//!
//! # Examples
//!
//! Reads only:
//!
//! ```rust
//! # use turnstile::rw::FairRwLock;
//! #
//! let lock = FairRwLock::<u32>::new(0);
//!
//! let r1 = lock.read();
//! let r2 = lock.read();
//!
//! assert_eq!(*r1, 0);
//! assert_eq!(*r2, 0);
//! ```
//!
//! With a write:
//!
//! ```rust
//! # use turnstile::rw::FairRwLock;
//! #
//! let lock = FairRwLock::<u32>::new(0);
//!
//! {
//!     let mut w = lock.write();
//!     *w = 1;
//! }
//!
//! let r = lock.read();
//!
//! assert_eq!(*r, 1);
//! ```

use crate::monitor::Monitor;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::TaskFair {}
    impl Sealed for super::PhaseFair {}
}

/// Admission policy of a [`FairRwLock`], selected as a type parameter.
///
/// The policy decides which parked readers are promoted when a holder
/// releases. The trait is sealed: the policy set is exactly [`TaskFair`]
/// and [`PhaseFair`].
pub trait Fairness: sealed::Sealed {
    /// Whether a reader promotion batch spans the whole queue (one phase)
    /// rather than only the run contiguous with the head.
    const WHOLE_PHASE: bool;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
/// Promotes only the readers contiguous with the queue head.
pub struct TaskFair;

impl Fairness for TaskFair {
    const WHOLE_PHASE: bool = false;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
/// Promotes every queued reader as one phase, ahead of queued writers.
pub struct PhaseFair;

impl Fairness for PhaseFair {
    const WHOLE_PHASE: bool = true;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// The record of whoever currently holds the lock: one writer, or a batch
/// of readers sharing a count.
struct Holder {
    mode: Mode,
    count: usize,
}

/// One parked acquisition request. The id is the waiter's identity; its
/// disappearance from the queue is the admission signal.
struct Waiter {
    id: u64,
    mode: Mode,
}

struct WaitState {
    holder: Option<Holder>,
    /// Parked requests in arrival order.
    queue: VecDeque<Waiter>,
    next_id: u64,
}

impl WaitState {
    const fn new() -> Self {
        Self {
            holder: None,
            queue: VecDeque::new(),
            next_id: 0,
        }
    }

    fn exclusive_admissible(&self) -> bool {
        self.holder.is_none() && self.queue.is_empty()
    }

    fn shared_admissible(&self) -> bool {
        self.queue.is_empty() && self.holder.as_ref().is_none_or(|h| h.mode == Mode::Shared)
    }

    /// Seats an immediately admissible request in the holder record.
    fn admit(&mut self, mode: Mode) {
        match &mut self.holder {
            None => self.holder = Some(Holder { mode, count: 1 }),
            Some(holder) => {
                debug_assert!(holder.mode == Mode::Shared && mode == Mode::Shared);
                holder.count += 1;
            }
        }
    }

    fn enqueue(&mut self, mode: Mode) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(Waiter { id, mode });
        id
    }

    fn is_queued(&self, id: u64) -> bool {
        self.queue.iter().any(|w| w.id == id)
    }

    /// Folds `n` promoted readers into the holder record.
    fn fold_shared(&mut self, n: usize) {
        match &mut self.holder {
            None => self.holder = Some(Holder { mode: Mode::Shared, count: n }),
            Some(holder) => {
                debug_assert_eq!(holder.mode, Mode::Shared);
                holder.count += n;
            }
        }
    }

    /// The fairness promotion pass.
    ///
    /// Runs with the guard held, right after a holder vacated (or after a
    /// timed-out writer left the head of the line while a reader phase is
    /// active). Decides which parked requests become holders and removes
    /// them from the queue; their owners learn of the admission when they
    /// wake and find their id gone. Returns whether anyone was promoted.
    fn promote(&mut self, whole_phase: bool) -> bool {
        match self.queue.front().map(|w| w.mode) {
            None => false,
            Some(Mode::Exclusive) => {
                // A writer is admitted alone, and only into a vacant lock.
                if self.holder.is_some() {
                    return false;
                }
                self.queue.pop_front();
                self.holder = Some(Holder {
                    mode: Mode::Exclusive,
                    count: 1,
                });
                true
            }
            Some(Mode::Shared) => {
                let admitted = if whole_phase {
                    // One phase: every parked reader, wherever it sits.
                    // Writers keep their relative order.
                    let before = self.queue.len();
                    self.queue.retain(|w| w.mode == Mode::Exclusive);
                    before - self.queue.len()
                } else {
                    let mut run = 0;
                    while self
                        .queue
                        .front()
                        .is_some_and(|w| w.mode == Mode::Shared)
                    {
                        self.queue.pop_front();
                        run += 1;
                    }
                    run
                };
                self.fold_shared(admitted);
                true
            }
        }
    }

    fn release_exclusive(&mut self) {
        debug_assert!(matches!(
            self.holder,
            Some(Holder {
                mode: Mode::Exclusive,
                count: 1
            })
        ));
        self.holder = None;
    }

    /// Releases one shared hold; returns whether the reader phase ended.
    fn release_shared(&mut self) -> bool {
        let Some(holder) = self.holder.as_mut() else {
            debug_assert!(false, "shared release without a holder");
            return false;
        };
        debug_assert_eq!(holder.mode, Mode::Shared);
        debug_assert!(holder.count > 0);
        holder.count -= 1;
        if holder.count == 0 {
            self.holder = None;
            true
        } else {
            false
        }
    }

    /// Removes a timed-out waiter from the line.
    ///
    /// If the waiter was a writer parked directly behind an active reader
    /// phase, its departure merges that phase with the readers parked
    /// behind it; without this, those readers would wait for a writer
    /// release that is never going to happen. Returns whether any waiter
    /// was promoted by the merge.
    fn withdraw(&mut self, id: u64, whole_phase: bool) -> bool {
        let Some(pos) = self.queue.iter().position(|w| w.id == id) else {
            debug_assert!(false, "withdrawing a waiter that is not queued");
            return false;
        };
        let Some(waiter) = self.queue.remove(pos) else {
            return false;
        };

        let behind_reader_phase = self.holder.as_ref().is_some_and(|h| h.mode == Mode::Shared);
        if waiter.mode == Mode::Exclusive && pos == 0 && behind_reader_phase {
            return self.promote(whole_phase);
        }
        false
    }
}

/// A read-write lock with FIFO admission.
///
/// Writers are granted strictly in arrival order; reader admission batches
/// follow the `F` policy (see the module docs). Acquisition that cannot be
/// granted immediately parks in an arrival-order line, and `try_*` methods
/// never overtake it.
pub struct FairRwLock<T, F: Fairness = PhaseFair> {
    monitor: Monitor<WaitState>,
    data: UnsafeCell<T>,
    _policy: PhantomData<F>,
}

// Safety:
// Same bounds as `std::sync::RwLock`: readers on distinct threads share
// `&T` concurrently (hence `T: Sync`), and the writer path moves exclusive
// access between threads (hence `T: Send`).
unsafe impl<T: Send, F: Fairness> Send for FairRwLock<T, F> {}
unsafe impl<T: Send + Sync, F: Fairness> Sync for FairRwLock<T, F> {}

impl<T, F: Fairness> FairRwLock<T, F> {
    #[must_use]
    #[inline]
    /// Creates a new fair read-write lock.
    pub const fn new(data: T) -> Self {
        Self {
            monitor: Monitor::new(WaitState::new()),
            data: UnsafeCell::new(data),
            _policy: PhantomData,
        }
    }

    #[must_use]
    /// Locks for writing, parking until admitted in arrival order.
    pub fn write(&self) -> FairRwLockWriteGuard<'_, T, F> {
        let mut state = self.monitor.lock();
        if state.exclusive_admissible() {
            state.admit(Mode::Exclusive);
            drop(state);
        } else {
            let id = state.enqueue(Mode::Exclusive);
            // The promotion pass seats us in the holder record itself;
            // our id leaving the queue is the grant.
            drop(self.monitor.wait(state, move |s| !s.is_queued(id)));
        }
        FairRwLockWriteGuard { lock: self }
    }

    #[must_use]
    /// Locks for writing only if the lock is vacant and nobody is parked.
    pub fn try_write(&self) -> Option<FairRwLockWriteGuard<'_, T, F>> {
        let mut state = self.monitor.lock();
        if !state.exclusive_admissible() {
            return None;
        }
        state.admit(Mode::Exclusive);
        drop(state);
        Some(FairRwLockWriteGuard { lock: self })
    }

    #[must_use]
    /// Locks for writing, giving up `timeout` from now.
    ///
    /// A `timeout` too large for the clock to represent means waiting
    /// without bound.
    pub fn try_write_for(&self, timeout: Duration) -> Option<FairRwLockWriteGuard<'_, T, F>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_write_until(deadline),
            None => Some(self.write()),
        }
    }

    #[must_use]
    /// Locks for writing, giving up at `deadline`.
    ///
    /// On timeout the request leaves the line; if it was parked directly
    /// behind an active reader phase, the readers parked behind it are
    /// promoted into that phase (see [`Fairness`]). If the grant arrives
    /// in the same instant the deadline expires, admission wins.
    pub fn try_write_until(&self, deadline: Instant) -> Option<FairRwLockWriteGuard<'_, T, F>> {
        let mut state = self.monitor.lock();
        if state.exclusive_admissible() {
            state.admit(Mode::Exclusive);
            drop(state);
            return Some(FairRwLockWriteGuard { lock: self });
        }
        let id = state.enqueue(Mode::Exclusive);
        let (mut state, admitted) =
            self.monitor
                .wait_deadline(state, deadline, move |s| !s.is_queued(id));
        if admitted {
            drop(state);
            Some(FairRwLockWriteGuard { lock: self })
        } else {
            if state.withdraw(id, F::WHOLE_PHASE) {
                self.monitor.broadcast();
            }
            None
        }
    }

    #[must_use]
    /// Locks for reading, parking until admitted.
    ///
    /// Joins an already-admitted reader phase for free when nobody is
    /// parked; otherwise parks and waits for a promotion batch.
    pub fn read(&self) -> FairRwLockReadGuard<'_, T, F> {
        let mut state = self.monitor.lock();
        if state.shared_admissible() {
            state.admit(Mode::Shared);
            drop(state);
        } else {
            let id = state.enqueue(Mode::Shared);
            drop(self.monitor.wait(state, move |s| !s.is_queued(id)));
        }
        FairRwLockReadGuard { lock: self }
    }

    #[must_use]
    /// Locks for reading only if a reader would be admitted immediately.
    pub fn try_read(&self) -> Option<FairRwLockReadGuard<'_, T, F>> {
        let mut state = self.monitor.lock();
        if !state.shared_admissible() {
            return None;
        }
        state.admit(Mode::Shared);
        drop(state);
        Some(FairRwLockReadGuard { lock: self })
    }

    #[must_use]
    /// Locks for reading, giving up `timeout` from now.
    ///
    /// A `timeout` too large for the clock to represent means waiting
    /// without bound.
    pub fn try_read_for(&self, timeout: Duration) -> Option<FairRwLockReadGuard<'_, T, F>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_read_until(deadline),
            None => Some(self.read()),
        }
    }

    #[must_use]
    /// Locks for reading, giving up at `deadline`.
    pub fn try_read_until(&self, deadline: Instant) -> Option<FairRwLockReadGuard<'_, T, F>> {
        let mut state = self.monitor.lock();
        if state.shared_admissible() {
            state.admit(Mode::Shared);
            drop(state);
            return Some(FairRwLockReadGuard { lock: self });
        }
        let id = state.enqueue(Mode::Shared);
        let (mut state, admitted) =
            self.monitor
                .wait_deadline(state, deadline, move |s| !s.is_queued(id));
        if admitted {
            drop(state);
            Some(FairRwLockReadGuard { lock: self })
        } else {
            // A departing reader never unblocks anyone.
            state.withdraw(id, F::WHOLE_PHASE);
            None
        }
    }

    #[must_use]
    #[inline]
    /// Returns a mutable reference to the protected data.
    ///
    /// No locking is needed: the exclusive borrow proves no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[must_use]
    #[inline]
    /// Consumes the lock and returns the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default, F: Fairness> Default for FairRwLock<T, F> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for shared access. The hold is released on drop.
///
/// Shared references to the guard reach the protected data, so the guard is
/// only `Sync` when `T` is:
///
/// ```rust,compile_fail
/// # use turnstile::rw::FairRwLockReadGuard;
/// # use std::cell::Cell;
/// fn require_sync<T: Sync>() {}
/// require_sync::<FairRwLockReadGuard<'static, Cell<u64>>>();
/// ```
pub struct FairRwLockReadGuard<'a, T, F: Fairness = PhaseFair> {
    lock: &'a FairRwLock<T, F>,
}

impl<T, F: Fairness> Deref for FairRwLockReadGuard<'_, T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, F: Fairness> Drop for FairRwLockReadGuard<'_, T, F> {
    fn drop(&mut self) {
        let mut state = self.lock.monitor.lock();
        if state.release_shared() {
            // Phase over; any writer now at the head of the line goes next.
            state.promote(F::WHOLE_PHASE);
            self.lock.monitor.broadcast();
        }
    }
}

/// RAII guard for exclusive access. The hold is released on drop.
pub struct FairRwLockWriteGuard<'a, T, F: Fairness = PhaseFair> {
    lock: &'a FairRwLock<T, F>,
}

impl<T, F: Fairness> Deref for FairRwLockWriteGuard<'_, T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, F: Fairness> DerefMut for FairRwLockWriteGuard<'_, T, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        debug_assert!(self
            .lock
            .monitor
            .lock()
            .holder
            .as_ref()
            .is_some_and(|h| h.mode == Mode::Exclusive));
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, F: Fairness> Drop for FairRwLockWriteGuard<'_, T, F> {
    fn drop(&mut self) {
        let mut state = self.lock.monitor.lock();
        state.release_exclusive();
        state.promote(F::WHOLE_PHASE);
        self.lock.monitor.broadcast();
    }
}
