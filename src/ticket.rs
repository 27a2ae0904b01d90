//! Ticket lock implementation.
//!
//! This module implements a FIFO-fair mutex: every arrival draws a ticket
//! from a monotonically increasing counter and is admitted exactly when the
//! serving counter reaches its ticket, so waiters are granted strictly in
//! arrival order and no thread can be starved by the scheduler's whims.
//!
//! Unlike a spinning ticket lock, waiters here park on a condition signal,
//! which also makes deadline-bounded acquisition (`try_lock_for` /
//! `try_lock_until`) possible. A timed-out waiter abandons the ticket it
//! drew; the serving counter skips abandoned tickets on release, so a
//! timeout never wedges the line for the tickets drawn after it.
//!
//! # Example
//!
//! ```rust
//! # use turnstile::ticket::TicketMutex;
//! let lock = TicketMutex::new(0);
//!
//! let mut guard = lock.lock();
//! *guard = 42;
//! assert_eq!(*guard, 42);
//! ```
//!
//! [`ReentrantTicketMutex`] keeps the same FIFO discipline between threads
//! while letting the owning thread re-enter without re-queuing. Its guard
//! hands out `&T` rather than `&mut T`: two live guards on the same thread
//! would otherwise alias a `&mut`.

use crate::monitor::Monitor;
use std::cell::{Cell, UnsafeCell};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// The ticket pair.
///
/// The lock is free iff `next == serving`; a waiter holding ticket `t` is
/// admitted exactly when `serving == t`.
struct Counters {
    /// Ticket handed to the next arrival.
    next: u64,
    /// Ticket currently being served.
    serving: u64,
    /// Tickets abandoned by timed-out waiters, all in `(serving, next)`.
    abandoned: BTreeSet<u64>,
}

impl Counters {
    const fn new() -> Self {
        Self {
            next: 0,
            serving: 0,
            abandoned: BTreeSet::new(),
        }
    }

    fn free(&self) -> bool {
        self.next == self.serving
    }

    /// Draws a ticket, reserving a position in the line.
    fn draw(&mut self) -> u64 {
        let ticket = self.next;
        self.next += 1;
        ticket
    }

    /// Advances the line to the next ticket still owned by a live waiter.
    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }

    /// Gives up a drawn ticket whose turn has not come.
    ///
    /// The position stays reserved until `advance` lands on it; skipping it
    /// there is what keeps later tickets reachable.
    fn abandon(&mut self, ticket: u64) {
        debug_assert!(self.serving < ticket && ticket < self.next);
        self.abandoned.insert(ticket);
    }
}

/// A FIFO-fair mutex.
///
/// Grants are strictly in arrival order: `lock` draws a ticket and parks
/// until the serving counter reaches it, and `try_lock` only succeeds when
/// nobody is ahead, so it can never jump the queue.
pub struct TicketMutex<T> {
    monitor: Monitor<Counters>,
    data: UnsafeCell<T>,
}

// Safety:
// Same bounds as `std::sync::Mutex`: the lock hands out `&mut T` to one
// thread at a time, which is moving `T` between threads, never sharing it.
unsafe impl<T: Send> Send for TicketMutex<T> {}
unsafe impl<T: Send> Sync for TicketMutex<T> {}

impl<T> TicketMutex<T> {
    #[must_use]
    #[inline]
    /// Creates a new ticket mutex.
    pub const fn new(data: T) -> Self {
        Self {
            monitor: Monitor::new(Counters::new()),
            data: UnsafeCell::new(data),
        }
    }

    fn guard(&self) -> TicketMutexGuard<'_, T> {
        TicketMutexGuard {
            lock: self,
            _not_auto_sync: PhantomData,
        }
    }

    #[must_use]
    /// Locks the mutex, parking until every earlier arrival has released.
    pub fn lock(&self) -> TicketMutexGuard<'_, T> {
        let mut counters = self.monitor.lock();
        let ticket = counters.draw();
        drop(self.monitor.wait(counters, |c| c.serving == ticket));
        self.guard()
    }

    #[must_use]
    /// Locks the mutex only if the line is empty.
    ///
    /// This is the admission test alone: it never overtakes a parked waiter.
    pub fn try_lock(&self) -> Option<TicketMutexGuard<'_, T>> {
        let mut counters = self.monitor.lock();
        if !counters.free() {
            return None;
        }
        counters.draw();
        drop(counters);
        Some(self.guard())
    }

    #[must_use]
    /// Locks the mutex, giving up `timeout` from now.
    ///
    /// A `timeout` too large for the clock to represent means waiting
    /// without bound.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<TicketMutexGuard<'_, T>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => Some(self.lock()),
        }
    }

    #[must_use]
    /// Locks the mutex, giving up at `deadline`.
    ///
    /// The ticket is reserved up front; on timeout it is abandoned and the
    /// serving counter will skip it. If this waiter's turn arrives in the
    /// same instant the deadline expires, admission wins and the lock is
    /// acquired.
    pub fn try_lock_until(&self, deadline: Instant) -> Option<TicketMutexGuard<'_, T>> {
        let mut counters = self.monitor.lock();
        let ticket = counters.draw();
        let (mut counters, admitted) =
            self.monitor
                .wait_deadline(counters, deadline, |c| c.serving == ticket);
        if admitted {
            drop(counters);
            Some(self.guard())
        } else {
            counters.abandon(ticket);
            None
        }
    }

    #[inline]
    /// Locks the mutex and calls the closure with the protected data.
    pub fn with_locked<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.lock();
        f(&mut guard)
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
    /// Consumes the mutex and returns the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for TicketMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for [`TicketMutex`]. The lock is released on drop.
///
/// Shared references to the guard reach the protected data, so the guard is
/// only `Sync` when `T` is:
///
/// ```rust,compile_fail
/// # use turnstile::ticket::TicketMutexGuard;
/// # use std::cell::Cell;
/// fn require_sync<T: Sync>() {}
/// require_sync::<TicketMutexGuard<'static, Cell<u64>>>();
/// ```
pub struct TicketMutexGuard<'a, T> {
    lock: &'a TicketMutex<T>,
    /// Keeps the guard out of the auto `Sync` impl; see below.
    _not_auto_sync: PhantomData<Cell<()>>,
}

// Safety:
// Same bounds as `std::sync::MutexGuard`: `&TicketMutexGuard` dereferences
// to `&T`, so sharing the guard across threads shares the data.
unsafe impl<T: Sync> Sync for TicketMutexGuard<'_, T> {}

impl<T> Drop for TicketMutexGuard<'_, T> {
    fn drop(&mut self) {
        let mut counters = self.lock.monitor.lock();
        counters.advance();
        self.lock.monitor.broadcast();
    }
}

impl<T> Deref for TicketMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TicketMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// State of a [`ReentrantTicketMutex`]: the ticket line plus the owner
/// record that lets the holding thread bypass it.
struct ReentrantState {
    counters: Counters,
    owner: Option<ThreadId>,
    depth: usize,
}

impl ReentrantState {
    const fn new() -> Self {
        Self {
            counters: Counters::new(),
            owner: None,
            depth: 0,
        }
    }
}

/// A FIFO-fair mutex the owning thread may re-acquire.
///
/// Re-entry by the owner never draws a ticket and never waits; every other
/// thread queues in strict arrival order exactly as with [`TicketMutex`].
/// The lock is released once every guard held by the owner is dropped.
pub struct ReentrantTicketMutex<T> {
    monitor: Monitor<ReentrantState>,
    data: UnsafeCell<T>,
}

// Safety:
// The guard only ever hands out `&T`, and only on one thread at a time, so
// sharing the lock across threads moves `T` access around but never aliases
// it mutably. `T: Send` is what that requires.
unsafe impl<T: Send> Send for ReentrantTicketMutex<T> {}
unsafe impl<T: Send> Sync for ReentrantTicketMutex<T> {}

impl<T> ReentrantTicketMutex<T> {
    #[must_use]
    #[inline]
    /// Creates a new reentrant ticket mutex.
    pub const fn new(data: T) -> Self {
        Self {
            monitor: Monitor::new(ReentrantState::new()),
            data: UnsafeCell::new(data),
        }
    }

    fn guard(&self) -> ReentrantTicketGuard<'_, T> {
        ReentrantTicketGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Records first admission by `tid`.
    fn enter(state: &mut ReentrantState, tid: ThreadId) {
        debug_assert!(state.owner.is_none() && state.depth == 0);
        state.owner = Some(tid);
        state.depth = 1;
    }

    #[must_use]
    /// Locks the mutex, parking until every earlier arrival has released.
    ///
    /// If the calling thread already owns the lock, this nests immediately
    /// without drawing a ticket.
    pub fn lock(&self) -> ReentrantTicketGuard<'_, T> {
        let tid = thread::current().id();
        let mut state = self.monitor.lock();
        if state.owner == Some(tid) {
            debug_assert!(state.depth > 0);
            state.depth += 1;
            drop(state);
            return self.guard();
        }
        let ticket = state.counters.draw();
        let mut state = self
            .monitor
            .wait(state, |s| s.counters.serving == ticket);
        Self::enter(&mut state, tid);
        drop(state);
        self.guard()
    }

    #[must_use]
    /// Locks the mutex only if the calling thread already owns it or the
    /// line is empty.
    pub fn try_lock(&self) -> Option<ReentrantTicketGuard<'_, T>> {
        let tid = thread::current().id();
        let mut state = self.monitor.lock();
        if state.owner == Some(tid) {
            debug_assert!(state.depth > 0);
            state.depth += 1;
        } else {
            if !state.counters.free() {
                return None;
            }
            state.counters.draw();
            Self::enter(&mut state, tid);
        }
        drop(state);
        Some(self.guard())
    }

    #[must_use]
    /// Locks the mutex, giving up `timeout` from now.
    ///
    /// A `timeout` too large for the clock to represent means waiting
    /// without bound.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<ReentrantTicketGuard<'_, T>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => Some(self.lock()),
        }
    }

    #[must_use]
    /// Locks the mutex, giving up at `deadline`.
    ///
    /// Re-entry by the owner succeeds regardless of the deadline; otherwise
    /// this behaves like [`TicketMutex::try_lock_until`].
    pub fn try_lock_until(&self, deadline: Instant) -> Option<ReentrantTicketGuard<'_, T>> {
        let tid = thread::current().id();
        let mut state = self.monitor.lock();
        if state.owner == Some(tid) {
            debug_assert!(state.depth > 0);
            state.depth += 1;
            drop(state);
            return Some(self.guard());
        }
        let ticket = state.counters.draw();
        let (mut state, admitted) =
            self.monitor
                .wait_deadline(state, deadline, |s| s.counters.serving == ticket);
        if admitted {
            Self::enter(&mut state, tid);
            drop(state);
            Some(self.guard())
        } else {
            state.counters.abandon(ticket);
            None
        }
    }

    #[must_use]
    #[inline]
    /// Returns a mutable reference to the protected data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[must_use]
    #[inline]
    /// Consumes the mutex and returns the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for ReentrantTicketMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for [`ReentrantTicketMutex`].
///
/// Dereferences to `&T` only; see the module docs for why. The guard stays
/// on the thread that acquired it, since the re-entry depth it releases is
/// tracked per owning thread.
pub struct ReentrantTicketGuard<'a, T> {
    lock: &'a ReentrantTicketMutex<T>,
    /// Pins the guard to its thread.
    _not_send: PhantomData<*const ()>,
}

impl<T> Drop for ReentrantTicketGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.monitor.lock();
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        debug_assert!(state.depth > 0);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            state.counters.advance();
            self.lock.monitor.broadcast();
        }
    }
}

impl<T> Deref for ReentrantTicketGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}
