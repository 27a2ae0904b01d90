//! Turnstile is a library of queued locks with admission-order fairness.
//!
//! The platform lock makes no promise about which waiting thread is granted
//! next; under sustained contention that permits starvation. The locks here
//! grant strictly in arrival order: an exclusive-only ticket mutex (plain
//! and reentrant), and a reader/writer lock whose reader admission batches
//! follow a task-fair or phase-fair policy.
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic, clippy::nursery)]

mod monitor;

pub mod rw;
pub mod ticket;
