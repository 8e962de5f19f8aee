//! # Cooperative Kernel Scheduler
//!
//! Kernel threads on a single CPU, switched only when the running thread
//! yields, blocks on a [`Semaphore`] or takes a timer tick.
//!
//! ```text
//!            spawn            yield / tick
//!   (none) ───────► READY ◄──────────────── RUNNING
//!                     │  ───────────────────►  │  │
//!                     │       scheduled        │  │ exit
//!              wakeup │                  lock  │  ▼
//!                  SUSPENDED ◄─────────────────┘ EXITED ──► reaped
//! ```
//!
//! ## Lock hand-off
//!
//! The scheduler lock is taken by the thread that switches away and released
//! by the thread that runs next: either on return from its own earlier
//! switch, or in the entry trampoline of a thread running for the first time
//! ([`ThreadStart::release`]). Architecture code sits behind [`Platform`].
//!
//! ## Hosted emulation
//!
//! With the `hosted` feature, [`hosted`] runs each kernel thread on a std
//! thread and passes a baton on every switch so exactly one of them runs.

#![cfg_attr(not(any(test, feature = "hosted")), no_std)]
#![allow(unsafe_code)]

mod error;
mod platform;
mod queue;
mod scheduler;
mod semaphore;
mod thread;

#[cfg(any(test, feature = "hosted"))]
pub mod hosted;

pub use error::SchedError;
pub use platform::{Platform, StackAllocator};
pub use scheduler::Scheduler;
pub use semaphore::Semaphore;
pub use thread::{Blocker, Stack, ThreadEntry, ThreadId, ThreadPhase, ThreadStart, ThreadState};

/// Capacity of the thread table.
pub const MAX_THREADS: usize = 64;
