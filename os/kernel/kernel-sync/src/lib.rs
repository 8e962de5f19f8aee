//! # Kernel synchronization primitives
//!
//! Everything here assumes a single CPU whose only source of concurrency is
//! interrupts. Taking any lock therefore disables interrupts first, and
//! [`Cpu`] counts how deeply locks are nested so that only the outermost
//! release turns them back on.
//!
//! ```text
//!   lock A            depth 0 -> 1, remember IF=1, cli
//!     lock B          depth 1 -> 2
//!     unlock B        depth 2 -> 1, interrupts stay off
//!   unlock A          depth 1 -> 0, sti
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cpu;
pub mod irq;
mod raw_spin;
mod spin_lock;
mod up_cell;

pub use cpu::Cpu;
pub use irq::InterruptControl;
pub use raw_spin::RawSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use up_cell::{Reentered, UpCell};
