//! # Kernel
//!
//! Ties the memory managers, the scheduler and interrupt dispatch together
//! into one [`Kernel`] context, and carries the x86-64 backend that boots it.
//!
//! ```text
//!             ┌──────────────────────────────┐
//!  IRQ / trap │ interrupt stubs (arch)       │
//!  ──────────▶│   save InterruptContext      │
//!             └──────────────┬───────────────┘
//!                            ▼
//!             ┌──────────────────────────────┐      ┌──────────────┐
//!             │ Kernel::dispatch             │─14──▶│ Memory (VMM) │
//!             │   PIC mask / EOI / unmask    │      └──────────────┘
//!             │   InterruptTable lookup      │─32──▶┌──────────────┐
//!             └──────────────┬───────────────┘      │ Scheduler    │
//!                            │ Err(Fatal)           └──────────────┘
//!                            ▼
//!                     Kernel::halt
//! ```
//!
//! ## Errors
//!
//! Nothing below this crate halts on its own. Memory exhaustion, page
//! faults that cannot be resolved and scheduler invariant violations all
//! surface as a [`Fatal`], and only [`Kernel::halt`] turns one into a
//! stopped CPU.
//!
//! ## Single CPU
//!
//! The kernel assumes one CPU and cooperative scheduling. The scheduler and
//! every semaphore have their own spinlock; the memory managers are only
//! guarded against re-entry through [`kernel_sync::UpCell`]. A multi-CPU
//! port needs real locking around [`Memory`].

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

pub mod arch;
mod fatal;
pub mod interrupts;
mod kernel;
mod memory;
pub mod services;
mod stacks;

pub use crate::fatal::Fatal;
pub use crate::interrupts::{
    Handler, InterruptContext, InterruptTable, IrqController, RegisterError, ServiceRoutine,
};
pub use crate::kernel::{Arch, Kernel, KernelScheduler};
pub use crate::memory::Memory;
pub use crate::stacks::KernelStacks;
