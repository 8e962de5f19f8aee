//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical page allocation and the kernel's virtual memory manager, the
//! foundation every other memory operation in the kernel rests on.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Virtual Memory Manager (VMM)         │
//! │    • Heap reservation, demand commit on fault       │
//! │    • Explicit device mappings                       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ tables, committed pages
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Memory Manager (PMM)             │
//! │    • Bump allocation from boot regions              │
//! │    • Self-hosting stack of freed pages              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ table and slot access
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper                        │
//! │    • Direct map (kernel) / simulated RAM (tests)    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Memory Manager ([`pmm`])
//!
//! * Seeded once from the sanitized boot memory map.
//! * Counts every page as free, used or unavailable; the three always add up
//!   to the system total.
//! * Fails with an error instead of halting so the caller decides how to die.
//!
//! ### Free-Page Stack ([`free_stack`])
//!
//! Freed pages are stacked inside a virtual window whose backing storage is
//! taken from the very pages being freed.
//!
//! ### Virtual Memory Manager ([`vmm`])
//!
//! * `alloc` reserves heap pages without backing them.
//! * `handle_page_fault` backs a reserved page on the first write.
//! * `map` / `unmap` expose physical device ranges.
//!
//! ## Concurrency
//!
//! Nothing here locks. The kernel runs on a single CPU and calls into these
//! types before threading starts or with interrupts disabled; a preemptive or
//! multi-CPU port needs real locking around them.
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_alloc::{phys_mapper::OffsetPhysMapper, pmm::Pmm, vmm::Vmm};
//! # fn run<U: kernel_vmem::Mmu>(boot: &kernel_info::boot::BootInfo, mmu: &U) -> Result<(), kernel_alloc::vmm::VmmError> {
//! let mapper = OffsetPhysMapper::new(boot.physical_offset);
//! let mut pmm = Pmm::new();
//! pmm.init(boot)?;
//! let mut vmm = Vmm::init(pmm, &mapper, mmu)?;
//! let buffer = vmm.alloc(8192)?;
//! # Ok(()) }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod free_stack;
pub mod phys_mapper;
pub mod pmm;
pub mod vmm;

pub use crate::pmm::{MemoryStats, Pmm, PmmError, PmmFrames};
pub use crate::vmm::{Vmm, VmmError};
