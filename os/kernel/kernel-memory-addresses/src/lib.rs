//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the page-frame
//! allocator, the page-table walker and the kernel heap.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address translated through the active page tables. |
//! | [`PhysicalAddress`] | A RAM or MMIO address as seen on the memory bus. |
//!
//! Both are `#[repr(transparent)]` over `u64`, so they cost nothing at runtime
//! while making it impossible to hand a virtual address to code expecting a
//! physical frame (and vice versa).
//!
//! The kernel only ever maps 4 KiB pages. [`PAGE_SIZE`] and [`PAGE_SHIFT`]
//! describe that granularity and back the `page_*` helpers on both types.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xE000_1234);
//! assert_eq!(va.page_base().as_u64(), 0xE000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let pa = PhysicalAddress::new(0x0010_2000);
//! assert!(pa.is_page_aligned());
//! assert_eq!((pa + PAGE_SIZE).as_u64(), 0x0010_3000);
//! ```
//!
//! Addresses are always 64 bits wide, even when the paging mode only
//! translates 32 bits. The mode decides which bits matter.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`, i.e. the number of in-page offset bits.
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);
