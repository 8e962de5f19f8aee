//! # Virtual Memory Support
//!
//! Mode-independent x86 paging helpers for the kernel memory managers.
//!
//! ## What you get
//! - A raw page-table [`PageEntryBits`] bitfield, including the software
//!   `allocated` marker used for reserved-but-unbacked pages.
//! - A 4 KiB-aligned [`PageTable`] node that reads and writes 4- or 8-byte
//!   entries depending on the paging mode.
//! - A [`Geometry`] describing how a virtual address is sliced per mode and
//!   where each table level shows up through the recursive mapping.
//! - An [`AddressSpace`] that walks, creates and edits tables through those
//!   parameters with a single loop, whatever the number of levels.
//! - A tiny allocator/mapper/MMU interface ([`FrameAlloc`], [`PhysMapper`],
//!   [`Mmu`]) so the walk can run against real hardware or simulated RAM.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! The three supported paging modes only differ in how many levels exist and
//! how many index bits each level consumes:
//!
//! ```text
//! Legacy32  | 31‒22 | 21‒12 | 11‒0   |                    4-byte entries
//!           |  PD   |  PT   | Offset |
//!
//! PAE       | 31‒30 | 29‒21 | 20‒12 | 11‒0   |           8-byte entries
//!           | PDPT  |  PD   |  PT   | Offset |
//!
//! Long      | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |  8-byte entries
//!           | PML4  | PDPT  |  PD   |  PT   | Offset |
//! ```
//!
//! ### Depths
//!
//! Throughout this crate a table's **depth** counts from the root: depth `0`
//! is the table referenced by the root register (PD, PDPT or PML4), and depth
//! `levels - 1` holds the leaf entries mapping 4 KiB pages.
//!
//! ### Recursive mapping
//!
//! One root entry (or, for PAE, four entries of the last page directory)
//! points back into the hierarchy. The MMU then exposes every table node as an
//! ordinary page inside a fixed virtual window, see [`Geometry::table_address`].
//!
//! ### Page states
//!
//! A leaf entry encodes one of three states, see [`PageState`]:
//!
//! | State | present | allocated |
//! |-------|---------|-----------|
//! | Unmapped | 0 | 0 |
//! | Reserved | 0 | 1 |
//! | Backed   | 1 | any |

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod geometry;
mod page_entry_bits;
mod page_fault;
mod page_table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

pub use crate::address_space::{AddressSpace, PageState};
pub use crate::geometry::{Geometry, Level, Recursion};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_fault::PageFaultError;
pub use crate::page_table::PageTable;
pub use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables.
///
/// The implementation decides where frames come from (bump region, free
/// stack, a single donated page). Returned frames **must** be 4 KiB aligned.
pub trait FrameAlloc {
    type Error;

    /// Allocate one 4 KiB *physical* frame. Must return page-aligned frames.
    ///
    /// # Errors
    /// Implementation defined; typically physical memory exhaustion.
    fn alloc_frame(&mut self) -> Result<PhysicalAddress, Self::Error>;
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (e.g., via identity map or a fixed offset).
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current page tables
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Access to the paging unit of the CPU.
pub trait Mmu {
    /// Physical address of the active root table.
    fn root(&self) -> PhysicalAddress;

    /// Load a new root table.
    fn set_root(&self, root: PhysicalAddress);

    /// Drop any cached translation for the page containing `va`.
    fn invalidate(&self, va: VirtualAddress);
}

impl<T: FrameAlloc + ?Sized> FrameAlloc for &mut T {
    type Error = T::Error;

    #[inline]
    fn alloc_frame(&mut self) -> Result<PhysicalAddress, Self::Error> {
        (**self).alloc_frame()
    }
}

/// Borrow the page table stored in frame `phys`.
///
/// # Safety
/// - `phys` must point to a valid 4 KiB page containing a page table.
/// - No other live reference to the same table may be used while the
///   returned one is.
#[inline]
pub(crate) unsafe fn get_table<'a, M: PhysMapper>(m: &M, phys: PhysicalAddress) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(phys) }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// This returns the greatest value `y <= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(4096,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u64`.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(4097,    4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}
