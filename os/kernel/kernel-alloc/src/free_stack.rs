//! # Self-Hosting Free-Page Stack
//!
//! Freed physical pages are recorded in an array that lives in a fixed
//! virtual window, and that array is stored *inside the freed pages
//! themselves*:
//!
//! ```text
//!  free-stack window
//!  ┌──────────────┬──────────────┬─────────┐
//!  │ stack page 0 │ stack page 1 │ unbacked │ ...
//!  └──────┬───────┴──────┬───────┴─────────┘
//!         │ backed by    │ backed by
//!         ▼              ▼
//!     slot 0 = P0     slot 0 = P1       (each backing page is its own first entry)
//! ```
//!
//! - **grow**: when the top sits on a page boundary, the page being freed is
//!   mapped at the top and becomes the storage for the next entries. Should
//!   the window's leaf table itself be missing, the page is donated as that
//!   table node instead. Growth therefore never allocates.
//! - **shrink**: when a pop lands on a page boundary, the entry just read is
//!   the backing page; it is unmapped before being handed out.
//!
//! Entries are read and written through the address space's translation, so
//! the stack behaves the same over real hardware and simulated RAM.

use crate::PmmError;
use kernel_vmem::info::{PagingMode, Window};
use kernel_vmem::{
    AddressSpace, FrameAlloc, Mmu, PageEntryBits, PageState, PhysMapper, PhysicalAddress, VirtualAddress,
};

/// Outcome of [`FreePageStack::push`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Push {
    /// The page is on the stack and free.
    Stored,
    /// The page was needed as a page-table node for the stack window and is
    /// now in use.
    ConsumedAsTable,
}

pub struct FreePageStack {
    window: Window,
    top: VirtualAddress,
    width: u64,
}

impl FreePageStack {
    /// An empty stack in the free-stack window of `mode`.
    #[must_use]
    pub const fn for_mode(mode: PagingMode) -> Self {
        let window = mode.layout().free_stack;
        Self {
            window,
            top: window.start,
            width: mode.entry_size(),
        }
    }

    /// Number of recorded pages.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        (self.top.as_u64() - self.window.start.as_u64()) / self.width
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.top.as_u64() == self.window.start.as_u64()
    }

    /// Address of the next free slot.
    #[inline]
    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        self.top
    }

    #[must_use]
    pub const fn window(&self) -> Window {
        self.window
    }

    /// Record `page` as free.
    ///
    /// # Errors
    /// [`PmmError::FreeStackOverflow`] if the window is full,
    /// [`PmmError::FreeStackCorrupted`] if the window's mappings disagree with
    /// the stack's bookkeeping.
    pub fn push<M: PhysMapper, U: Mmu>(
        &mut self,
        space: &AddressSpace<'_, M>,
        mmu: &U,
        page: PhysicalAddress,
    ) -> Result<Push, PmmError> {
        if self.top.as_u64() >= self.window.end.as_u64() {
            return Err(PmmError::FreeStackOverflow);
        }

        if self.top.is_page_aligned() && !self.grow(space, mmu, page)? {
            return Ok(Push::ConsumedAsTable);
        }

        self.write(space, self.top, page)?;
        self.top += self.width;
        Ok(Push::Stored)
    }

    /// Take the most recently freed page.
    ///
    /// # Errors
    /// [`PmmError::FreeStackCorrupted`] if the window's mappings disagree with
    /// the stack's bookkeeping.
    pub fn pop<M: PhysMapper, U: Mmu>(
        &mut self,
        space: &AddressSpace<'_, M>,
        mmu: &U,
    ) -> Result<Option<PhysicalAddress>, PmmError> {
        if self.is_empty() {
            return Ok(None);
        }

        self.top = VirtualAddress::new(self.top.as_u64() - self.width);
        let page = self.read(space, self.top)?;
        if self.top.is_page_aligned() {
            self.shrink(space, mmu, page)?;
        }
        Ok(Some(page))
    }

    /// Back the stack page at `top` with `page`.
    ///
    /// Returns `false` if `page` went into the table chain instead. The page
    /// at `top` must be unmapped; anything else means the window was written
    /// behind the stack's back and `page` is left with the caller.
    fn grow<M: PhysMapper, U: Mmu>(
        &self,
        space: &AddressSpace<'_, M>,
        mmu: &U,
        page: PhysicalAddress,
    ) -> Result<bool, PmmError> {
        let corrupted = PmmError::FreeStackCorrupted { at: self.top };
        let mut donor = Donor(Some(page));
        let depth = space.geometry().leaf_depth();
        let chain = space.ensure_table(self.top, depth, &mut donor);
        if donor.0.is_none() {
            log::trace!("free page {page} donated as a table for {}", self.top);
            return Ok(false);
        }
        chain.map_err(|_| corrupted)?;

        if space.page_state(self.top) != PageState::Unmapped {
            log::error!("free stack top {} is already mapped", self.top);
            return Err(corrupted);
        }
        space
            .replace_leaf(self.top, PageEntryBits::new_leaf(page))
            .ok_or(corrupted)?;
        mmu.invalidate(self.top);
        log::trace!("free stack grew at {} onto {page}", self.top);
        Ok(true)
    }

    fn shrink<M: PhysMapper, U: Mmu>(
        &self,
        space: &AddressSpace<'_, M>,
        mmu: &U,
        page: PhysicalAddress,
    ) -> Result<(), PmmError> {
        let backing = space.clear_leaf(self.top);
        mmu.invalidate(self.top);
        if !backing.present() || backing.physical_address() != page {
            return Err(PmmError::FreeStackCorrupted { at: self.top });
        }
        log::trace!("free stack shrank at {}", self.top);
        Ok(())
    }

    fn slot<M: PhysMapper>(
        space: &AddressSpace<'_, M>,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, PmmError> {
        space
            .translate(va)
            .ok_or(PmmError::FreeStackCorrupted { at: va })
    }

    fn read<M: PhysMapper>(
        &self,
        space: &AddressSpace<'_, M>,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, PmmError> {
        let pa = Self::slot(space, va)?;
        let raw = unsafe {
            if self.width == 4 {
                u64::from(*space.mapper().phys_to_mut::<u32>(pa))
            } else {
                *space.mapper().phys_to_mut::<u64>(pa)
            }
        };
        Ok(PhysicalAddress::new(raw))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write<M: PhysMapper>(
        &self,
        space: &AddressSpace<'_, M>,
        va: VirtualAddress,
        page: PhysicalAddress,
    ) -> Result<(), PmmError> {
        let pa = Self::slot(space, va)?;
        unsafe {
            if self.width == 4 {
                debug_assert!(page.as_u64() <= u64::from(u32::MAX));
                *space.mapper().phys_to_mut::<u32>(pa) = page.as_u64() as u32;
            } else {
                *space.mapper().phys_to_mut::<u64>(pa) = page.as_u64();
            }
        }
        Ok(())
    }
}

/// Frame source that can hand out exactly one page.
struct Donor(Option<PhysicalAddress>);

struct DonorSpent;

impl FrameAlloc for Donor {
    type Error = DonorSpent;

    fn alloc_frame(&mut self) -> Result<PhysicalAddress, DonorSpent> {
        self.0.take().ok_or(DonorSpent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::testing::{BumpFrames, RecordingMmu, SimulatedRam};
    use kernel_vmem::{Geometry, PAGE_SIZE};

    fn bare(ram: &SimulatedRam, mode: PagingMode) -> AddressSpace<'_, SimulatedRam> {
        let mut frames = BumpFrames::new(0x1000, 0x8_0000);
        let root = frames.alloc_frame().unwrap();
        AddressSpace::new(ram, Geometry::of(mode), root)
    }

    fn pages(range: core::ops::Range<u64>) -> impl Iterator<Item = PhysicalAddress> {
        range.step_by(4096).map(PhysicalAddress::new)
    }

    #[test]
    fn slot_zero_holds_the_backing_page() {
        let ram = SimulatedRam::new();
        let space = bare(&ram, PagingMode::Long);
        let mmu = RecordingMmu::new(space.root());
        let mut stack = FreePageStack::for_mode(PagingMode::Long);
        let start = stack.window().start;

        // Three pages build the PDPT, PD and PT for the window.
        for page in pages(0x10_0000..0x10_3000) {
            assert_eq!(stack.push(&space, &mmu, page), Ok(Push::ConsumedAsTable));
        }
        assert!(stack.is_empty());

        let backing = PhysicalAddress::new(0x10_3000);
        assert_eq!(stack.push(&space, &mmu, backing), Ok(Push::Stored));
        assert_eq!(space.page_state(start), PageState::Backed(backing));
        assert_eq!(ram.read_u64(backing), backing.as_u64());
        assert!(mmu.was_invalidated(start));
    }

    #[test]
    fn crossing_a_page_boundary_maps_and_unmaps() {
        let ram = SimulatedRam::new();
        let space = bare(&ram, PagingMode::Legacy32);
        let mmu = RecordingMmu::new(space.root());
        let mut stack = FreePageStack::for_mode(PagingMode::Legacy32);
        let start = stack.window().start;

        // One donated leaf table, then 1024 four-byte entries per stack page.
        let mut stored = Vec::new();
        for page in pages(0x10_0000..0x10_0000 + 1026 * PAGE_SIZE) {
            if stack.push(&space, &mmu, page).unwrap() == Push::Stored {
                stored.push(page);
            }
        }
        assert_eq!(stored.len(), 1025);
        assert_eq!(stack.len(), 1025);
        let second = start + PAGE_SIZE;
        assert_eq!(space.page_state(second), PageState::Backed(stored[1024]));

        assert_eq!(stack.pop(&space, &mmu), Ok(Some(stored.pop().unwrap())));
        assert_eq!(space.page_state(second), PageState::Unmapped);
        assert!(mmu.was_invalidated(second));

        // LIFO down to the first stack page's own backing page.
        while let Some(page) = stack.pop(&space, &mmu).unwrap() {
            assert_eq!(Some(page), stored.pop());
        }
        assert!(stored.is_empty());
        assert_eq!(space.page_state(start), PageState::Unmapped);
    }

    #[test]
    fn mismatched_backing_is_reported() {
        let ram = SimulatedRam::new();
        let space = bare(&ram, PagingMode::Pae);
        let mmu = RecordingMmu::new(space.root());
        let mut stack = FreePageStack::for_mode(PagingMode::Pae);
        let start = stack.window().start;

        let mut frames = BumpFrames::new(0x8_0000, 0x9_0000);
        space.ensure_table(start, 2, &mut frames).unwrap();
        stack
            .push(&space, &mmu, PhysicalAddress::new(0x20_0000))
            .unwrap();

        space.replace_leaf(start, PageEntryBits::new_leaf(PhysicalAddress::new(0x30_0000)));
        assert_eq!(
            stack.pop(&space, &mmu),
            Err(PmmError::FreeStackCorrupted { at: start })
        );
    }

    #[test]
    fn mapped_window_top_is_not_taken_for_a_table() {
        let ram = SimulatedRam::new();
        let space = bare(&ram, PagingMode::Long);
        let mmu = RecordingMmu::new(space.root());
        let mut stack = FreePageStack::for_mode(PagingMode::Long);
        let start = stack.window().start;

        // a stray mapping where the next stack page should go
        let stray = PhysicalAddress::new(0x30_0000);
        let mut frames = BumpFrames::new(0x8_0000, 0x9_0000);
        space
            .set_leaf(start, PageEntryBits::new_leaf(stray), &mut frames)
            .unwrap();

        let page = PhysicalAddress::new(0x20_0000);
        assert_eq!(
            stack.push(&space, &mmu, page),
            Err(PmmError::FreeStackCorrupted { at: start })
        );
        assert!(stack.is_empty());
        assert_eq!(space.page_state(start), PageState::Backed(stray));
        assert!(!mmu.was_invalidated(start));
    }
}
