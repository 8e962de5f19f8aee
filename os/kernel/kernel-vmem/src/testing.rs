//! Hosted stand-ins for physical memory, the paging unit and frame sources.
//!
//! Used by this crate's unit tests and, through the `testing` feature, by the
//! memory managers built on top of it.

use crate::{FrameAlloc, Mmu, PageTable, PhysMapper, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, UnsafeCell};
use core::ptr::NonNull;

/// Sparse physical memory. Frames spring into existence zero-filled on first
/// access and are released when the RAM is dropped.
pub struct SimulatedRam {
    frames: UnsafeCell<BTreeMap<u64, NonNull<PageTable>>>,
}

impl Default for SimulatedRam {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRam {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: UnsafeCell::new(BTreeMap::new()),
        }
    }

    fn frame(&self, base: u64) -> NonNull<PageTable> {
        // The map only ever grows and nodes are boxed, so pointers handed out
        // earlier stay valid.
        let frames = unsafe { &mut *self.frames.get() };
        *frames
            .entry(base)
            .or_insert_with(|| NonNull::from(Box::leak(Box::new(PageTable::zeroed()))))
    }

    /// Number of frames touched so far.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        unsafe { &*self.frames.get() }.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn byte_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let base = self.frame(pa.page_base().as_u64());
        unsafe { base.as_ptr().cast::<u8>().add(pa.page_offset() as usize) }
    }

    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        assert!(pa.page_offset() + 8 <= PAGE_SIZE);
        unsafe { self.byte_ptr(pa).cast::<u64>().read_unaligned() }
    }

    pub fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        assert!(pa.page_offset() + 8 <= PAGE_SIZE);
        unsafe { self.byte_ptr(pa).cast::<u64>().write_unaligned(value) }
    }

    pub fn fill(&self, pa: PhysicalAddress, byte: u8) {
        let page = pa.page_base();
        unsafe { core::ptr::write_bytes(self.byte_ptr(page), byte, 4096) }
    }
}

impl PhysMapper for SimulatedRam {
    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.page_offset() as usize + size_of::<T>() <= 4096);
        unsafe { &mut *self.byte_ptr(pa).cast::<T>() }
    }
}

impl Drop for SimulatedRam {
    fn drop(&mut self) {
        for (_, frame) in core::mem::take(self.frames.get_mut()) {
            drop(unsafe { Box::from_raw(frame.as_ptr()) });
        }
    }
}

/// Paging unit that remembers what it was asked to do.
pub struct RecordingMmu {
    root: Cell<PhysicalAddress>,
    invalidated: RefCell<Vec<VirtualAddress>>,
}

impl RecordingMmu {
    #[must_use]
    pub const fn new(root: PhysicalAddress) -> Self {
        Self {
            root: Cell::new(root),
            invalidated: RefCell::new(Vec::new()),
        }
    }

    /// Total number of invalidations seen.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidated.borrow().len()
    }

    #[must_use]
    pub fn last_invalidated(&self) -> Option<VirtualAddress> {
        self.invalidated.borrow().last().copied()
    }

    /// Whether the page containing `va` was ever invalidated.
    #[must_use]
    pub fn was_invalidated(&self, va: VirtualAddress) -> bool {
        self.invalidated.borrow().contains(&va.page_base())
    }
}

impl Mmu for RecordingMmu {
    fn root(&self) -> PhysicalAddress {
        self.root.get()
    }

    fn set_root(&self, root: PhysicalAddress) {
        self.root.set(root);
    }

    fn invalidate(&self, va: VirtualAddress) {
        self.invalidated.borrow_mut().push(va.page_base());
    }
}

/// Frame source handing out consecutive frames from `[start, end)`.
#[derive(Debug)]
pub struct BumpFrames {
    next: u64,
    end: u64,
    allocated: u64,
}

/// [`BumpFrames`] ran past the end of its range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfFrames;

impl BumpFrames {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            next: start,
            end,
            allocated: 0,
        }
    }

    /// Frames handed out so far.
    #[must_use]
    pub const fn allocated(&self) -> u64 {
        self.allocated
    }
}

impl FrameAlloc for BumpFrames {
    type Error = OutOfFrames;

    fn alloc_frame(&mut self) -> Result<PhysicalAddress, OutOfFrames> {
        if self.next + PAGE_SIZE > self.end {
            return Err(OutOfFrames);
        }
        let frame = PhysicalAddress::new(self.next);
        self.next += PAGE_SIZE;
        self.allocated += 1;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_frames_start_zeroed_and_keep_writes() {
        let ram = SimulatedRam::new();
        let pa = PhysicalAddress::new(0x5008);
        assert_eq!(ram.read_u64(pa), 0);
        ram.write_u64(pa, 0xDEAD_BEEF);
        assert_eq!(ram.read_u64(pa), 0xDEAD_BEEF);
        assert_eq!(ram.frame_count(), 1);

        ram.fill(pa, 0xFF);
        assert_eq!(ram.read_u64(PhysicalAddress::new(0x5FF8)), u64::MAX);
    }

    #[test]
    fn bump_frames_stop_at_the_end() {
        let mut frames = BumpFrames::new(0x1000, 0x3000);
        assert_eq!(frames.alloc_frame(), Ok(PhysicalAddress::new(0x1000)));
        assert_eq!(frames.alloc_frame(), Ok(PhysicalAddress::new(0x2000)));
        assert_eq!(frames.alloc_frame(), Err(OutOfFrames));
        assert_eq!(frames.allocated(), 2);
    }
}
