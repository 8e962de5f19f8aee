//! Kernel Virtual Memory Manager (VMM).
//!
//! Owns the single kernel address space and the [`Pmm`] feeding it. Every
//! virtual page moves through
//!
//! ```text
//! UNMAPPED ──alloc──▶ RESERVED ──write fault / commit──▶ BACKED
//!     ▲                                                    │
//!     └────────────────── unmap_page / release ◀───────────┘
//!     └──────────────────────── map_page ────────────────▶ BACKED
//! ```
//!
//! Heap addresses come from a cursor that only moves up; released ranges are
//! never handed out again.
//!
//! # Example
//! ```ignore
//! let mut vmm = Vmm::init(pmm, &mapper, &mmu)?;
//! let buffer = vmm.alloc(3 * 4096)?.expect("non-zero length");
//! // First write to `buffer` faults and commits a zeroed page.
//! ```

use crate::pmm::{MemoryStats, Pmm, PmmError, PmmFrames};
use kernel_info::memory::{AddressLayout, PAGE_SIZE};
use kernel_vmem::{
    AddressSpace, Geometry, Mmu, PageEntryBits, PageFaultError, PageState, PhysMapper,
    PhysicalAddress, VirtualAddress, align_up,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error(transparent)]
    Pmm(#[from] PmmError),
    #[error("{va} is already mapped to {existing}")]
    AlreadyMapped {
        va: VirtualAddress,
        existing: PhysicalAddress,
    },
    #[error("out of virtual space for {requested} bytes")]
    OutOfVirtualSpace { requested: u64 },
    #[error("{0} is not reserved")]
    NotReserved(VirtualAddress),
    #[error("unhandled page fault at {address}: {}", .error.explain())]
    UnhandledPageFault {
        address: VirtualAddress,
        error: PageFaultError,
    },
}

/// Minimal kernel virtual memory manager.
pub struct Vmm<'m, M: PhysMapper, U: Mmu> {
    space: AddressSpace<'m, M>,
    mmu: &'m U,
    pmm: Pmm,
    layout: &'static AddressLayout,
    heap_next: VirtualAddress,
}

impl<'m, M: PhysMapper, U: Mmu> Vmm<'m, M, U> {
    /// Take over the hierarchy the MMU currently runs on.
    ///
    /// Installs the recursive mapping, prepares the table chain for the
    /// first free-stack page and reloads the root.
    ///
    /// # Errors
    /// Physical memory exhaustion while creating tables.
    pub fn init(pmm: Pmm, mapper: &'m M, mmu: &'m U) -> Result<Self, VmmError> {
        let mode = pmm.mode();
        let layout = mode.layout();
        let mut vmm = Self {
            space: AddressSpace::new(mapper, Geometry::of(mode), mmu.root()),
            mmu,
            pmm,
            layout,
            heap_next: layout.heap.start,
        };

        vmm.with_frames(|space, frames| space.install_self_map(frames))?;
        let depth = vmm.space.geometry().leaf_depth();
        vmm.with_frames(|space, frames| space.ensure_table(layout.free_stack.start, depth, frames))?;
        mmu.set_root(vmm.space.root());

        log::info!(
            "{mode:?} paging, {} levels, heap {}..{}, page tables at {}",
            mode.levels(),
            layout.heap.start,
            layout.heap.end,
            layout.page_tables.start
        );
        Ok(vmm)
    }

    fn with_frames<R>(
        &mut self,
        f: impl FnOnce(&AddressSpace<'m, M>, &mut PmmFrames<'_, 'm, M, U>) -> R,
    ) -> R {
        let mut frames = PmmFrames::new(&mut self.pmm, &self.space, self.mmu);
        f(&self.space, &mut frames)
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> &AddressSpace<'m, M> {
        &self.space
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &'m U {
        self.mmu
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &Pmm {
        &self.pmm
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> MemoryStats {
        self.pmm.stats()
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &'static AddressLayout {
        self.layout
    }

    /// Next address [`alloc`](Self::alloc) will hand out.
    #[inline]
    #[must_use]
    pub const fn heap_next(&self) -> VirtualAddress {
        self.heap_next
    }

    /// Take one physical page from the PMM.
    ///
    /// # Errors
    /// See [`Pmm::alloc_page`].
    pub fn alloc_page(&mut self) -> Result<PhysicalAddress, PmmError> {
        self.pmm.alloc_page(&self.space, self.mmu)
    }

    /// Return one physical page to the PMM.
    ///
    /// # Errors
    /// See [`Pmm::free_page`].
    pub fn free_page(&mut self, page: PhysicalAddress) -> Result<(), PmmError> {
        self.pmm.free_page(&self.space, self.mmu, page)
    }

    #[must_use]
    pub fn page_state(&self, va: VirtualAddress) -> PageState {
        self.space.page_state(va)
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.translate(va)
    }

    /// Leaf entry for a backed kernel page.
    fn leaf_entry(&self, va: VirtualAddress, pa: PhysicalAddress) -> PageEntryBits {
        let global = va >= self.layout.kernel_space;
        PageEntryBits::new_leaf(pa).with_global_translation(global)
    }

    /// Reserve `len` bytes (rounded up to whole pages) of kernel heap.
    ///
    /// No physical memory is consumed; each page is backed on its first
    /// write. Returns `None` for a zero-length request.
    ///
    /// # Errors
    /// [`VmmError::OutOfVirtualSpace`] if the heap window is exhausted, or
    /// physical exhaustion while creating tables. A failed request leaves
    /// the heap as it was, apart from tables already created.
    pub fn alloc(&mut self, len: u64) -> Result<Option<VirtualAddress>, VmmError> {
        if len == 0 {
            return Ok(None);
        }

        let begin = self.heap_next;
        let room = self.layout.heap.end.as_u64() - begin.as_u64();
        let bytes = len
            .checked_add(PAGE_SIZE - 1)
            .map(|l| l & !(PAGE_SIZE - 1))
            .filter(|&b| b <= room)
            .ok_or(VmmError::OutOfVirtualSpace { requested: len })?;

        for offset in (0..bytes).step_by(PAGE_SIZE as usize) {
            let va = begin + offset;
            let reserved = self.with_frames(|space, frames| space.set_leaf(va, PageEntryBits::new_reserved(), frames));
            if let Err(error) = reserved {
                log::warn!("reserving {va} failed: {error}");
                for undo in (0..offset).step_by(PAGE_SIZE as usize) {
                    self.unmap_page(begin + undo);
                }
                return Err(error.into());
            }
            self.mmu.invalidate(va);
        }
        self.heap_next = begin + bytes;

        log::debug!("reserved {} pages at {begin}", bytes / PAGE_SIZE);
        Ok(Some(begin))
    }

    /// Map `pa` at `va`, which may be unmapped or reserved.
    ///
    /// # Errors
    /// [`VmmError::AlreadyMapped`] if `va` is backed, or physical exhaustion
    /// while creating tables.
    pub fn map_page(&mut self, pa: PhysicalAddress, va: VirtualAddress) -> Result<(), VmmError> {
        let va = va.page_base();
        if let PageState::Backed(existing) = self.space.page_state(va) {
            log::error!("{va} is already mapped to {existing}");
            return Err(VmmError::AlreadyMapped { va, existing });
        }

        let entry = self.leaf_entry(va, pa.page_base());
        self.with_frames(|space, frames| space.set_leaf(va, entry, frames))?;
        self.mmu.invalidate(va);
        Ok(())
    }

    /// Clear the mapping or reservation of `va` and return what it was.
    pub fn unmap_page(&mut self, va: VirtualAddress) -> PageState {
        let va = va.page_base();
        let previous = self.space.clear_leaf(va);
        self.mmu.invalidate(va);
        PageState::of(previous)
    }

    /// Map the physical range `[pa, pa + len)` into fresh heap space.
    ///
    /// The returned address carries the same in-page offset as `pa`.
    ///
    /// # Errors
    /// As for [`alloc`](Self::alloc) and [`map_page`](Self::map_page).
    pub fn map(&mut self, pa: PhysicalAddress, len: u64) -> Result<Option<VirtualAddress>, VmmError> {
        if len == 0 {
            return Ok(None);
        }

        let begin = pa.page_base();
        let span = align_up(pa.page_offset() + len, PAGE_SIZE);
        let Some(va) = self.alloc(span)? else {
            return Ok(None);
        };

        for offset in (0..span).step_by(PAGE_SIZE as usize) {
            self.map_page(begin + offset, va + offset)?;
        }
        log::debug!("mapped {begin}+{span:#x} at {va}");
        Ok(Some(va + pa.page_offset()))
    }

    /// Unmap every page touched by `[va, va + len)`. The physical pages are
    /// not freed.
    pub fn unmap(&mut self, va: VirtualAddress, len: u64) {
        let begin = va.page_base();
        let span = align_up(va.page_offset() + len, PAGE_SIZE);
        for offset in (0..span).step_by(PAGE_SIZE as usize) {
            self.unmap_page(begin + offset);
        }
    }

    /// Unmap every page touched by `[va, va + len)` and return the backing
    /// pages to the PMM.
    ///
    /// # Errors
    /// See [`Pmm::free_page`].
    pub fn release(&mut self, va: VirtualAddress, len: u64) -> Result<(), VmmError> {
        let begin = va.page_base();
        let span = align_up(va.page_offset() + len, PAGE_SIZE);
        for offset in (0..span).step_by(PAGE_SIZE as usize) {
            if let PageState::Backed(page) = self.unmap_page(begin + offset) {
                self.free_page(page)?;
            }
        }
        Ok(())
    }

    /// Back the reserved page containing `va` right away.
    ///
    /// # Errors
    /// [`VmmError::NotReserved`] if the page is not reserved, or physical
    /// exhaustion.
    pub fn commit(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        let va = va.page_base();
        if self.space.page_state(va) != PageState::Reserved {
            return Err(VmmError::NotReserved(va));
        }
        self.back(va)
    }

    fn back(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        let page = self.alloc_page()?;
        unsafe { self.space.mapper().phys_to_mut::<[u8; PAGE_SIZE as usize]>(page) }.fill(0);

        let entry = self.leaf_entry(va, page);
        self.with_frames(|space, frames| space.set_leaf(va, entry, frames))?;
        self.mmu.invalidate(va);
        log::trace!("committed {page} at {va}");
        Ok(page)
    }

    /// Resolve a page fault at `address`.
    ///
    /// Only a supervisor write to a non-present page is resolved: a reserved
    /// heap page gets a zeroed physical page, a missing table node seen
    /// through the page-table window gets created. Everything else logs the
    /// walk and fails.
    ///
    /// # Errors
    /// [`VmmError::UnhandledPageFault`] for every other fault, or physical
    /// exhaustion.
    pub fn handle_page_fault(
        &mut self,
        address: VirtualAddress,
        error: PageFaultError,
    ) -> Result<(), VmmError> {
        let page = address.page_base();

        if error == PageFaultError::SUPERVISOR_WRITE_NOT_PRESENT {
            if self.layout.page_tables.contains(page) {
                if let Some((depth, covered)) = self.space.geometry().decode_table_window(page) {
                    self.with_frames(|space, frames| space.ensure_table(covered, depth, frames))?;
                    self.mmu.invalidate(page);
                    log::trace!("created depth-{depth} table for {covered}");
                    return Ok(());
                }
            } else if self.space.page_state(page) == PageState::Reserved {
                self.back(page)?;
                return Ok(());
            }
        }

        log::error!("unhandled page fault at {address}: {}", error.explain());
        self.space.log_walk(address);
        Err(VmmError::UnhandledPageFault { address, error })
    }
}
