//! # Address Space
//!
//! Mode-independent helpers to walk and edit the **single** kernel address
//! space rooted at the table referenced by the root register.
//!
//! ## Highlights
//!
//! - [`AddressSpace::ensure_table`] allocates and links missing tables down to
//!   a given depth; every new table is zeroed before it becomes reachable.
//! - [`AddressSpace::set_leaf`] / [`AddressSpace::clear_leaf`] edit 4 KiB
//!   leaf entries and hand back the previous entry.
//! - [`AddressSpace::page_state`] classifies a virtual page as unmapped,
//!   reserved or backed.
//! - [`AddressSpace::install_self_map`] sets up the recursive mapping that
//!   exposes table nodes inside the page-table window.
//!
//! ## Safety
//!
//! - Mutating active mappings requires appropriate **TLB maintenance**; this
//!   type never touches the MMU, callers invalidate through [`Mmu`](crate::Mmu).
//! - The provided `PhysMapper` must yield **writable** references to table
//!   frames. References obtained from it never outlive a single entry access,
//!   so allocators may themselves walk this address space in between.

use crate::geometry::Recursion;
use crate::{FrameAlloc, Geometry, PageEntryBits, PhysMapper, PhysicalAddress, VirtualAddress, get_table};

/// Lifecycle state of one virtual page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageState {
    /// No leaf entry, or an empty one.
    Unmapped,
    /// Handed out by `vmm_alloc`; backed on the first write fault.
    Reserved,
    /// Mapped to the given physical page.
    Backed(PhysicalAddress),
}

impl PageState {
    #[must_use]
    pub const fn of(entry: PageEntryBits) -> Self {
        if entry.present() {
            Self::Backed(entry.physical_address())
        } else if entry.allocated() {
            Self::Reserved
        } else {
            Self::Unmapped
        }
    }
}

/// Handle to the kernel address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    mapper: &'m M,
    geometry: Geometry,
    root: PhysicalAddress,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    #[must_use]
    pub const fn new(mapper: &'m M, geometry: Geometry, root: PhysicalAddress) -> Self {
        Self {
            mapper,
            geometry,
            root,
        }
    }

    /// Physical address of the root table.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    fn entry(&self, table: PhysicalAddress, index: usize) -> PageEntryBits {
        let width = self.geometry.entry_width();
        unsafe { get_table(self.mapper, table) }.get(index, width)
    }

    #[inline]
    fn write_entry(&self, table: PhysicalAddress, index: usize, entry: PageEntryBits) {
        let width = self.geometry.entry_width();
        unsafe { get_table(self.mapper, table) }.set(index, width, entry);
    }

    #[inline]
    fn zero_table(&self, table: PhysicalAddress) {
        unsafe { get_table(self.mapper, table) }.zero();
    }

    /// Physical frame of the table at `depth` covering `va`, if it exists.
    ///
    /// Depth `0` is the root and always exists.
    #[must_use]
    pub fn find_table(&self, va: VirtualAddress, depth: usize) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for d in 0..depth {
            let e = self.entry(table, self.geometry.index(d, va));
            if !e.present() {
                return None;
            }
            table = e.physical_address();
        }
        Some(table)
    }

    /// Physical frame of the table at `depth` covering `va`, creating every
    /// missing table on the way.
    ///
    /// New tables are zeroed and linked present+writable (present only for
    /// PAE PDPT entries). Creating a PAE page directory also installs its
    /// recursive back-link.
    ///
    /// # Errors
    /// Propagates the allocator's error. Tables created before the failure
    /// stay linked.
    pub fn ensure_table<A: FrameAlloc>(
        &self,
        va: VirtualAddress,
        depth: usize,
        alloc: &mut A,
    ) -> Result<PhysicalAddress, A::Error> {
        let mut table = self.root;
        for d in 0..depth {
            let index = self.geometry.index(d, va);
            let e = self.entry(table, index);
            if e.present() {
                table = e.physical_address();
                continue;
            }

            let frame = alloc.alloc_frame()?;
            self.zero_table(frame);
            self.write_entry(table, index, self.geometry.table_link(d, frame));
            if d == 0 {
                self.link_pae_directory(index, frame);
            }
            log::trace!("new depth-{} table {frame} for {va}", d + 1);
            table = frame;
        }
        Ok(table)
    }

    /// Make PAE page directory `index` visible in the page-table window.
    fn link_pae_directory(&self, index: usize, directory: PhysicalAddress) {
        let Recursion::PaeDirectories {
            directory: holder,
            first_slot,
        } = self.geometry.recursion
        else {
            return;
        };

        let top = self.geometry.levels()[0];
        let holder_va = VirtualAddress::new((holder as u64) << top.shift);
        if let Some(holder) = self.find_table(holder_va, 1) {
            self.write_entry(holder, first_slot + index, PageEntryBits::new_table(directory, true));
        }
    }

    /// Install the recursive mapping for this mode.
    ///
    /// For PAE this creates the holding page directory if needed and links
    /// every page directory present at that point; later ones are linked by
    /// [`ensure_table`](Self::ensure_table).
    ///
    /// # Errors
    /// Propagates the allocator's error.
    pub fn install_self_map<A: FrameAlloc>(&self, alloc: &mut A) -> Result<(), A::Error> {
        match self.geometry.recursion {
            Recursion::RootSlot(slot) => {
                self.write_entry(self.root, slot, PageEntryBits::new_table(self.root, true));
            }
            Recursion::PaeDirectories { directory, .. } => {
                let top = self.geometry.levels()[0];
                let holder_va = VirtualAddress::new((directory as u64) << top.shift);
                self.ensure_table(holder_va, 1, alloc)?;

                for index in 0..(1usize << top.bits) {
                    let e = self.entry(self.root, index);
                    if e.present() {
                        self.link_pae_directory(index, e.physical_address());
                    }
                }
            }
        }
        Ok(())
    }

    /// The leaf entry for `va`, or `None` if its leaf table does not exist.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let depth = self.geometry.leaf_depth();
        let table = self.find_table(va, depth)?;
        Some(self.entry(table, self.geometry.index(depth, va)))
    }

    #[must_use]
    pub fn page_state(&self, va: VirtualAddress) -> PageState {
        self.leaf(va).map_or(PageState::Unmapped, PageState::of)
    }

    /// Write the leaf entry for `va`, creating missing tables, and return the
    /// entry it replaced.
    ///
    /// # Errors
    /// Propagates the allocator's error.
    pub fn set_leaf<A: FrameAlloc>(
        &self,
        va: VirtualAddress,
        entry: PageEntryBits,
        alloc: &mut A,
    ) -> Result<PageEntryBits, A::Error> {
        let depth = self.geometry.leaf_depth();
        let table = self.ensure_table(va, depth, alloc)?;
        let index = self.geometry.index(depth, va);
        let previous = self.entry(table, index);
        self.write_entry(table, index, entry);
        Ok(previous)
    }

    /// Write the leaf entry for `va` if its leaf table exists.
    ///
    /// Returns the replaced entry, or `None` if nothing was written.
    pub fn replace_leaf(&self, va: VirtualAddress, entry: PageEntryBits) -> Option<PageEntryBits> {
        let depth = self.geometry.leaf_depth();
        let table = self.find_table(va, depth)?;
        let index = self.geometry.index(depth, va);
        let previous = self.entry(table, index);
        self.write_entry(table, index, entry);
        Some(previous)
    }

    /// Clear the leaf entry for `va` and return what it held.
    pub fn clear_leaf(&self, va: VirtualAddress) -> PageEntryBits {
        self.replace_leaf(va, PageEntryBits::new())
            .unwrap_or_else(PageEntryBits::new)
    }

    /// Translate `va` to a physical address if its page is backed.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let e = self.leaf(va)?;
        if e.present() {
            Some(e.physical_address() + va.page_offset())
        } else {
            None
        }
    }

    /// Log every entry on the walk to `va`.
    pub fn log_walk(&self, va: VirtualAddress) {
        let mut table = self.root;
        log::error!("walk {va} from root {table}");
        for depth in 0..self.geometry.levels().len() {
            let index = self.geometry.index(depth, va);
            let e = self.entry(table, index);
            log::error!("  depth {depth} [{index:>4}] = {:#018x}", e.into_bits());
            if !e.present() {
                return;
            }
            table = e.physical_address();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::PagingMode;
    use crate::testing::{BumpFrames, SimulatedRam};

    const MODES: [PagingMode; 3] = [PagingMode::Legacy32, PagingMode::Pae, PagingMode::Long];

    fn space<'a>(ram: &'a SimulatedRam, mode: PagingMode, frames: &mut BumpFrames) -> AddressSpace<'a, SimulatedRam> {
        let root = frames.alloc_frame().unwrap();
        AddressSpace::new(ram, Geometry::of(mode), root)
    }

    #[test]
    fn recursive_window_resolves_to_the_table_frames() {
        for mode in MODES {
            let ram = SimulatedRam::new();
            let mut frames = BumpFrames::new(0x10_0000, 0x20_0000);
            let aspace = space(&ram, mode, &mut frames);
            aspace.install_self_map(&mut frames).unwrap();

            let va = mode.layout().heap.start + 0x42_0000;
            aspace
                .set_leaf(va, PageEntryBits::new_leaf(PhysicalAddress::new(0x7000)), &mut frames)
                .unwrap();

            let g = aspace.geometry();
            for depth in 0..g.levels().len() {
                let Some(window) = g.table_address(depth, va) else {
                    continue;
                };
                let table = aspace.find_table(va, depth).unwrap();
                assert_eq!(aspace.translate(window), Some(table), "{mode:?} depth {depth}");
            }
        }
    }

    #[test]
    fn pae_directories_created_later_are_linked() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x10_0000, 0x20_0000);
        let aspace = space(&ram, PagingMode::Pae, &mut frames);
        aspace.install_self_map(&mut frames).unwrap();

        // Directory 0 does not exist yet.
        let low = VirtualAddress::new(0x0040_0000);
        assert_eq!(aspace.find_table(low, 1), None);
        aspace
            .set_leaf(low, PageEntryBits::new_leaf(PhysicalAddress::new(0x9000)), &mut frames)
            .unwrap();

        let directory = aspace.find_table(low, 1).unwrap();
        let window = aspace.geometry().table_address(1, low).unwrap();
        assert_eq!(window.as_u64(), 0xFFFF_C000);
        assert_eq!(aspace.translate(window), Some(directory));

        let table = aspace.find_table(low, 2).unwrap();
        let window = aspace.geometry().table_address(2, low).unwrap();
        assert_eq!(aspace.translate(window), Some(table));
    }

    #[test]
    fn ensure_table_reuses_existing_tables() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x10_0000, 0x20_0000);
        let aspace = space(&ram, PagingMode::Long, &mut frames);

        let va = VirtualAddress::new(0xFFFF_FFFF_E000_0000);
        let first = aspace.ensure_table(va, 3, &mut frames).unwrap();
        let used = frames.allocated();
        let again = aspace.ensure_table(va + 0x1000, 3, &mut frames).unwrap();
        assert_eq!(first, again);
        assert_eq!(frames.allocated(), used);
    }

    #[test]
    fn failed_allocation_keeps_partial_chain() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x10_0000, 0x10_3000);
        let aspace = space(&ram, PagingMode::Long, &mut frames);

        let va = VirtualAddress::new(0xFFFF_FFFF_E000_0000);
        assert!(aspace.ensure_table(va, 3, &mut frames).is_err());
        assert!(aspace.find_table(va, 2).is_some());
        assert!(aspace.find_table(va, 3).is_none());
    }

    #[test]
    fn page_state_tracks_all_three_states() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x10_0000, 0x20_0000);
        let aspace = space(&ram, PagingMode::Legacy32, &mut frames);
        let va = VirtualAddress::new(0xE000_0000);

        assert_eq!(aspace.page_state(va), PageState::Unmapped);
        aspace
            .set_leaf(va, PageEntryBits::new_reserved(), &mut frames)
            .unwrap();
        assert_eq!(aspace.page_state(va), PageState::Reserved);
        aspace.replace_leaf(va, PageEntryBits::new_leaf(PhysicalAddress::new(0x3000)));
        assert_eq!(aspace.page_state(va), PageState::Backed(PhysicalAddress::new(0x3000)));
        aspace.clear_leaf(va);
        assert_eq!(aspace.page_state(va), PageState::Unmapped);
    }
}
