//! # Physical Memory Manager
//!
//! Hands out and takes back single 4 KiB physical pages.
//!
//! Free memory lives in two places at once:
//!
//! 1. **Bootstrap regions**: the disjoint `[start, end)` ranges that were
//!    free at boot, consumed front to back by bumping their start.
//! 2. **The free stack**: every page returned through [`Pmm::free_page`],
//!    see [`FreePageStack`].
//!
//! A page is in exactly one of *remaining bootstrap region*, *free stack* or
//! *allocated*. Allocation prefers the stack so recently freed pages are
//! reused first.
//!
//! All counters are in pages and always satisfy
//! `free + used + unavailable == total`.
//!
//! The PMM keeps no lock. It runs before threading starts or with interrupts
//! disabled on the single CPU.

use crate::free_stack::{FreePageStack, Push};
use core::fmt;
use kernel_info::boot::{BootInfo, MemoryRange, MemoryType};
use kernel_info::memory::{LOW_MEMORY_END, MAX_FREE_REGIONS, PAGE_SIZE, PagingMode};
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PhysMapper, PhysicalAddress, VirtualAddress, align_down, align_up};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmmError {
    #[error("no memory available")]
    NoUsableMemory,
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("free-page stack window is full")]
    FreeStackOverflow,
    #[error("free-page stack corrupted at {at}")]
    FreeStackCorrupted { at: VirtualAddress },
    #[error("page {page} freed while no page is in use")]
    NothingInUse { page: PhysicalAddress },
}

/// Page counters of the PMM.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryStats {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub unavailable: u64,
}

impl MemoryStats {
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.free + self.used + self.unavailable == self.total
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kib = |pages: u64| pages * (PAGE_SIZE / 1024);
        write!(
            f,
            "system {} KiB, used {} KiB, free {} KiB, unavailable {} KiB",
            kib(self.total),
            kib(self.used),
            kib(self.free),
            kib(self.unavailable)
        )
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct FreeRegion {
    next: u64,
    end: u64,
}

impl FreeRegion {
    const EMPTY: Self = Self { next: 0, end: 0 };
}

pub struct Pmm {
    mode: PagingMode,
    regions: [FreeRegion; MAX_FREE_REGIONS],
    count: usize,
    current: usize,
    stack: FreePageStack,
    stats: MemoryStats,
}

impl Default for Pmm {
    fn default() -> Self {
        Self::new()
    }
}

impl Pmm {
    /// An empty PMM; nothing can be allocated before [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: PagingMode::Long,
            regions: [FreeRegion::EMPTY; MAX_FREE_REGIONS],
            count: 0,
            current: 0,
            stack: FreePageStack::for_mode(PagingMode::Long),
            stats: MemoryStats {
                total: 0,
                free: 0,
                used: 0,
                unavailable: 0,
            },
        }
    }

    /// Seed the PMM from the boot memory map.
    ///
    /// The map must be sanitized (sorted, non-overlapping). Available ranges
    /// are rounded inward to whole pages; low memory and the kernel image are
    /// carved out as used, and in 2-level mode everything above 4 GiB counts
    /// as unavailable.
    ///
    /// # Errors
    /// [`PmmError::NoUsableMemory`] if no free page remains.
    pub fn init(&mut self, boot: &BootInfo) -> Result<MemoryStats, PmmError> {
        self.mode = boot.paging_mode;
        self.count = 0;
        self.current = 0;
        self.stack = FreePageStack::for_mode(boot.paging_mode);
        self.stats = MemoryStats::default();

        let image = boot.kernel_image;
        let mut exclusions = [
            (0, LOW_MEMORY_END),
            (
                align_down(image.start.as_u64(), PAGE_SIZE),
                align_up(image.end.as_u64(), PAGE_SIZE),
            ),
        ];
        exclusions.sort_unstable();

        let limit = boot.paging_mode.layout().physical_limit;
        for range in boot.memory_map.entries() {
            self.account(range, limit, &exclusions);
        }

        log::info!("{}", self.stats);
        log::debug!("{} free regions", self.count);
        if self.stats.free == 0 {
            return Err(PmmError::NoUsableMemory);
        }
        Ok(self.stats)
    }

    fn account(&mut self, range: &MemoryRange, limit: Option<u64>, exclusions: &[(u64, u64)]) {
        let (start, mut end) = match range.kind {
            MemoryType::Available => (
                align_up(range.start.as_u64(), PAGE_SIZE),
                align_down(range.end.as_u64(), PAGE_SIZE),
            ),
            _ => (
                align_down(range.start.as_u64(), PAGE_SIZE),
                align_up(range.end.as_u64(), PAGE_SIZE),
            ),
        };
        if start >= end {
            return;
        }

        self.stats.total += pages(start, end);
        match range.kind {
            MemoryType::Available => {}
            MemoryType::Bootloader => {
                self.stats.used += pages(start, end);
                return;
            }
            _ => {
                self.stats.unavailable += pages(start, end);
                return;
            }
        }

        if let Some(limit) = limit
            && end > limit
        {
            let clip = start.max(limit);
            self.stats.unavailable += pages(clip, end);
            end = clip;
        }

        let mut cursor = start;
        for &(skip_start, skip_end) in exclusions {
            if skip_end <= cursor || skip_start >= end {
                continue;
            }
            if skip_start > cursor {
                self.add_region(cursor, skip_start);
            }
            let skipped_end = skip_end.min(end);
            self.stats.used += pages(cursor.max(skip_start), skipped_end);
            cursor = skipped_end;
        }
        if cursor < end {
            self.add_region(cursor, end);
        }
    }

    fn add_region(&mut self, start: u64, end: u64) {
        if self.count == MAX_FREE_REGIONS {
            log::warn!("free region table full, dropping {start:#x}..{end:#x}");
            self.stats.unavailable += pages(start, end);
            return;
        }
        self.regions[self.count] = FreeRegion { next: start, end };
        self.count += 1;
        self.stats.free += pages(start, end);
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> MemoryStats {
        self.stats
    }

    #[inline]
    #[must_use]
    pub const fn mode(&self) -> PagingMode {
        self.mode
    }

    #[inline]
    #[must_use]
    pub const fn stack(&self) -> &FreePageStack {
        &self.stack
    }

    /// Remaining parts of the bootstrap regions.
    pub fn free_regions(&self) -> impl Iterator<Item = (PhysicalAddress, PhysicalAddress)> + '_ {
        self.regions[self.current..self.count]
            .iter()
            .filter(|r| r.next < r.end)
            .map(|r| (PhysicalAddress::new(r.next), PhysicalAddress::new(r.end)))
    }

    /// Take one free page.
    ///
    /// # Errors
    /// [`PmmError::OutOfPhysicalMemory`] once both the stack and the bootstrap
    /// regions are exhausted; free-stack corruption is reported as such.
    pub fn alloc_page<M: PhysMapper, U: Mmu>(
        &mut self,
        space: &AddressSpace<'_, M>,
        mmu: &U,
    ) -> Result<PhysicalAddress, PmmError> {
        let page = match self.stack.pop(space, mmu)? {
            Some(page) => page,
            None => self.bump()?,
        };
        self.stats.free -= 1;
        self.stats.used += 1;
        Ok(page)
    }

    fn bump(&mut self) -> Result<PhysicalAddress, PmmError> {
        while let Some(region) = self.regions[..self.count].get_mut(self.current) {
            if region.next < region.end {
                let page = region.next;
                region.next += PAGE_SIZE;
                return Ok(PhysicalAddress::new(page));
            }
            self.current += 1;
        }
        Err(PmmError::OutOfPhysicalMemory)
    }

    /// Return `page` to the pool.
    ///
    /// The page may be absorbed as a page-table node for the free-stack
    /// window, in which case it stays accounted as used.
    ///
    /// # Errors
    /// [`PmmError::NothingInUse`] if no page is accounted as used, which
    /// catches a double free once everything has been returned. Otherwise
    /// free-stack overflow or corruption.
    pub fn free_page<M: PhysMapper, U: Mmu>(
        &mut self,
        space: &AddressSpace<'_, M>,
        mmu: &U,
        page: PhysicalAddress,
    ) -> Result<(), PmmError> {
        let page = page.page_base();
        let Some(used) = self.stats.used.checked_sub(1) else {
            log::error!("freeing {page} with no page in use");
            return Err(PmmError::NothingInUse { page });
        };
        match self.stack.push(space, mmu, page)? {
            Push::Stored => {
                self.stats.free += 1;
                self.stats.used = used;
            }
            Push::ConsumedAsTable => {}
        }
        Ok(())
    }
}

const fn pages(start: u64, end: u64) -> u64 {
    (end - start) / PAGE_SIZE
}

/// [`FrameAlloc`] view of the PMM for page-table walks over `space`.
pub struct PmmFrames<'a, 'm, M: PhysMapper, U: Mmu> {
    pmm: &'a mut Pmm,
    space: &'a AddressSpace<'m, M>,
    mmu: &'a U,
}

impl<'a, 'm, M: PhysMapper, U: Mmu> PmmFrames<'a, 'm, M, U> {
    pub const fn new(pmm: &'a mut Pmm, space: &'a AddressSpace<'m, M>, mmu: &'a U) -> Self {
        Self { pmm, space, mmu }
    }
}

impl<M: PhysMapper, U: Mmu> FrameAlloc for PmmFrames<'_, '_, M, U> {
    type Error = PmmError;

    fn alloc_frame(&mut self) -> Result<PhysicalAddress, PmmError> {
        self.pmm.alloc_page(self.space, self.mmu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::{KernelImage, MemoryMap};
    use kernel_vmem::Geometry;
    use kernel_vmem::testing::{BumpFrames, RecordingMmu, SimulatedRam};
    use std::collections::BTreeSet;

    const KIB: u64 = 1024;

    fn boot(mode: PagingMode, ranges: &[(u64, u64, MemoryType)], image: (u64, u64)) -> BootInfo {
        let mut memory_map = MemoryMap::new();
        for &(start, end, kind) in ranges {
            memory_map.add(start, end, kind).unwrap();
        }
        memory_map.sanitize();
        BootInfo {
            memory_map,
            kernel_image: KernelImage {
                start: PhysicalAddress::new(image.0),
                end: PhysicalAddress::new(image.1),
            },
            paging_mode: mode,
            physical_offset: 0,
        }
    }

    /// Boot-built tables live below 1 MiB, out of the PMM's way.
    fn primed(ram: &SimulatedRam, mode: PagingMode) -> AddressSpace<'_, SimulatedRam> {
        let mut frames = BumpFrames::new(0x1000, 0x8_0000);
        let root = frames.alloc_frame().unwrap();
        let space = AddressSpace::new(ram, Geometry::of(mode), root);
        let start = mode.layout().free_stack.start;
        space
            .ensure_table(start, space.geometry().leaf_depth(), &mut frames)
            .unwrap();
        space
    }

    fn pa(raw: u64) -> PhysicalAddress {
        PhysicalAddress::new(raw)
    }

    #[test]
    fn bump_allocation_ascends_then_exhausts() {
        let ram = SimulatedRam::new();
        let space = primed(&ram, PagingMode::Long);
        let mmu = RecordingMmu::new(space.root());

        let info = boot(
            PagingMode::Long,
            &[(0x10_0000, 0x10_4000, MemoryType::Available)],
            (0x20_0000, 0x20_1000),
        );
        let mut pmm = Pmm::new();
        pmm.init(&info).unwrap();

        for expected in [0x10_0000, 0x10_1000, 0x10_2000, 0x10_3000] {
            assert_eq!(pmm.alloc_page(&space, &mmu), Ok(pa(expected)));
        }
        assert_eq!(pmm.alloc_page(&space, &mmu), Err(PmmError::OutOfPhysicalMemory));
    }

    #[test]
    fn freed_pages_come_back_in_stack_order() {
        let ram = SimulatedRam::new();
        let space = primed(&ram, PagingMode::Long);
        let mmu = RecordingMmu::new(space.root());

        let info = boot(
            PagingMode::Long,
            &[(0x10_0000, 0x10_4000, MemoryType::Available)],
            (0x20_0000, 0x20_1000),
        );
        let mut pmm = Pmm::new();
        pmm.init(&info).unwrap();
        for _ in 0..4 {
            pmm.alloc_page(&space, &mmu).unwrap();
        }

        pmm.free_page(&space, &mmu, pa(0x10_3000)).unwrap();
        pmm.free_page(&space, &mmu, pa(0x10_2000)).unwrap();
        assert_eq!(pmm.stats().free, 2);

        assert_eq!(pmm.alloc_page(&space, &mmu), Ok(pa(0x10_2000)));
        assert_eq!(pmm.alloc_page(&space, &mmu), Ok(pa(0x10_3000)));
        assert_eq!(pmm.alloc_page(&space, &mmu), Err(PmmError::OutOfPhysicalMemory));
        assert!(pmm.stack().is_empty());
    }

    #[test]
    fn freeing_more_than_was_allocated_is_refused() {
        let ram = SimulatedRam::new();
        let space = primed(&ram, PagingMode::Long);
        let mmu = RecordingMmu::new(space.root());

        let info = boot(
            PagingMode::Long,
            &[(0x10_0000, 0x10_2000, MemoryType::Available)],
            (0, 0),
        );
        let mut pmm = Pmm::new();
        pmm.init(&info).unwrap();
        let page = pmm.alloc_page(&space, &mmu).unwrap();
        pmm.free_page(&space, &mmu, page).unwrap();
        let before = pmm.stats();
        assert_eq!(before.used, 0);

        assert_eq!(
            pmm.free_page(&space, &mmu, page),
            Err(PmmError::NothingInUse { page })
        );
        assert_eq!(pmm.stats(), before);
        assert_eq!(pmm.stack().len(), 1);
        assert!(pmm.stats().is_balanced());
    }

    #[test]
    fn init_classifies_and_carves() {
        let ranges = [
            (0, 0x9_F000, MemoryType::Available),
            (0x9_F000, 0x10_0000, MemoryType::Reserved),
            (0x10_0000, 0x80_0000, MemoryType::Available),
            (0x80_0000, 0x81_0000, MemoryType::Bootloader),
            (0x1_0000_0000, 0x1_0010_0000, MemoryType::Available),
        ];
        let image = (0x20_0000, 0x28_0800);

        let mut pmm = Pmm::new();
        let stats = pmm.init(&boot(PagingMode::Long, &ranges, image)).unwrap();
        assert_eq!(stats.total, 2320);
        assert_eq!(stats.unavailable, 97);
        assert_eq!(stats.used, 159 + 129 + 16);
        assert_eq!(stats.free, 1663 + 256);
        assert!(stats.is_balanced());

        let regions: Vec<_> = pmm.free_regions().collect();
        assert_eq!(
            regions,
            [
                (pa(0x10_0000), pa(0x20_0000)),
                (pa(0x28_1000), pa(0x80_0000)),
                (pa(0x1_0000_0000), pa(0x1_0010_0000)),
            ]
        );

        // 2-level paging cannot reach the range above 4 GiB.
        let stats = pmm.init(&boot(PagingMode::Legacy32, &ranges, image)).unwrap();
        assert_eq!(stats.unavailable, 97 + 256);
        assert_eq!(stats.free, 1663);
        assert!(stats.is_balanced());
        assert_eq!(pmm.free_regions().count(), 2);
    }

    #[test]
    fn unaligned_available_ranges_round_inward() {
        let mut pmm = Pmm::new();
        let stats = pmm
            .init(&boot(
                PagingMode::Pae,
                &[(0x10_0800, 0x10_3800, MemoryType::Available)],
                (0, 0),
            ))
            .unwrap();
        assert_eq!(stats.free, 2);
        assert_eq!(pmm.free_regions().next(), Some((pa(0x10_1000), pa(0x10_3000))));
    }

    #[test]
    fn nothing_usable_is_an_error() {
        let mut pmm = Pmm::new();
        let result = pmm.init(&boot(
            PagingMode::Long,
            &[
                (0, 0xA_0000, MemoryType::Available),
                (0x10_0000, 0x20_0000, MemoryType::Reserved),
            ],
            (0x10_0000, 0x18_0000),
        ));
        assert_eq!(result, Err(PmmError::NoUsableMemory));
        assert!(pmm.stats().is_balanced());
    }

    #[test]
    fn excess_regions_are_dropped_as_unavailable() {
        let ranges: Vec<_> = (0..=MAX_FREE_REGIONS as u64)
            .map(|i| {
                let start = 0x10_0000 + i * 2 * PAGE_SIZE;
                (start, start + PAGE_SIZE, MemoryType::Available)
            })
            .collect();
        let mut pmm = Pmm::new();
        let stats = pmm
            .init(&boot(PagingMode::Long, &ranges, (0, 0)))
            .unwrap();
        assert_eq!(stats.free, MAX_FREE_REGIONS as u64);
        assert_eq!(stats.unavailable, 1);
        assert!(stats.is_balanced());
    }

    #[test]
    fn first_frees_build_the_stack_tables() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x1000, 0x8_0000);
        let root = frames.alloc_frame().unwrap();
        let space = AddressSpace::new(&ram, Geometry::of(PagingMode::Long), root);
        let mmu = RecordingMmu::new(root);

        let info = boot(
            PagingMode::Long,
            &[(0x10_0000, 0x20_0000, MemoryType::Available)],
            (0x30_0000, 0x30_1000),
        );
        let mut pmm = Pmm::new();
        pmm.init(&info).unwrap();
        let taken: Vec<_> = (0..4).map(|_| pmm.alloc_page(&space, &mmu).unwrap()).collect();
        let before = pmm.stats();

        for &page in &taken {
            pmm.free_page(&space, &mmu, page).unwrap();
        }
        // Three of them now hold the PDPT, PD and PT of the stack window.
        assert_eq!(pmm.stats().free, before.free + 1);
        assert_eq!(pmm.stack().len(), 1);
        assert!(pmm.stats().is_balanced());
        assert_eq!(pmm.alloc_page(&space, &mmu), Ok(taken[3]));
    }

    #[test]
    fn random_traffic_never_hands_out_a_page_twice() {
        let ram = SimulatedRam::new();
        let space = primed(&ram, PagingMode::Legacy32);
        let mmu = RecordingMmu::new(space.root());

        let info = boot(
            PagingMode::Legacy32,
            &[(0, 640 * KIB, MemoryType::Available), (0x10_0000, 0x20_0000, MemoryType::Available)],
            (0x10_0000, 0x11_0000),
        );
        let mut pmm = Pmm::new();
        pmm.init(&info).unwrap();

        let mut outstanding = BTreeSet::new();
        let mut seed = 0x2545_F491_4F6C_DD1Du64;
        for _ in 0..5000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            if seed % 3 != 0 || outstanding.is_empty() {
                match pmm.alloc_page(&space, &mmu) {
                    Ok(page) => assert!(outstanding.insert(page), "{page} handed out twice"),
                    Err(PmmError::OutOfPhysicalMemory) => {}
                    Err(e) => panic!("{e}"),
                }
            } else {
                let page = *outstanding.iter().nth((seed as usize) % outstanding.len()).unwrap();
                outstanding.remove(&page);
                pmm.free_page(&space, &mmu, page).unwrap();
            }
            assert!(pmm.stats().is_balanced());
        }
    }
}
