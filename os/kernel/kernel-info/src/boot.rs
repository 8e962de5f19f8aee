//! # Kernel Boot Information
//!
//! What the boot stage hands over: a typed physical memory map, the
//! physical extent of the loaded kernel image and the paging mode it set up.

use crate::memory::PagingMode;
use kernel_memory_addresses::PhysicalAddress;

/// Capacity of a [`MemoryMap`].
pub const MEMORY_MAP_MAX_ENTRIES: usize = 1024;

/// Coarse classification of a physical memory range.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryType {
    /// Conventional RAM, free for the kernel to use.
    Available,
    /// Must not be touched.
    Reserved,
    /// RAM with detected errors.
    Unusable,
    /// UEFI runtime services code and data.
    FirmwareRuntime,
    /// ACPI tables; reusable once parsed.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiRuntime,
    /// Loader data still in use (boot page tables, module images).
    Bootloader,
}

impl MemoryType {
    /// Rank used to resolve overlapping ranges; the higher rank wins.
    #[must_use]
    pub const fn restrictiveness(self) -> u8 {
        match self {
            Self::Available => 0,
            Self::Bootloader => 1,
            Self::AcpiReclaimable => 2,
            Self::AcpiRuntime => 3,
            Self::FirmwareRuntime => 4,
            Self::Reserved => 5,
            Self::Unusable => 6,
        }
    }
}

/// Half-open physical range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub kind: MemoryType,
}

impl MemoryRange {
    const EMPTY: Self = Self {
        start: PhysicalAddress::new(0),
        end: PhysicalAddress::new(0),
        kind: MemoryType::Reserved,
    };

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    const fn covers(&self, start: u64, end: u64) -> bool {
        self.start.as_u64() <= start && end <= self.end.as_u64()
    }
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum MemoryMapError {
    #[error("memory map is full ({MEMORY_MAP_MAX_ENTRIES} entries)")]
    Full,
}

/// Fixed-capacity table of physical memory ranges.
///
/// The boot stage fills it from whatever the firmware reports and calls
/// [`sanitize`](Self::sanitize) before handing it over.
#[derive(Clone)]
pub struct MemoryMap {
    entries: [MemoryRange; MEMORY_MAP_MAX_ENTRIES],
    len: usize,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [MemoryRange::EMPTY; MEMORY_MAP_MAX_ENTRIES],
            len: 0,
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[MemoryRange] {
        &self.entries[..self.len]
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record `[start, end)` as `kind`.
    ///
    /// Empty or inverted ranges are ignored. A range that touches an
    /// existing entry of the same kind extends that entry instead of taking
    /// a new slot.
    ///
    /// # Errors
    /// [`MemoryMapError::Full`] if a new slot is needed and none is left.
    pub fn add(&mut self, start: u64, end: u64, kind: MemoryType) -> Result<(), MemoryMapError> {
        if start >= end {
            return Ok(());
        }

        for entry in &mut self.entries[..self.len] {
            if entry.kind != kind {
                continue;
            }
            if entry.end.as_u64() == start {
                entry.end = PhysicalAddress::new(end);
                return Ok(());
            }
            if entry.start.as_u64() == end {
                entry.start = PhysicalAddress::new(start);
                return Ok(());
            }
        }

        if self.len == MEMORY_MAP_MAX_ENTRIES {
            return Err(MemoryMapError::Full);
        }

        self.entries[self.len] = MemoryRange {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
            kind,
        };
        self.len += 1;
        Ok(())
    }

    /// Sort the map and resolve overlaps.
    ///
    /// Every stretch of memory covered by more than one entry takes the most
    /// restrictive [`MemoryType`] among them. Afterwards entries are sorted
    /// by start address, pairwise disjoint, and adjacent entries of the same
    /// kind are merged.
    pub fn sanitize(&mut self) {
        let source = self.entries;
        let count = self.len;
        let source = &source[..count];

        let mut bounds = [0u64; 2 * MEMORY_MAP_MAX_ENTRIES];
        for (i, entry) in source.iter().enumerate() {
            bounds[2 * i] = entry.start.as_u64();
            bounds[2 * i + 1] = entry.end.as_u64();
        }
        let bounds = &mut bounds[..2 * count];
        bounds.sort_unstable();

        self.len = 0;
        let mut previous: Option<u64> = None;
        for &bound in bounds.iter() {
            let Some(start) = previous.replace(bound) else {
                continue;
            };
            if start == bound {
                continue;
            }

            let winner = source
                .iter()
                .filter(|entry| entry.covers(start, bound))
                .map(|entry| entry.kind)
                .max_by_key(|kind| kind.restrictiveness());

            if let Some(kind) = winner {
                self.push_merged(start, bound, kind);
            }
        }
    }

    /// Append a range that starts at or after every stored entry.
    fn push_merged(&mut self, start: u64, end: u64, kind: MemoryType) {
        if let Some(last) = self.entries[..self.len].last_mut()
            && last.kind == kind
            && last.end.as_u64() == start
        {
            last.end = PhysicalAddress::new(end);
            return;
        }

        if self.len == MEMORY_MAP_MAX_ENTRIES {
            log::warn!("dropping memory range {start:#x}..{end:#x} ({kind:?}): map is full");
            return;
        }

        self.entries[self.len] = MemoryRange {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
            kind,
        };
        self.len += 1;
    }
}

/// Physical extent of the loaded kernel image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

/// Everything the kernel core receives from the boot stage.
#[derive(Clone)]
pub struct BootInfo {
    pub memory_map: MemoryMap,
    pub kernel_image: KernelImage,
    pub paging_mode: PagingMode,
    /// Virtual offset at which the loader mapped all physical memory.
    pub physical_offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(map: &MemoryMap) -> Vec<(u64, u64, MemoryType)> {
        map.entries()
            .iter()
            .map(|r| (r.start.as_u64(), r.end.as_u64(), r.kind))
            .collect()
    }

    #[test]
    fn add_ignores_empty_ranges() {
        let mut map = MemoryMap::new();
        map.add(0x2000, 0x2000, MemoryType::Available).unwrap();
        map.add(0x3000, 0x2000, MemoryType::Available).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn add_merges_adjacent_ranges_of_the_same_kind() {
        let mut map = MemoryMap::new();
        map.add(0x1000, 0x2000, MemoryType::Available).unwrap();
        map.add(0x2000, 0x3000, MemoryType::Available).unwrap();
        map.add(0x0000, 0x1000, MemoryType::Available).unwrap();
        map.add(0x3000, 0x4000, MemoryType::Reserved).unwrap();
        assert_eq!(
            ranges(&map),
            vec![
                (0x0000, 0x3000, MemoryType::Available),
                (0x3000, 0x4000, MemoryType::Reserved),
            ]
        );
    }

    #[test]
    fn add_reports_a_full_table() {
        let mut map = MemoryMap::new();
        for i in 0..MEMORY_MAP_MAX_ENTRIES as u64 {
            // Gaps keep the entries from merging.
            map.add(i * 0x2000, i * 0x2000 + 0x1000, MemoryType::Available)
                .unwrap();
        }
        assert_eq!(
            map.add(0xFFFF_0000, 0xFFFF_1000, MemoryType::Available),
            Err(MemoryMapError::Full)
        );
    }

    #[test]
    fn sanitize_sorts_entries() {
        let mut map = MemoryMap::new();
        map.add(0x10_0000, 0x20_0000, MemoryType::Available).unwrap();
        map.add(0x0, 0x9_F000, MemoryType::Available).unwrap();
        map.add(0xF_0000, 0x10_0000, MemoryType::Reserved).unwrap();
        map.sanitize();
        assert_eq!(
            ranges(&map),
            vec![
                (0x0, 0x9_F000, MemoryType::Available),
                (0xF_0000, 0x10_0000, MemoryType::Reserved),
                (0x10_0000, 0x20_0000, MemoryType::Available),
            ]
        );
    }

    #[test]
    fn sanitize_gives_overlaps_to_the_more_restrictive_kind() {
        let mut map = MemoryMap::new();
        map.add(0x0, 0x10_0000, MemoryType::Available).unwrap();
        map.add(0x8_0000, 0x9_0000, MemoryType::Reserved).unwrap();
        map.add(0xC_0000, 0x20_0000, MemoryType::AcpiReclaimable).unwrap();
        map.sanitize();
        assert_eq!(
            ranges(&map),
            vec![
                (0x0, 0x8_0000, MemoryType::Available),
                (0x8_0000, 0x9_0000, MemoryType::Reserved),
                (0x9_0000, 0xC_0000, MemoryType::Available),
                (0xC_0000, 0x20_0000, MemoryType::AcpiReclaimable),
            ]
        );
    }

    #[test]
    fn sanitize_merges_duplicates() {
        let mut map = MemoryMap::new();
        map.add(0x1000, 0x4000, MemoryType::Available).unwrap();
        map.add(0x2000, 0x6000, MemoryType::Available).unwrap();
        map.sanitize();
        assert_eq!(ranges(&map), vec![(0x1000, 0x6000, MemoryType::Available)]);
    }
}
