//! # Memory Layout
//!
//! Fixed virtual-address windows used by the memory managers, one set per
//! [`PagingMode`]. Everything that computes addresses inside these windows
//! (the VMM, the free page stack, MMIO mappings) must read them from here.

use kernel_memory_addresses::VirtualAddress;

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = kernel_memory_addresses::PAGE_SIZE;

/// Physical memory below this address (ISA I/O space, BIOS data) is never
/// handed out by the physical memory manager.
pub const LOW_MEMORY_END: u64 = 0x10_0000; // 1 MiB

/// Highest physical address reachable with 2-level (non-PAE) paging.
pub const LEGACY_PHYSICAL_LIMIT: u64 = 0x1_0000_0000; // 4 GiB

/// Upper bound on the number of bootstrap free regions tracked by the PMM.
pub const MAX_FREE_REGIONS: usize = 1000;

/// The size of a kernel thread stack.
pub const THREAD_STACK_SIZE: u64 = 16 * 1024;

/// Programmed rate of the scheduler timer interrupt.
pub const TIMER_FREQUENCY_HZ: u64 = 1000;

/// Page-table format selected by the boot stage.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PagingMode {
    /// 2-level, 32-bit entries.
    Legacy32,
    /// 3-level, 64-bit entries, 32-bit virtual addresses.
    Pae,
    /// 4-level, 64-bit entries, 48-bit virtual addresses.
    Long,
}

impl PagingMode {
    /// Width of a page-table entry (and of a free-stack slot) in bytes.
    #[must_use]
    pub const fn entry_size(self) -> u64 {
        match self {
            Self::Legacy32 => 4,
            Self::Pae | Self::Long => 8,
        }
    }

    #[must_use]
    pub const fn levels(self) -> usize {
        match self {
            Self::Legacy32 => 2,
            Self::Pae => 3,
            Self::Long => 4,
        }
    }

    #[must_use]
    pub const fn layout(self) -> &'static AddressLayout {
        match self {
            Self::Legacy32 => &LEGACY32_LAYOUT,
            Self::Pae => &PAE_LAYOUT,
            Self::Long => &LONG_LAYOUT,
        }
    }
}

/// A half-open `[start, end)` virtual window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Window {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl Window {
    const fn new(start: u64, end: u64) -> Self {
        Self {
            start: VirtualAddress::new(start),
            end: VirtualAddress::new(end),
        }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kernel virtual address space layout for one paging mode.
///
/// ```text
/// Legacy32 / PAE                         Long
/// 0xC000_0000  kernel space              0x8000_0000_0000_0000  kernel space
/// 0xE000_0000  heap (vmm_alloc)          0xFFFF_F000_0000_0000  free page stack
/// 0xF000_0000  heap end                  0xFFFF_FF00_0000_0000  page tables
/// 0xFF00_0000  free page stack           0xFFFF_FFFF_E000_0000  heap (vmm_alloc)
/// 0xFF80_0000  page tables (PAE)         0xFFFF_FFFF_F000_0000  heap end
/// 0xFFC0_0000  page tables (Legacy32)
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressLayout {
    /// Lowest kernel virtual address; committed pages above it are global.
    pub kernel_space: VirtualAddress,
    /// Window handed out by `vmm_alloc`.
    pub heap: Window,
    /// Virtual storage of the self-hosting free page stack.
    pub free_stack: Window,
    /// Where page-table nodes appear through the recursive mapping.
    pub page_tables: Window,
    /// Physical memory at or above this address is unusable.
    pub physical_limit: Option<u64>,
}

pub const LEGACY32_LAYOUT: AddressLayout = AddressLayout {
    kernel_space: VirtualAddress::new(0xC000_0000),
    heap: Window::new(0xE000_0000, 0xF000_0000),
    free_stack: Window::new(0xFF00_0000, 0xFF80_0000),
    page_tables: Window::new(0xFFC0_0000, 0x1_0000_0000),
    physical_limit: Some(LEGACY_PHYSICAL_LIMIT),
};

pub const PAE_LAYOUT: AddressLayout = AddressLayout {
    kernel_space: VirtualAddress::new(0xC000_0000),
    heap: Window::new(0xE000_0000, 0xF000_0000),
    free_stack: Window::new(0xFF00_0000, 0xFF80_0000),
    page_tables: Window::new(0xFF80_0000, 0x1_0000_0000),
    physical_limit: None,
};

pub const LONG_LAYOUT: AddressLayout = AddressLayout {
    kernel_space: VirtualAddress::new(0x8000_0000_0000_0000),
    heap: Window::new(0xFFFF_FFFF_E000_0000, 0xFFFF_FFFF_F000_0000),
    free_stack: Window::new(0xFFFF_F000_0000_0000, 0xFFFF_F080_0000_0000),
    page_tables: Window::new(0xFFFF_FF00_0000_0000, 0xFFFF_FF80_0000_0000),
    physical_limit: None,
};

const fn check(layout: &AddressLayout) {
    let heap = &layout.heap;
    let stack = &layout.free_stack;
    let tables = &layout.page_tables;
    assert!(heap.start.as_u64() >= layout.kernel_space.as_u64());
    assert!(heap.start.is_page_aligned() && heap.end.is_page_aligned());
    assert!(stack.start.is_page_aligned() && stack.end.is_page_aligned());
    assert!(!heap.is_empty() && !stack.is_empty() && !tables.is_empty());

    // The windows must not overlap.
    assert!(heap.end.as_u64() <= stack.start.as_u64() || stack.end.as_u64() <= heap.start.as_u64());
    assert!(stack.end.as_u64() <= tables.start.as_u64() || tables.end.as_u64() <= stack.start.as_u64());
    assert!(heap.end.as_u64() <= tables.start.as_u64() || tables.end.as_u64() <= heap.start.as_u64());
}

const _: () = {
    assert!(THREAD_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(LOW_MEMORY_END.is_multiple_of(PAGE_SIZE));
    check(&LEGACY32_LAYOUT);
    check(&PAE_LAYOUT);
    check(&LONG_LAYOUT);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_free_stack_covers_all_addressable_pages() {
        let pages = LEGACY_PHYSICAL_LIMIT / PAGE_SIZE;
        assert!(LEGACY32_LAYOUT.free_stack.len() >= pages * PagingMode::Legacy32.entry_size());
    }

    #[test]
    fn windows_contain_their_bounds() {
        let heap = LONG_LAYOUT.heap;
        assert!(heap.contains(heap.start));
        assert!(!heap.contains(heap.end));
        assert!(PagingMode::Long.layout().page_tables.contains(VirtualAddress::new(
            0xFFFF_FF7F_BFDF_E000
        )));
    }

    #[test]
    fn only_legacy_mode_clips_physical_memory() {
        assert_eq!(PagingMode::Legacy32.layout().physical_limit, Some(0x1_0000_0000));
        assert_eq!(PagingMode::Pae.layout().physical_limit, None);
        assert_eq!(PagingMode::Long.layout().physical_limit, None);
    }
}
