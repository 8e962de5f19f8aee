//! # Paging Geometry
//!
//! One walk algorithm serves all paging modes; what changes is captured here:
//! the `(shift, bits)` slice each level takes from a virtual address, the
//! entry width, how the hierarchy maps itself, and where each level's tables
//! appear inside the page-table window.
//!
//! | Mode | Levels (top-down) | Recursion | Table windows (depth 0 → leaf) |
//! |------|-------------------|-----------|--------------------------------|
//! | Legacy32 | 10/10 | root slot 1023 | `0xFFFF_F000`, `0xFFC0_0000` |
//! | Pae | 2/9/9 | PD 3, slots 508‒511 → PD 0‒3 | –, `0xFFFF_C000`, `0xFF80_0000` |
//! | Long | 9/9/9/9 | root slot 510 | `…7F_BFDF_E000`, `…7F_BFC0_0000`, `…7F_8000_0000`, `…00_0000_0000` |
//!
//! The table at depth `d` covering `va` lives at
//! `window[d] + ((va >> (shift[d] + bits[d])) << 12)`, with `va` truncated
//! to the mode's virtual address width.

use crate::info::PagingMode;
use crate::{PAGE_SIZE, PageEntryBits, PhysicalAddress, VirtualAddress};

/// The slice of a virtual address consumed by one table level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Level {
    /// Position of the lowest index bit.
    pub shift: u32,
    /// Number of index bits.
    pub bits: u32,
}

impl Level {
    const fn new(shift: u32, bits: u32) -> Self {
        Self { shift, bits }
    }

    /// Index of `va` in a table of this level.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift) & ((1 << self.bits) - 1)) as usize
    }

    /// `log2` of the bytes covered by one whole table of this level.
    #[inline]
    #[must_use]
    pub const fn table_span_shift(self) -> u32 {
        self.shift + self.bits
    }
}

/// How the hierarchy references itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Recursion {
    /// The root table's entry `slot` points at the root itself.
    RootSlot(usize),
    /// The page directory behind PDPT entry `directory` links every page
    /// directory `i` in its slot `first_slot + i`.
    PaeDirectories { directory: usize, first_slot: usize },
}

/// Per-mode paging parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub mode: PagingMode,
    pub recursion: Recursion,
    levels: &'static [Level],
    windows: &'static [Option<u64>],
    va_bits: u32,
}

const LEGACY32: Geometry = Geometry {
    mode: PagingMode::Legacy32,
    recursion: Recursion::RootSlot(1023),
    levels: &[Level::new(22, 10), Level::new(12, 10)],
    windows: &[Some(0xFFFF_F000), Some(0xFFC0_0000)],
    va_bits: 32,
};

const PAE: Geometry = Geometry {
    mode: PagingMode::Pae,
    recursion: Recursion::PaeDirectories {
        directory: 3,
        first_slot: 508,
    },
    levels: &[Level::new(30, 2), Level::new(21, 9), Level::new(12, 9)],
    windows: &[None, Some(0xFFFF_C000), Some(0xFF80_0000)],
    va_bits: 32,
};

const LONG: Geometry = Geometry {
    mode: PagingMode::Long,
    recursion: Recursion::RootSlot(510),
    levels: &[
        Level::new(39, 9),
        Level::new(30, 9),
        Level::new(21, 9),
        Level::new(12, 9),
    ],
    windows: &[
        Some(0xFFFF_FF7F_BFDF_E000),
        Some(0xFFFF_FF7F_BFC0_0000),
        Some(0xFFFF_FF7F_8000_0000),
        Some(0xFFFF_FF00_0000_0000),
    ],
    va_bits: 48,
};

impl Geometry {
    #[must_use]
    pub const fn of(mode: PagingMode) -> Self {
        match mode {
            PagingMode::Legacy32 => LEGACY32,
            PagingMode::Pae => PAE,
            PagingMode::Long => LONG,
        }
    }

    /// Levels from the root down to the leaf tables.
    #[inline]
    #[must_use]
    pub const fn levels(&self) -> &'static [Level] {
        self.levels
    }

    /// Depth of the tables holding leaf entries.
    #[inline]
    #[must_use]
    pub const fn leaf_depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Entry width in bytes.
    #[inline]
    #[must_use]
    pub const fn entry_width(&self) -> u64 {
        self.mode.entry_size()
    }

    #[inline]
    #[must_use]
    pub const fn index(&self, depth: usize, va: VirtualAddress) -> usize {
        self.levels[depth].index(va)
    }

    /// Bring a raw address into canonical form for this mode.
    ///
    /// 32-bit modes truncate; 4-level mode sign-extends bit 47.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn canonical(&self, raw: u64) -> VirtualAddress {
        let unused = 64 - self.va_bits;
        if self.va_bits == 48 {
            VirtualAddress::new((((raw << unused) as i64) >> unused) as u64)
        } else {
            VirtualAddress::new(raw & self.va_mask())
        }
    }

    #[inline]
    const fn va_mask(&self) -> u64 {
        (1 << self.va_bits) - 1
    }

    /// Entry linking a table at `depth` to its child table `frame`.
    #[must_use]
    pub const fn table_link(&self, depth: usize, frame: PhysicalAddress) -> PageEntryBits {
        // PAE PDPT entries have RW reserved.
        let writable = !(matches!(self.mode, PagingMode::Pae) && depth == 0);
        PageEntryBits::new_table(frame, writable)
    }

    /// Where the table at `depth` covering `va` appears through the
    /// recursive mapping, if that level is exposed at all.
    ///
    /// ```rust
    /// # use kernel_vmem::{Geometry, VirtualAddress};
    /// # use kernel_vmem::info::PagingMode;
    /// let g = Geometry::of(PagingMode::Legacy32);
    /// let va = VirtualAddress::new(0xE040_0000);
    /// assert_eq!(g.table_address(1, va), Some(VirtualAddress::new(0xFFC0_0000 + 0x381 * 4096)));
    /// assert_eq!(g.table_address(0, va), Some(VirtualAddress::new(0xFFFF_F000)));
    /// ```
    #[must_use]
    pub fn table_address(&self, depth: usize, va: VirtualAddress) -> Option<VirtualAddress> {
        let window = self.windows[depth]?;
        let level = self.levels[depth];
        let table = (va.as_u64() & self.va_mask()) >> level.table_span_shift();
        Some(VirtualAddress::new(window + table * PAGE_SIZE))
    }

    /// Inverse of [`table_address`](Self::table_address).
    ///
    /// Returns the depth and the lowest virtual address covered by the table
    /// that `addr` falls into. Upper levels are checked first since their
    /// windows nest inside the leaf-table window.
    #[must_use]
    pub fn decode_table_window(&self, addr: VirtualAddress) -> Option<(usize, VirtualAddress)> {
        for (depth, window) in self.windows.iter().enumerate() {
            let Some(window) = *window else {
                continue;
            };

            let span_shift = self.levels[depth].table_span_shift();
            let tables = 1u64 << (self.va_bits - span_shift);
            let size = tables * PAGE_SIZE;

            let addr = addr.as_u64();
            if addr >= window && addr - window < size {
                let table = (addr - window) / PAGE_SIZE;
                return Some((depth, self.canonical(table << span_shift)));
            }
        }
        None
    }
}
