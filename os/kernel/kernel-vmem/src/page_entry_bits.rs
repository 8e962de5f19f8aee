use crate::PhysicalAddress;
use bitfield_struct::bitfield;

/// A single x86 page-table entry in its raw bitfield form.
///
/// This models the **common superset** of the entry formats used by all
/// three paging modes. 2-level paging stores only the low 32 bits of it; use
/// [`from_raw`](Self::from_raw) / [`to_raw`](Self::to_raw) with the mode's
/// entry width to convert.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag |
/// | 8         | `G`               | Global (leaf only) |
/// | 9         | allocated         | Software: page reserved by `vmm_alloc` |
/// | 10–11     | OS avail          | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–62     | OS avail high     | Ignored by hardware |
/// | 63        | `NX`              | Execute disable (8-byte entries only) |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::{PageEntryBits, PhysicalAddress};
/// let e = PageEntryBits::new_leaf(PhysicalAddress::new(0x12_3000));
/// assert!(e.present() && e.writable());
/// assert_eq!(e.physical_address().as_u64(), 0x12_3000);
/// assert_eq!(e.to_raw(4), 0x12_3003);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Set if the entry points to a valid next-level table or a valid leaf
    /// mapping. Clear implies a not-present entry; the remaining bits are
    /// then free for software use.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6) — **leaf only**. Set by the CPU on first write.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7). Never set by this kernel.
    pub large_page: bool,

    /// Global (G, bit 8) — **leaf only**.
    ///
    /// When set on a leaf mapping, the TLB entry survives root register
    /// reloads. Used for kernel-space pages.
    pub global_translation: bool,

    /// Allocated (bit 9, software).
    ///
    /// The virtual page was handed out by `vmm_alloc` and will be backed on
    /// the first write fault. Only meaningful while `present` is clear.
    pub allocated: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=62).
    #[bits(11)]
    pub os_available_high: u16,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        // store bits [51:12]
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    /// Present, writable supervisor mapping of `phys`.
    #[inline]
    #[must_use]
    pub const fn new_leaf(phys: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_physical_address(phys)
    }

    /// Link to a next-level table at `phys`.
    ///
    /// PAE page-directory-pointer entries must not carry `RW`; pass
    /// `writable = false` for those.
    #[inline]
    #[must_use]
    pub const fn new_table(phys: PhysicalAddress, writable: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_physical_address(phys)
    }

    /// Not present, but reserved for a later demand commit.
    #[inline]
    #[must_use]
    pub const fn new_reserved() -> Self {
        Self::new().with_allocated(true)
    }

    /// Decode an entry of `width` bytes (4 or 8).
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64, width: u64) -> Self {
        if width == 4 {
            Self::from_bits(raw & 0xFFFF_FFFF)
        } else {
            Self::from_bits(raw)
        }
    }

    /// Encode as an entry of `width` bytes (4 or 8).
    #[inline]
    #[must_use]
    pub const fn to_raw(self, width: u64) -> u64 {
        if width == 4 {
            self.into_bits() & 0xFFFF_FFFF
        } else {
            self.into_bits()
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }
}
