//! # Direct-Map PhysMapper
//!
//! The loader maps all physical memory at a fixed virtual offset before
//! handing over. Page-table nodes, free-stack slots and freshly committed
//! pages are all reached through that window.
//!
//! ## Why is this needed?
//! - Code can only dereference virtual addresses, not physical ones.
//! - The mapping strategy differs between the running kernel (direct map)
//!   and hosted tests (simulated RAM); [`PhysMapper`] abstracts over both.

use kernel_vmem::{PhysMapper, PhysicalAddress, VirtualAddress};

/// [`PhysMapper`] for a direct map of physical memory at `offset`.
///
/// An offset of zero describes an identity mapping.
///
/// # Safety
/// - The direct map must be present and cover the referenced physical range.
/// - The returned reference must only be used for valid, mapped and writable
///   memory.
#[derive(Copy, Clone, Debug)]
pub struct OffsetPhysMapper {
    offset: u64,
}

impl OffsetPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Where `pa` shows up in the direct map.
    #[inline]
    #[must_use]
    pub const fn virtual_address(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64()))
    }
}

impl PhysMapper for OffsetPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.virtual_address(pa).as_mut_ptr::<T>();
        // SAFETY: Caller must ensure the physical address is valid and covered by the direct map.
        unsafe { &mut *va }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_added() {
        let mapper = OffsetPhysMapper::new(0xFFFF_8000_0000_0000);
        assert_eq!(
            mapper.virtual_address(PhysicalAddress::new(0x1234_5000)),
            VirtualAddress::new(0xFFFF_8000_1234_5000)
        );
        assert_eq!(
            OffsetPhysMapper::new(0).virtual_address(PhysicalAddress::new(0x7000)),
            VirtualAddress::new(0x7000)
        );
    }
}
