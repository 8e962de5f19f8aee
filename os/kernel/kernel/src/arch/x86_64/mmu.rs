use core::arch::asm;
use kernel_vmem::{Mmu, PhysicalAddress, VirtualAddress};

/// Bits of CR3 that hold the root table address.
const CR3_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// The paging unit of the running CPU.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

impl Mmu for X86Mmu {
    fn root(&self) -> PhysicalAddress {
        let cr3: u64;
        unsafe {
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalAddress::new(cr3 & CR3_ADDRESS_MASK)
    }

    fn set_root(&self, root: PhysicalAddress) {
        unsafe {
            asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn invalidate(&self, va: VirtualAddress) {
        unsafe {
            asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}
