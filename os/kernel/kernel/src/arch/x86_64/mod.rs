//! x86-64 backend: legacy PIC and PIT, the IDT with one stub per vector,
//! `CR3` access and the kernel-thread stack switch.

mod context;
#[cfg(target_os = "none")]
mod entry;
pub mod idt;
mod mmu;
pub mod pic;
pub mod pit;
pub mod ports;

pub use context::{X86Context, X86Platform};
pub use mmu::X86Mmu;
pub use pic::Pic8259;

use crate::Arch;
use kernel_alloc::phys_mapper::OffsetPhysMapper;

/// Where the loader maps all of physical memory.
pub const DIRECT_MAP_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// Flat ring-0 code segment set up by the loader.
pub const KERNEL_CS: u16 = 0x08;

/// The real machine.
pub struct X86;

impl Arch for X86 {
    type Platform = X86Platform;
    type Mapper = OffsetPhysMapper;
    type Mmu = X86Mmu;
    type Irq = Pic8259;
}
