//! # Interrupt Descriptor Table
//!
//! 256 gates, each pointing at one of the entry stubs. The table is built
//! with a small fluent builder:
//!
//! ```ignore
//! idt[14]
//!     .set_handler(stub_address(14))
//!     .selector(KERNEL_CS)
//!     .present(true)
//!     .gate_interrupt();
//! unsafe { idt.load() };
//! ```
//!
//! Every gate here is an interrupt gate: the CPU clears IF on entry, which
//! is what the lock nesting in `kernel_sync::Cpu` expects of a handler.

use bitfield_struct::bitfield;
use core::arch::asm;
use core::ops::{Index, IndexMut};

const _: () = assert!(size_of::<IdtEntry>() == 16);
const _: () = assert!(align_of::<Idt>() == 16);

/// IST index and type/attribute byte of a gate.
///
/// ```text
/// 15  14 13 12  11    8 7     3 2   0
/// | P | DPL | S | Type | zero  | IST |
/// ```
#[bitfield(u16)]
pub struct IdtGateAttr {
    /// Interrupt Stack Table index; 0 keeps the current stack.
    #[bits(3)]
    pub ist: u8,

    #[bits(5)]
    __zero0: u8,

    /// 0xE interrupt gate, 0xF trap gate.
    #[bits(4)]
    pub typ: u8,

    /// Must be zero for interrupt and trap gates.
    #[bits(1)]
    pub s: bool,

    #[bits(2)]
    pub dpl: u8,

    #[bits(1)]
    pub present: bool,
}

impl IdtGateAttr {
    #[inline]
    #[must_use]
    pub const fn interrupt_gate() -> Self {
        Self::new().with_typ(0xE).with_s(false)
    }

    #[inline]
    #[must_use]
    pub const fn trap_gate() -> Self {
        Self::new().with_typ(0xF).with_s(false)
    }
}

#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    /// A table with every gate absent.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Point the IDTR at this table.
    ///
    /// # Safety
    /// Ring 0. The table must stay in place for as long as it is loaded, and
    /// every present gate must lead to valid handler code.
    #[inline]
    pub unsafe fn load(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u64,
        };
        unsafe {
            asm!("lidt [{}]", in(reg) &raw const idtr, options(nostack, preserves_flags, readonly));
        }
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

/// Operand of `lidt`.
#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u64,
}

/// One 16-byte gate descriptor.
///
/// ```text
/// 127            96 95              64
/// +----------------+-----------------+
/// |      zero      |  offset[63:32]  |
/// +----------------+-----------------+
/// 63    48 47    32 31    16 15     0
/// +-------+--------+--------+--------+
/// |off 31:16| attr | selector|off 15:0|
/// +-------+--------+--------+--------+
/// ```
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    ist_type: u16,
    offset_mid: u16,
    offset_hi: u32,
    zero: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GateType {
    /// Clears IF on entry.
    InterruptGate,
    /// Leaves IF alone.
    TrapGate,
}

impl IdtEntry {
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        ist_type: IdtGateAttr::new().into_bits(),
        offset_mid: 0,
        offset_hi: 0,
        zero: 0,
    };

    /// Point this gate at `handler`. The gate stays absent, ring-0 only and
    /// without IST until the builder says otherwise.
    pub const fn set_handler(&mut self, handler: u64) -> IdtEntryBuilder<'_> {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.offset_lo = handler as u16;
            self.offset_mid = (handler >> 16) as u16;
            self.offset_hi = (handler >> 32) as u32;
        }
        self.ist_type = IdtGateAttr::interrupt_gate().into_bits();
        IdtEntryBuilder { entry: self }
    }

    #[must_use]
    pub const fn handler(&self) -> u64 {
        self.offset_lo as u64 | (self.offset_mid as u64) << 16 | (self.offset_hi as u64) << 32
    }

    #[must_use]
    pub const fn selector(&self) -> u16 {
        self.selector
    }

    #[must_use]
    pub const fn attributes(&self) -> IdtGateAttr {
        IdtGateAttr::from_bits(self.ist_type)
    }
}

pub struct IdtEntryBuilder<'a> {
    entry: &'a mut IdtEntry,
}

impl IdtEntryBuilder<'_> {
    #[inline]
    pub const fn present(self, p: bool) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.ist_type).with_present(p);
        self.entry.ist_type = bf.into_bits();
        self
    }

    /// Privilege needed to raise this gate with `int n`.
    #[inline]
    pub fn dpl(self, dpl: u8) -> Self {
        debug_assert!(dpl <= 3);
        let bf = IdtGateAttr::from_bits(self.entry.ist_type).with_dpl(dpl);
        self.entry.ist_type = bf.into_bits();
        self
    }

    #[inline]
    pub const fn gate_interrupt(self) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.ist_type)
            .with_typ(0xE)
            .with_s(false);
        self.entry.ist_type = bf.into_bits();
        self
    }

    #[inline]
    pub const fn gate_trap(self) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.ist_type)
            .with_typ(0xF)
            .with_s(false);
        self.entry.ist_type = bf.into_bits();
        self
    }

    #[inline]
    pub const fn gate_type(self, gate_type: GateType) -> Self {
        match gate_type {
            GateType::InterruptGate => self.gate_interrupt(),
            GateType::TrapGate => self.gate_trap(),
        }
    }

    #[inline]
    pub const fn selector(self, sel: u16) -> Self {
        self.entry.selector = sel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_address_is_split_across_the_gate() {
        let mut idt = Idt::new();
        idt[32]
            .set_handler(0xFFFF_8000_1234_5678)
            .selector(0x08)
            .present(true)
            .gate_interrupt();

        let gate = idt[32];
        assert_eq!(gate.handler(), 0xFFFF_8000_1234_5678);
        assert_eq!(gate.selector(), 0x08);
        assert_eq!(gate.ist_type >> 8, 0x8E);
        assert_eq!(idt[33], IdtEntry::MISSING);
    }

    #[test]
    fn trap_gates_differ_only_in_type() {
        let mut idt = Idt::new();
        idt[3].set_handler(0x1000).present(true).gate_type(GateType::TrapGate);
        let attr = idt[3].attributes();
        assert_eq!(attr.typ(), 0xF);
        assert!(attr.present());
        assert_eq!(attr.dpl(), 0);
    }
}
