//! # 8259 PIC pair
//!
//! The master serves IRQ 0-7, the slave IRQ 8-15 through the master's line
//! 2. After [`Pic8259::init`] both deliver at `offset..offset + 16` with
//! every line masked.

use super::ports::{inb, io_wait, outb};
use crate::interrupts::IrqController;

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const OCW3_READ_ISR: u8 = 0x0B;
const EOI: u8 = 0x20;

const CASCADE_IRQ: u8 = 2;

/// The two legacy interrupt controllers. Holds no state of its own; the
/// mask lives in the chips.
#[derive(Debug, Default, Copy, Clone)]
pub struct Pic8259;

impl Pic8259 {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Remap both controllers to `offset` and mask every line.
    ///
    /// # Safety
    /// Ring 0 with interrupts disabled; nothing else may program the PICs
    /// at the same time.
    pub unsafe fn init(&self, offset: u8) {
        unsafe {
            outb(MASTER_COMMAND, ICW1_INIT | ICW1_ICW4);
            io_wait();
            outb(SLAVE_COMMAND, ICW1_INIT | ICW1_ICW4);
            io_wait();
            outb(MASTER_DATA, offset);
            io_wait();
            outb(SLAVE_DATA, offset + 8);
            io_wait();
            // the slave hangs off IRQ 2
            outb(MASTER_DATA, 1 << CASCADE_IRQ);
            io_wait();
            outb(SLAVE_DATA, CASCADE_IRQ);
            io_wait();
            outb(MASTER_DATA, ICW4_8086);
            io_wait();
            outb(SLAVE_DATA, ICW4_8086);
            io_wait();

            outb(MASTER_DATA, 0xFF);
            outb(SLAVE_DATA, 0xFF);
        }
        log::debug!("PIC remapped to vectors {offset}..{}", offset + 16);
    }

    const fn data_port(irq: u8) -> (u16, u8) {
        if irq < 8 {
            (MASTER_DATA, irq)
        } else {
            (SLAVE_DATA, irq - 8)
        }
    }

    fn in_service(command: u16) -> u8 {
        unsafe {
            outb(command, OCW3_READ_ISR);
            inb(command)
        }
    }
}

impl IrqController for Pic8259 {
    fn is_spurious(&self, irq: u8) -> bool {
        match irq {
            7 => Self::in_service(MASTER_COMMAND) & 0x80 == 0,
            15 => {
                let spurious = Self::in_service(SLAVE_COMMAND) & 0x80 == 0;
                if spurious {
                    // the master did see a real request on the cascade line
                    unsafe { outb(MASTER_COMMAND, EOI) };
                }
                spurious
            }
            _ => false,
        }
    }

    fn mask(&self, irq: u8) {
        let (port, line) = Self::data_port(irq);
        unsafe { outb(port, inb(port) | (1 << line)) };
    }

    fn unmask(&self, irq: u8) {
        let (port, line) = Self::data_port(irq);
        unsafe { outb(port, inb(port) & !(1 << line)) };
        if irq >= 8 {
            self.unmask(CASCADE_IRQ);
        }
    }

    fn end_of_interrupt(&self, irq: u8) {
        unsafe {
            if irq >= 8 {
                outb(SLAVE_COMMAND, EOI);
            }
            outb(MASTER_COMMAND, EOI);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_above_seven_belong_to_the_slave() {
        assert_eq!(Pic8259::data_port(0), (MASTER_DATA, 0));
        assert_eq!(Pic8259::data_port(7), (MASTER_DATA, 7));
        assert_eq!(Pic8259::data_port(8), (SLAVE_DATA, 0));
        assert_eq!(Pic8259::data_port(15), (SLAVE_DATA, 7));
    }
}
