//! Legacy I/O port access.
//!
//! ```text
//! 0x0020-0x0021   PIC #1
//! 0x0040-0x0043   PIT
//! 0x0080          POST diagnostics, used as an I/O delay
//! 0x00A0-0x00A1   PIC #2
//! ```

/// Write one byte to an I/O port.
///
/// # Safety
/// Ring 0 (or I/O permission for `port`), and `port` must be a register of
/// the device the caller thinks it is programming.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
}

/// Read one byte from an I/O port.
///
/// # Safety
/// As for [`outb`].
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let mut v: u8;
    unsafe {
        core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
    }
    v
}

/// Give an old device time to settle between two writes.
///
/// # Safety
/// Ring 0.
#[inline]
pub unsafe fn io_wait() {
    unsafe { outb(0x80, 0) };
}
