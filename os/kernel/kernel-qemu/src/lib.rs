//! # QEMU debug console
//!
//! Kernel log output for machines started with `-debugcon`. Every byte
//! written to I/O port `0x402` shows up on the host side:
//!
//! ```bash
//! qemu-system-x86_64 ... -debugcon stdio
//! ```
//!
//! The crate has two entry points:
//!
//! * [`qemu_trace!`] formats straight into the port without allocating.
//! * [`QemuLogger`] is a `log::Log` backend on top of it, so the rest of the
//!   kernel only ever talks to the `log` facade.
//!
//! Without the `enabled` feature the port is never touched and the macro
//! compiles to nothing, which keeps hosted test builds free of `out`
//! instructions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    const QEMU_DEBUG_PORT: u16 = 0x402;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // best effort, there is nobody to report a failed write to
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[inline]
    pub const fn qemu_write(_: fmt::Arguments) {}
}

/// `print!`-style output to the QEMU debug console.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
