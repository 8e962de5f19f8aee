//! 8253/8254 interval timer, channel 0 wired to IRQ 0.

use super::ports::outb;

const CHANNEL0_DATA: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary.
const CHANNEL0_SQUARE_WAVE: u8 = 0b0011_0110;

/// Input clock of the PIT in Hz.
pub const BASE_FREQUENCY_HZ: u64 = 1_193_182;

/// Reload value for an interrupt rate of `hz`, clamped to what the 16-bit
/// counter can express.
#[must_use]
pub const fn divisor(hz: u64) -> u16 {
    let raw = BASE_FREQUENCY_HZ / if hz == 0 { 1 } else { hz };
    if raw > u16::MAX as u64 {
        u16::MAX
    } else if raw == 0 {
        1
    } else {
        #[allow(clippy::cast_possible_truncation)]
        let divisor = raw as u16;
        divisor
    }
}

/// Program channel 0 to fire at `hz`.
///
/// # Safety
/// Ring 0, interrupts disabled.
pub unsafe fn start(hz: u64) {
    let [lo, hi] = divisor(hz).to_le_bytes();
    unsafe {
        outb(COMMAND, CHANNEL0_SQUARE_WAVE);
        outb(CHANNEL0_DATA, lo);
        outb(CHANNEL0_DATA, hi);
    }
    log::debug!("PIT running at {hz} Hz");
}
