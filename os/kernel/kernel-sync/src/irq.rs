//! Control over the CPU's interrupt flag.
//!
//! Lock code only talks to [`InterruptControl`]; the x86 implementation is
//! [`X86Interrupts`], hosted tests plug in a plain flag.

/// Access to the interrupt-enable state of the current CPU.
pub trait InterruptControl {
    /// Whether maskable interrupts are currently delivered.
    fn enabled(&self) -> bool;

    /// Stop delivering maskable interrupts.
    fn disable(&self);

    /// Resume delivering maskable interrupts.
    fn enable(&self);
}

impl<I: InterruptControl + ?Sized> InterruptControl for &I {
    fn enabled(&self) -> bool {
        (**self).enabled()
    }

    fn disable(&self) {
        (**self).disable();
    }

    fn enable(&self) {
        (**self).enable();
    }
}

/// Interrupt flag bit in `RFLAGS`.
pub const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted. Misuse can
/// hang the system or violate execution environment rules.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted. Typically used
/// to restore a previously disabled interrupt state.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
///
/// Bit 9 ([`RFLAGS_IF`]) indicates whether interrupts are enabled.
#[cfg(target_arch = "x86_64")]
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// The real interrupt flag of an x86-64 CPU.
///
/// Requires a privileged context permitting `cli/sti`.
#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone, Debug, Default)]
pub struct X86Interrupts;

#[cfg(target_arch = "x86_64")]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn enabled(&self) -> bool {
        rflags() & RFLAGS_IF != 0
    }

    #[inline]
    fn disable(&self) {
        cli_stop_interrupts();
    }

    #[inline]
    fn enable(&self) {
        sti_enable_interrupts();
    }
}
