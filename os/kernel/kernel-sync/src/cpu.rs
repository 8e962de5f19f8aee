use crate::InterruptControl;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Lock nesting state of the (single) CPU.
///
/// Every spinlock acquisition goes through [`Cpu::push_off`] and every
/// release through [`Cpu::pop_off`]. The interrupt state seen by the
/// outermost acquisition is restored by the matching outermost release.
///
/// Only interrupts can interleave with the owner, and they are off for as
/// long as `depth > 0`, so relaxed atomics are enough.
pub struct Cpu<I> {
    interrupts: I,
    depth: AtomicUsize,
    enable_on_release: AtomicBool,
}

impl<I: InterruptControl> Cpu<I> {
    #[must_use]
    pub const fn new(interrupts: I) -> Self {
        Self {
            interrupts,
            depth: AtomicUsize::new(0),
            enable_on_release: AtomicBool::new(false),
        }
    }

    #[inline]
    pub const fn interrupts(&self) -> &I {
        &self.interrupts
    }

    /// Number of spinlocks currently held.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Disable interrupts ahead of taking a lock.
    pub fn push_off(&self) {
        let enabled = self.interrupts.enabled();
        self.interrupts.disable();
        if self.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            self.enable_on_release.store(enabled, Ordering::Relaxed);
        }
    }

    /// Undo one [`push_off`](Self::push_off) after releasing a lock.
    ///
    /// # Panics
    /// If interrupts are enabled or no lock is held; either means the
    /// nesting bookkeeping is corrupt.
    pub fn pop_off(&self) {
        assert!(
            !self.interrupts.enabled(),
            "spinlock released with interrupts enabled"
        );
        let depth = self.depth.load(Ordering::Relaxed);
        assert!(depth > 0, "spinlock released while none is held");

        self.depth.store(depth - 1, Ordering::Relaxed);
        if depth == 1 && self.enable_on_release.load(Ordering::Relaxed) {
            self.interrupts.enable();
        }
    }

    /// Whether the outermost release will turn interrupts back on.
    ///
    /// This belongs to the thread that took the outermost lock. A context
    /// switch performed under a lock saves it before switching and puts it
    /// back once the thread runs again.
    #[inline]
    pub fn enable_on_release(&self) -> bool {
        self.enable_on_release.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_enable_on_release(&self, enable: bool) {
        self.enable_on_release.store(enable, Ordering::Relaxed);
    }
}

impl<I: InterruptControl + Default> Default for Cpu<I> {
    fn default() -> Self {
        Self::new(I::default())
    }
}
