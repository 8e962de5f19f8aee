use crate::{Cpu, InterruptControl};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Test-and-test-and-set spinlock without a payload.
///
/// The plain `lock`/`unlock` pair leaves interrupts alone. Kernel code uses
/// the `_irq` variants, which go through the [`Cpu`] nesting counter.
pub struct RawSpin {
    held: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// # Safety
    /// The caller must hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// Disable interrupts, then spin until the lock is ours.
    #[inline]
    pub fn lock_irq<I: InterruptControl>(&self, cpu: &Cpu<I>) {
        cpu.push_off();
        self.lock();
    }

    #[inline]
    pub fn try_lock_irq<I: InterruptControl>(&self, cpu: &Cpu<I>) -> bool {
        cpu.push_off();
        if self.try_lock() {
            true
        } else {
            cpu.pop_off();
            false
        }
    }

    /// Release the lock, then undo the interrupt disable of the matching
    /// [`lock_irq`](Self::lock_irq).
    ///
    /// # Safety
    /// The lock must be held through `cpu`. It need not have been taken by
    /// the calling thread: a lock held across a context switch is released
    /// by whichever thread runs next.
    #[inline]
    pub unsafe fn unlock_irq<I: InterruptControl>(&self, cpu: &Cpu<I>) {
        unsafe { self.unlock() };
        cpu.pop_off();
    }
}
