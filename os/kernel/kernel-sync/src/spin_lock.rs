use crate::{Cpu, InterruptControl, RawSpin};
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

/// A value behind an interrupt-masking spinlock.
///
/// Every acquisition names the [`Cpu`] whose nesting counter it bumps; the
/// guard hands the count back on drop.
pub struct SpinLock<T> {
    raw: RawSpin,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            raw: RawSpin::new(),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock<'a, I: InterruptControl>(
        &'a self,
        cpu: &'a Cpu<I>,
    ) -> Option<SpinLockGuard<'a, T, I>> {
        self.raw
            .try_lock_irq(cpu)
            .then_some(SpinLockGuard { lock: self, cpu })
    }

    /// Disable interrupts and spin until acquired.
    #[inline]
    pub fn lock<'a, I: InterruptControl>(&'a self, cpu: &'a Cpu<I>) -> SpinLockGuard<'a, T, I> {
        self.raw.lock_irq(cpu);
        SpinLockGuard { lock: self, cpu }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<I: InterruptControl, R>(
        &self,
        cpu: &Cpu<I>,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let mut g = self.lock(cpu);
        f(&mut g)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct SpinLockGuard<'a, T, I: InterruptControl> {
    lock: &'a SpinLock<T>,
    cpu: &'a Cpu<I>,
}

impl<T, I: InterruptControl> Deref for SpinLockGuard<'_, T, I> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T, I: InterruptControl> DerefMut for SpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T, I: InterruptControl> Drop for SpinLockGuard<'_, T, I> {
    fn drop(&mut self) {
        unsafe { self.lock.raw.unlock_irq(self.cpu) };
    }
}
