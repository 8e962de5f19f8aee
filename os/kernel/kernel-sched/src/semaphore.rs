use crate::queue::Fifo;
use crate::{Blocker, MAX_THREADS, Platform, SchedError, Scheduler, StackAllocator, ThreadId};
use core::cell::UnsafeCell;
use kernel_sync::RawSpin;

struct Inner {
    count: usize,
    waiters: Fifo<ThreadId, MAX_THREADS>,
}

/// Counting semaphore with FIFO waiters.
///
/// An `unlock` with waiters queued hands its unit straight to the oldest
/// waiter instead of raising the count, so a concurrent `try_lock` cannot
/// steal it.
pub struct Semaphore {
    lock: RawSpin,
    inner: UnsafeCell<Inner>,
}

// Safety: `inner` is only touched with `lock` held.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            lock: RawSpin::new(),
            inner: UnsafeCell::new(Inner {
                count,
                waiters: Fifo::new(),
            }),
        }
    }

    fn locked<P: Platform, S: StackAllocator, R>(
        &self,
        scheduler: &Scheduler<P, S>,
        f: impl FnOnce(&mut Inner) -> R,
    ) -> R {
        let cpu = scheduler.cpu();
        self.lock.lock_irq(cpu);
        // SAFETY: lock held.
        let result = f(unsafe { &mut *self.inner.get() });
        unsafe { self.lock.unlock_irq(cpu) };
        result
    }

    /// Take one unit, blocking the calling thread until one is available.
    ///
    /// # Errors
    /// Scheduler invariant violations while suspending.
    pub fn lock<P: Platform, S: StackAllocator>(
        &self,
        scheduler: &Scheduler<P, S>,
    ) -> Result<(), SchedError> {
        let queued = self.locked(scheduler, |inner| {
            if inner.count > 0 {
                inner.count -= 1;
                return Ok(None);
            }
            let id = scheduler.suspend_current(Blocker::of(self))?;
            inner
                .waiters
                .push_back(id)
                .map_err(|_| SchedError::Corrupted)?;
            Ok(Some(id))
        })?;

        match queued {
            None => Ok(()),
            Some(id) => {
                log::debug!("thread {id} blocked on semaphore {:p}", self);
                scheduler.yield_now()
            }
        }
    }

    /// Take one unit if available.
    pub fn try_lock<P: Platform, S: StackAllocator>(&self, scheduler: &Scheduler<P, S>) -> bool {
        self.locked(scheduler, |inner| {
            let available = inner.count > 0;
            if available {
                inner.count -= 1;
            }
            available
        })
    }

    /// Give back one unit, waking the oldest waiter if there is one.
    ///
    /// # Errors
    /// [`SchedError::NotSuspended`] if a queued waiter is not asleep.
    pub fn unlock<P: Platform, S: StackAllocator>(
        &self,
        scheduler: &Scheduler<P, S>,
    ) -> Result<(), SchedError> {
        self.locked(scheduler, |inner| match inner.waiters.pop_front() {
            Some(waiter) => scheduler.wakeup(waiter),
            None => {
                inner.count += 1;
                Ok(())
            }
        })
    }

    /// Start over with `count` units. Refused, returning `false`, while
    /// threads are waiting.
    pub fn reset<P: Platform, S: StackAllocator>(
        &self,
        scheduler: &Scheduler<P, S>,
        count: usize,
    ) -> bool {
        self.locked(scheduler, |inner| {
            let idle = inner.waiters.is_empty();
            if idle {
                inner.count = count;
            }
            idle
        })
    }

    pub fn count<P: Platform, S: StackAllocator>(&self, scheduler: &Scheduler<P, S>) -> usize {
        self.locked(scheduler, |inner| inner.count)
    }

    pub fn waiters<P: Platform, S: StackAllocator>(&self, scheduler: &Scheduler<P, S>) -> usize {
        self.locked(scheduler, |inner| inner.waiters.len())
    }
}
