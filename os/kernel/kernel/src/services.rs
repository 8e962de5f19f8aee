//! # OS services
//!
//! The narrow interface firmware-table interpreters and drivers build on:
//! device memory mapping, threads, semaphores, mutexes, spinlocks and one
//! interrupt handler. Objects live in fixed pools and are referred to by
//! handle; the kernel has no general-purpose heap to box them in.
//!
//! Timeouts are given in milliseconds and measured in timer ticks.

use crate::interrupts::{Handler, ServiceRoutine};
use crate::{Arch, Fatal, Kernel};
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use kernel_alloc::VmmError;
use kernel_info::memory::TIMER_FREQUENCY_HZ;
use kernel_sched::{SchedError, Semaphore, ThreadEntry, ThreadId};
use kernel_sync::RawSpin;
use kernel_vmem::{PhysicalAddress, VirtualAddress};

pub const MAX_SEMAPHORES: usize = 64;
pub const MAX_LOCKS: usize = 16;

/// Length of one [`timer`](Kernel::timer) unit.
pub const TIMER_UNIT_NS: u64 = 100;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("bad parameter")]
    BadParameter,
    #[error("no free slot")]
    NoMemory,
    #[error("timed out")]
    Timeout,
    #[error("already exists")]
    AlreadyExists,
    #[error("does not exist")]
    NotExist,
    #[error("threads are still waiting")]
    InUse,
    #[error(transparent)]
    Fatal(#[from] Fatal),
}

impl From<SchedError> for ServiceError {
    fn from(error: SchedError) -> Self {
        Self::Fatal(error.into())
    }
}

impl From<VmmError> for ServiceError {
    fn from(error: VmmError) -> Self {
        Self::Fatal(error.into())
    }
}

/// How long to wait for a semaphore unit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timeout {
    DoNotWait,
    Forever,
    Millis(u16),
}

impl Timeout {
    /// The usual 16-bit encoding: `0` never waits, `0xFFFF` waits forever.
    #[must_use]
    pub const fn from_millis(millis: u16) -> Self {
        match millis {
            0 => Self::DoNotWait,
            u16::MAX => Self::Forever,
            n => Self::Millis(n),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SemaphoreHandle(usize);

/// A semaphore created with one unit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MutexHandle(SemaphoreHandle);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LockHandle(usize);

/// Saved interrupt state returned by [`acquire_lock`](Kernel::acquire_lock).
///
/// Always zero: the lock nesting count in [`kernel_sync::Cpu`] already
/// remembers whether to re-enable interrupts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CpuFlags(pub usize);

struct Pool<T, const N: usize> {
    items: [T; N],
    taken: [AtomicBool; N],
}

impl<T, const N: usize> Pool<T, N> {
    const fn new(items: [T; N]) -> Self {
        Self {
            items,
            taken: [const { AtomicBool::new(false) }; N],
        }
    }

    fn claim(&self) -> Option<usize> {
        (0..N).find(|&index| !self.taken[index].swap(true, Ordering::AcqRel))
    }

    fn get(&self, index: usize) -> Result<&T, ServiceError> {
        match self.taken.get(index) {
            Some(taken) if taken.load(Ordering::Acquire) => Ok(&self.items[index]),
            _ => Err(ServiceError::BadParameter),
        }
    }

    fn free(&self, index: usize) -> Result<(), ServiceError> {
        match self.taken.get(index) {
            Some(taken) if taken.swap(false, Ordering::AcqRel) => Ok(()),
            _ => Err(ServiceError::BadParameter),
        }
    }
}

const NO_VECTOR: u16 = u16::MAX;

pub(crate) struct Services {
    semaphores: Pool<Semaphore, MAX_SEMAPHORES>,
    locks: Pool<RawSpin, MAX_LOCKS>,
    /// Vector of the one installed service routine, or [`NO_VECTOR`].
    installed: AtomicU16,
}

impl Services {
    pub(crate) const fn new() -> Self {
        Self {
            semaphores: Pool::new([const { Semaphore::new(0) }; MAX_SEMAPHORES]),
            locks: Pool::new([const { RawSpin::new() }; MAX_LOCKS]),
            installed: AtomicU16::new(NO_VECTOR),
        }
    }
}

impl<A: Arch> Kernel<A> {
    /// Map `len` bytes of device memory at `pa`.
    ///
    /// # Errors
    /// Out of heap space or physical memory for the tables.
    pub fn map_memory(
        &self,
        pa: PhysicalAddress,
        len: u64,
    ) -> Result<Option<VirtualAddress>, ServiceError> {
        Ok(self.memory().with(self.cpu(), |vmm| vmm.map(pa, len))??)
    }

    /// Undo [`map_memory`](Self::map_memory).
    ///
    /// # Errors
    /// The memory manager is busy or not up.
    pub fn unmap_memory(&self, va: VirtualAddress, len: u64) -> Result<(), ServiceError> {
        self.memory().with(self.cpu(), |vmm| vmm.unmap(va, len))?;
        Ok(())
    }

    /// Id of the calling thread; never zero.
    ///
    /// # Errors
    /// The scheduler has not been started.
    pub fn thread_id(&self) -> Result<ThreadId, ServiceError> {
        Ok(self.scheduler().current().ok_or(SchedError::NotStarted)?)
    }

    /// Run `function(context)` on a new thread.
    ///
    /// # Errors
    /// No stack or thread slot is left.
    pub fn execute(&self, function: ThreadEntry, context: usize) -> Result<ThreadId, ServiceError> {
        Ok(self.scheduler().spawn(function, context)?)
    }

    /// Yield until at least `millis` milliseconds of timer ticks have passed.
    ///
    /// # Errors
    /// Scheduler invariant violations.
    pub fn sleep(&self, millis: u64) -> Result<(), ServiceError> {
        let deadline = self.deadline(millis);
        while self.scheduler().ticks() < deadline {
            self.scheduler().yield_now()?;
        }
        Ok(())
    }

    /// Time since the scheduler started, in 100 ns units.
    #[must_use]
    pub fn timer(&self) -> u64 {
        const UNITS_PER_TICK: u64 = 1_000_000_000 / TIMER_UNIT_NS / TIMER_FREQUENCY_HZ;
        self.scheduler().ticks() * UNITS_PER_TICK
    }

    fn deadline(&self, millis: u64) -> u64 {
        let ticks = millis.saturating_mul(TIMER_FREQUENCY_HZ) / 1000;
        self.scheduler().ticks().saturating_add(ticks)
    }

    /// # Errors
    /// [`ServiceError::NoMemory`] once all slots are taken.
    pub fn create_semaphore(&self, initial: usize) -> Result<SemaphoreHandle, ServiceError> {
        let pool = &self.services.semaphores;
        let index = pool.claim().ok_or(ServiceError::NoMemory)?;
        if !pool.items[index].reset(self.scheduler(), initial) {
            // a free slot with sleepers means a thread outlived its delete
            pool.free(index)?;
            return Err(ServiceError::InUse);
        }
        Ok(SemaphoreHandle(index))
    }

    /// # Errors
    /// [`ServiceError::InUse`] while threads wait on it,
    /// [`ServiceError::BadParameter`] for a stale handle.
    pub fn delete_semaphore(&self, handle: SemaphoreHandle) -> Result<(), ServiceError> {
        let pool = &self.services.semaphores;
        if pool.get(handle.0)?.waiters(self.scheduler()) > 0 {
            return Err(ServiceError::InUse);
        }
        pool.free(handle.0)
    }

    /// Take `units` units, all or nothing.
    ///
    /// # Errors
    /// [`ServiceError::Timeout`] if they could not all be had in time; the
    /// units taken so far are given back.
    pub fn wait_semaphore(
        &self,
        handle: SemaphoreHandle,
        units: usize,
        timeout: Timeout,
    ) -> Result<(), ServiceError> {
        let semaphore = self.services.semaphores.get(handle.0)?;
        let deadline = match timeout {
            Timeout::Millis(millis) => self.deadline(u64::from(millis)),
            _ => 0,
        };

        for taken in 0..units {
            if let Err(error) = self.acquire(semaphore, timeout, deadline) {
                for _ in 0..taken {
                    semaphore.unlock(self.scheduler())?;
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn acquire(&self, semaphore: &Semaphore, timeout: Timeout, deadline: u64) -> Result<(), ServiceError> {
        let scheduler = self.scheduler();
        match timeout {
            Timeout::Forever => Ok(semaphore.lock(scheduler)?),
            Timeout::DoNotWait if semaphore.try_lock(scheduler) => Ok(()),
            Timeout::DoNotWait => Err(ServiceError::Timeout),
            Timeout::Millis(_) => loop {
                if semaphore.try_lock(scheduler) {
                    return Ok(());
                }
                if scheduler.ticks() >= deadline {
                    return Err(ServiceError::Timeout);
                }
                scheduler.yield_now()?;
            },
        }
    }

    /// Give back `units` units.
    ///
    /// # Errors
    /// [`ServiceError::BadParameter`] for a stale handle.
    pub fn signal_semaphore(&self, handle: SemaphoreHandle, units: usize) -> Result<(), ServiceError> {
        let semaphore = self.services.semaphores.get(handle.0)?;
        for _ in 0..units {
            semaphore.unlock(self.scheduler())?;
        }
        Ok(())
    }

    /// # Errors
    /// [`ServiceError::NoMemory`] once all semaphore slots are taken.
    pub fn create_mutex(&self) -> Result<MutexHandle, ServiceError> {
        self.create_semaphore(1).map(MutexHandle)
    }

    /// # Errors
    /// As for [`delete_semaphore`](Self::delete_semaphore).
    pub fn delete_mutex(&self, handle: MutexHandle) -> Result<(), ServiceError> {
        self.delete_semaphore(handle.0)
    }

    /// # Errors
    /// As for [`wait_semaphore`](Self::wait_semaphore).
    pub fn acquire_mutex(&self, handle: MutexHandle, timeout: Timeout) -> Result<(), ServiceError> {
        self.wait_semaphore(handle.0, 1, timeout)
    }

    /// # Errors
    /// As for [`signal_semaphore`](Self::signal_semaphore).
    pub fn release_mutex(&self, handle: MutexHandle) -> Result<(), ServiceError> {
        self.signal_semaphore(handle.0, 1)
    }

    /// # Errors
    /// [`ServiceError::NoMemory`] once all lock slots are taken.
    pub fn create_lock(&self) -> Result<LockHandle, ServiceError> {
        self.services
            .locks
            .claim()
            .map(LockHandle)
            .ok_or(ServiceError::NoMemory)
    }

    /// # Errors
    /// [`ServiceError::InUse`] while held, [`ServiceError::BadParameter`]
    /// for a stale handle.
    pub fn delete_lock(&self, handle: LockHandle) -> Result<(), ServiceError> {
        let locks = &self.services.locks;
        if locks.get(handle.0)?.is_locked() {
            return Err(ServiceError::InUse);
        }
        locks.free(handle.0)
    }

    /// Spin until the lock is ours. Interrupts stay off until the matching
    /// [`release_lock`](Self::release_lock).
    ///
    /// # Errors
    /// [`ServiceError::BadParameter`] for a stale handle.
    pub fn acquire_lock(&self, handle: LockHandle) -> Result<CpuFlags, ServiceError> {
        self.services.locks.get(handle.0)?.lock_irq(self.cpu());
        Ok(CpuFlags(0))
    }

    /// # Errors
    /// [`ServiceError::BadParameter`] for a stale handle or a lock that is
    /// not held.
    pub fn release_lock(&self, handle: LockHandle, _flags: CpuFlags) -> Result<(), ServiceError> {
        let lock = self.services.locks.get(handle.0)?;
        if !lock.is_locked() {
            return Err(ServiceError::BadParameter);
        }
        // SAFETY: held, and taken through `acquire_lock` with `lock_irq`.
        unsafe { lock.unlock_irq(self.cpu()) };
        Ok(())
    }

    /// Route `vector` to `routine(context)`. Only one routine can be
    /// installed at a time.
    ///
    /// # Errors
    /// [`ServiceError::BadParameter`] for vectors past 255,
    /// [`ServiceError::AlreadyExists`] if a routine is installed or the
    /// vector is taken by the kernel.
    pub fn install_interrupt_handler(
        &self,
        vector: u32,
        routine: ServiceRoutine,
        context: usize,
    ) -> Result<(), ServiceError> {
        let vector = u8::try_from(vector).map_err(|_| ServiceError::BadParameter)?;
        let installed = &self.services.installed;
        if installed
            .compare_exchange(NO_VECTOR, u16::from(vector), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServiceError::AlreadyExists);
        }

        let handler = Handler::Service { routine, context };
        if self.interrupts().register(self.cpu(), vector, handler).is_err() {
            installed.store(NO_VECTOR, Ordering::Release);
            return Err(ServiceError::AlreadyExists);
        }
        log::debug!("service routine installed on vector {vector}");
        Ok(())
    }

    /// # Errors
    /// [`ServiceError::NotExist`] if no routine is installed on `vector`.
    pub fn remove_interrupt_handler(&self, vector: u32) -> Result<(), ServiceError> {
        let vector = u8::try_from(vector).map_err(|_| ServiceError::BadParameter)?;
        self.services
            .installed
            .compare_exchange(u16::from(vector), NO_VECTOR, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ServiceError::NotExist)?;
        self.interrupts().unregister(self.cpu(), vector);
        Ok(())
    }
}
