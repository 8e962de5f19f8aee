use crate::{Platform, Scheduler, StackAllocator};
use core::fmt;
use core::num::NonZeroU32;
use kernel_memory_addresses::VirtualAddress;

/// Function a kernel thread runs, with its context word.
pub type ThreadEntry = extern "C" fn(usize);

/// Identifier of a kernel thread. Never zero, never reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(NonZeroU32);

impl ThreadId {
    #[must_use]
    pub const fn new(id: NonZeroU32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// On the CPU. Exactly one thread is in this state.
    Running,
    /// Queued on the ready list.
    Ready,
    /// Waiting for a [`wakeup`](Scheduler::wakeup).
    Suspended,
    /// Finished; waiting to be reaped.
    Exited,
}

/// How the next switch to a thread resumes it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadPhase {
    /// Never ran; resumes in the entry trampoline.
    Fresh,
    /// Resumes where its last switch left off.
    Started,
}

/// What a suspended thread is waiting for, by address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Blocker(usize);

impl Blocker {
    pub fn of<T>(object: &T) -> Self {
        Self(core::ptr::from_ref(object).addr())
    }
}

/// A thread stack: `size` bytes upward from `base`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Stack {
    base: VirtualAddress,
    size: u64,
}

impl Stack {
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        Self { base, size }
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// One past the highest byte; stacks grow down from here.
    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }
}

/// Everything a freshly primed stack needs to get going.
///
/// The scheduler is carried type-erased so that architecture code can store
/// this on a raw stack and call back without knowing the scheduler's type.
pub struct ThreadStart {
    entry: ThreadEntry,
    arg: usize,
    scheduler: *const (),
    release: unsafe fn(*const ()),
    exit: unsafe fn(*const ()) -> !,
}

// The scheduler behind the pointer is 'static and Sync.
unsafe impl Send for ThreadStart {}

impl ThreadStart {
    pub(crate) fn new<P: Platform, S: StackAllocator>(
        scheduler: &'static Scheduler<P, S>,
        entry: ThreadEntry,
        arg: usize,
    ) -> Self {
        Self {
            entry,
            arg,
            scheduler: core::ptr::from_ref(scheduler).cast(),
            release: release_handoff::<P, S>,
            exit: exit_thread::<P, S>,
        }
    }

    #[must_use]
    pub const fn entry(&self) -> ThreadEntry {
        self.entry
    }

    #[must_use]
    pub const fn arg(&self) -> usize {
        self.arg
    }

    /// Release the scheduler lock inherited from the switch that started
    /// this thread.
    ///
    /// # Safety
    /// Call exactly once, first thing on the new thread.
    pub unsafe fn release(&self) {
        unsafe { (self.release)(self.scheduler) }
    }

    /// Retire the calling thread.
    ///
    /// # Safety
    /// Must run on the thread this start record was primed for.
    pub unsafe fn exit(&self) -> ! {
        unsafe { (self.exit)(self.scheduler) }
    }

    /// Call the entry function, then exit.
    ///
    /// # Safety
    /// As for [`exit`](Self::exit); [`release`](Self::release) must have
    /// run first.
    pub unsafe fn run(&self) -> ! {
        (self.entry)(self.arg);
        unsafe { self.exit() }
    }
}

unsafe fn release_handoff<P: Platform, S: StackAllocator>(scheduler: *const ()) {
    let scheduler = unsafe { &*scheduler.cast::<Scheduler<P, S>>() };
    unsafe { scheduler.finish_handoff() };
}

unsafe fn exit_thread<P: Platform, S: StackAllocator>(scheduler: *const ()) -> ! {
    let scheduler = unsafe { &*scheduler.cast::<Scheduler<P, S>>() };
    scheduler.exit()
}

/// A slot in the thread table.
pub(crate) struct Thread<C> {
    pub id: ThreadId,
    pub state: ThreadState,
    pub phase: ThreadPhase,
    pub blocker: Option<Blocker>,
    /// `None` for the boot thread, which runs on the loader's stack.
    pub stack: Option<Stack>,
    pub context: C,
}
