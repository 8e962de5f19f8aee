//! Single-CPU emulation on std threads.
//!
//! Every kernel thread gets its own std thread, but only the holder of the
//! baton runs: a context switch passes the baton to the incoming thread and
//! parks the outgoing one until the baton comes back. The interrupt flag is
//! a plain atomic.

use crate::{Platform, Scheduler, Stack, StackAllocator, ThreadStart};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{Cpu, InterruptControl};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

pub type HostedScheduler = Scheduler<HostedPlatform, HostedStacks>;

/// A started scheduler with `'static` lifetime, as threads require.
#[must_use]
pub fn boot() -> &'static HostedScheduler {
    let scheduler: &'static HostedScheduler = Box::leak(Box::new(Scheduler::new(
        HostedPlatform::new(),
        HostedStacks::new(),
    )));
    if let Err(error) = scheduler.start() {
        panic!("fresh scheduler refused to start: {error}");
    }
    scheduler
}

/// Emulated interrupt flag; enabled at reset.
pub struct HostedInterrupts(AtomicBool);

impl HostedInterrupts {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(true))
    }
}

impl Default for HostedInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for HostedInterrupts {
    fn enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn disable(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Baton {
    held: Mutex<bool>,
    passed: Condvar,
}

impl Baton {
    const fn new() -> Self {
        Self {
            held: Mutex::new(false),
            passed: Condvar::new(),
        }
    }

    fn give(&self) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.passed.notify_one();
    }

    fn wait(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while !*held {
            held = self
                .passed
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = false;
    }
}

#[derive(Clone)]
pub struct HostedContext(Arc<Baton>);

/// Unwinds an exited thread's std thread off its stack.
struct ThreadExited;

pub struct HostedPlatform {
    cpu: Cpu<HostedInterrupts>,
}

impl HostedPlatform {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cpu: Cpu::new(HostedInterrupts::new()),
        }
    }
}

impl Default for HostedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for HostedPlatform {
    type Context = HostedContext;
    type Interrupts = HostedInterrupts;

    fn cpu(&self) -> &Cpu<HostedInterrupts> {
        &self.cpu
    }

    fn bootstrap_context(&self) -> HostedContext {
        HostedContext(Arc::new(Baton::new()))
    }

    fn prime_new_stack(&'static self, _stack: &Stack, start: ThreadStart) -> HostedContext {
        let baton = Arc::new(Baton::new());
        let turn = Arc::clone(&baton);
        std::thread::spawn(move || {
            turn.wait();
            let outcome: std::thread::Result<()> = panic::catch_unwind(AssertUnwindSafe(|| {
                unsafe { start.release() };
                // the iretq of a real first switch does the same
                self.cpu.interrupts().enable();
                unsafe { start.run() }
            }));
            if let Err(payload) = outcome
                && !payload.is::<ThreadExited>()
            {
                panic::resume_unwind(payload);
            }
        });
        HostedContext(baton)
    }

    unsafe fn switch(&self, from: *mut HostedContext, to: *const HostedContext) {
        let (from, to) = unsafe { (Arc::clone(&(*from).0), Arc::clone(&(*to).0)) };
        to.give();
        from.wait();
    }

    unsafe fn switch_final(&self, to: *const HostedContext) -> ! {
        let to = unsafe { Arc::clone(&(*to).0) };
        to.give();
        panic::resume_unwind(Box::new(ThreadExited))
    }

    fn halt(&self) -> ! {
        panic!("CPU halted");
    }
}

/// Hands out address ranges that nothing ever touches; hosted threads run on
/// their std stacks.
pub struct HostedStacks {
    next: AtomicU64,
    live: AtomicUsize,
    released: AtomicUsize,
}

impl HostedStacks {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0x4000_0000),
            live: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Stacks handed out and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl Default for HostedStacks {
    fn default() -> Self {
        Self::new()
    }
}

impl StackAllocator for HostedStacks {
    fn allocate<I: InterruptControl>(&self, _cpu: &Cpu<I>, size: u64) -> Option<Stack> {
        // leave an unmapped guard page between stacks
        let base = self.next.fetch_add(size + PAGE_SIZE, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(Stack::new(VirtualAddress::new(base), size))
    }

    fn release<I: InterruptControl>(&self, _cpu: &Cpu<I>, _stack: Stack) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
