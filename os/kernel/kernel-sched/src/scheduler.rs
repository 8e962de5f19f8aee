use crate::queue::Fifo;
use crate::thread::Thread;
use crate::{
    Blocker, MAX_THREADS, Platform, SchedError, StackAllocator, ThreadEntry, ThreadId,
    ThreadPhase, ThreadStart, ThreadState,
};
use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::num::NonZeroU32;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::THREAD_STACK_SIZE;
use kernel_sync::{Cpu, InterruptControl, RawSpin};

type Slot = usize;

struct State<C> {
    threads: [Option<Thread<C>>; MAX_THREADS],
    current: Option<Slot>,
    ready: Fifo<Slot, MAX_THREADS>,
    suspended: Fifo<Slot, MAX_THREADS>,
    zombies: Fifo<Slot, MAX_THREADS>,
    last_id: u32,
}

impl<C> State<C> {
    const fn new() -> Self {
        Self {
            threads: [const { None }; MAX_THREADS],
            current: None,
            ready: Fifo::new(),
            suspended: Fifo::new(),
            zombies: Fifo::new(),
            last_id: 0,
        }
    }

    fn find(&self, id: ThreadId) -> Option<Slot> {
        self.threads
            .iter()
            .position(|t| t.as_ref().is_some_and(|t| t.id == id))
    }

    fn free_slot(&self) -> Option<Slot> {
        self.threads.iter().position(Option::is_none)
    }

    fn next_id(&mut self) -> ThreadId {
        self.last_id += 1;
        ThreadId::new(NonZeroU32::new(self.last_id).unwrap_or(NonZeroU32::MIN))
    }

    fn thread(&self, id: ThreadId) -> Option<&Thread<C>> {
        self.threads.iter().flatten().find(|t| t.id == id)
    }

    fn current(&mut self) -> Result<(Slot, &mut Thread<C>), SchedError> {
        let slot = self.current.ok_or(SchedError::NotStarted)?;
        let thread = self.threads[slot].as_mut().ok_or(SchedError::Corrupted)?;
        Ok((slot, thread))
    }
}

/// The ready, suspended and zombie lists plus the current thread, behind the
/// scheduler lock.
///
/// Lists are strict FIFO, so threads that keep yielding take turns in the
/// order they became ready.
pub struct Scheduler<P: Platform, S: StackAllocator> {
    platform: P,
    stacks: S,
    lock: RawSpin,
    ticks: AtomicU64,
    state: UnsafeCell<State<P::Context>>,
}

// Safety: `state` is only touched with `lock` held.
unsafe impl<P: Platform, S: StackAllocator + Sync> Sync for Scheduler<P, S> {}

impl<P: Platform, S: StackAllocator> Scheduler<P, S> {
    pub const fn new(platform: P, stacks: S) -> Self {
        Self {
            platform,
            stacks,
            lock: RawSpin::new(),
            ticks: AtomicU64::new(0),
            state: UnsafeCell::new(State::new()),
        }
    }

    #[inline]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    pub fn cpu(&self) -> &Cpu<P::Interrupts> {
        self.platform.cpu()
    }

    #[inline]
    pub const fn stacks(&self) -> &S {
        &self.stacks
    }

    /// # Safety
    /// The scheduler lock must be held, and the reference must not outlive
    /// it or cross a context switch.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut State<P::Context> {
        unsafe { &mut *self.state.get() }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State<P::Context>) -> R) -> R {
        let cpu = self.cpu();
        self.lock.lock_irq(cpu);
        let result = f(unsafe { self.state() });
        unsafe { self.lock.unlock_irq(cpu) };
        result
    }

    /// Adopt the code that is currently running as the first thread.
    ///
    /// # Errors
    /// [`SchedError::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<ThreadId, SchedError> {
        let id = self.with_state(|state| {
            if state.current.is_some() {
                return Err(SchedError::AlreadyStarted);
            }
            let slot = state.free_slot().ok_or(SchedError::TooManyThreads)?;
            let id = state.next_id();
            state.threads[slot] = Some(Thread {
                id,
                state: ThreadState::Running,
                phase: ThreadPhase::Started,
                blocker: None,
                stack: None,
                context: self.platform.bootstrap_context(),
            });
            state.current = Some(slot);
            Ok(id)
        })?;
        log::debug!("boot thread adopted as {id}");
        Ok(id)
    }

    /// Create a thread running `entry(arg)` and queue it as ready.
    ///
    /// # Errors
    /// [`SchedError::StackUnavailable`] or [`SchedError::TooManyThreads`].
    pub fn spawn(&'static self, entry: ThreadEntry, arg: usize) -> Result<ThreadId, SchedError> {
        let stack = self
            .stacks
            .allocate(self.cpu(), THREAD_STACK_SIZE)
            .ok_or(SchedError::StackUnavailable)?;

        let created = self.with_state(|state| {
            let slot = state.free_slot().ok_or(SchedError::TooManyThreads)?;
            let id = state.next_id();
            let context = self
                .platform
                .prime_new_stack(&stack, ThreadStart::new(self, entry, arg));
            state.threads[slot] = Some(Thread {
                id,
                state: ThreadState::Ready,
                phase: ThreadPhase::Fresh,
                blocker: None,
                stack: Some(stack),
                context,
            });
            state
                .ready
                .push_back(slot)
                .map_err(|_| SchedError::Corrupted)?;
            Ok(id)
        });

        match created {
            Ok(id) => {
                log::debug!("spawned thread {id}, stack top {}", stack.top());
                Ok(id)
            }
            Err(error) => {
                self.stacks.release(self.cpu(), stack);
                Err(error)
            }
        }
    }

    /// Let the next ready thread run.
    ///
    /// Returns immediately if nothing else is ready. A suspended caller only
    /// returns once woken up.
    ///
    /// # Errors
    /// Any violated switch precondition, for example calling this while
    /// holding another spinlock.
    pub fn yield_now(&self) -> Result<(), SchedError> {
        let cpu = self.cpu();
        self.lock.lock_irq(cpu);
        let result = self
            .check_switch()
            .and_then(|()| unsafe { self.demote_current() })
            .and_then(|()| unsafe { self.schedule() });
        unsafe { self.lock.unlock_irq(cpu) };
        result
    }

    /// Count a timer tick and yield.
    ///
    /// A tick taken while the CPU holds a lock or sits in another critical
    /// section is only counted; the interrupted code switches at its next
    /// yield.
    ///
    /// # Errors
    /// As for [`yield_now`](Self::yield_now).
    pub fn tick(&self) -> Result<(), SchedError> {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let depth = self.cpu().depth();
        if depth > 0 {
            log::trace!("tick {ticks} at lock depth {depth}, not switching");
            return Ok(());
        }
        self.yield_now()
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Make a suspended thread ready again.
    ///
    /// # Errors
    /// [`SchedError::NotSuspended`] if `id` isn't waiting for anything.
    pub fn wakeup(&self, id: ThreadId) -> Result<(), SchedError> {
        self.with_state(|state| {
            let slot = state.find(id).ok_or(SchedError::UnknownThread(id))?;
            let is_current = state.current == Some(slot);
            let thread = state.threads[slot].as_mut().ok_or(SchedError::Corrupted)?;
            if thread.state != ThreadState::Suspended {
                return Err(SchedError::NotSuspended {
                    id,
                    state: thread.state,
                });
            }
            thread.blocker = None;

            // Woken from an interrupt before it got around to yielding.
            if is_current {
                thread.state = ThreadState::Running;
                return Ok(());
            }

            thread.state = ThreadState::Ready;
            state.suspended.remove(slot);
            state
                .ready
                .push_back(slot)
                .map_err(|_| SchedError::Corrupted)?;
            log::trace!("woke thread {id}");
            Ok(())
        })
    }

    /// Mark the running thread as waiting for `blocker`.
    ///
    /// The caller must yield afterwards; the thread keeps running until then.
    pub(crate) fn suspend_current(&self, blocker: Blocker) -> Result<ThreadId, SchedError> {
        self.with_state(|state| {
            let (_, thread) = state.current()?;
            if thread.state != ThreadState::Running {
                return Err(SchedError::NotRunning {
                    id: thread.id,
                    state: thread.state,
                });
            }
            thread.state = ThreadState::Suspended;
            thread.blocker = Some(blocker);
            Ok(thread.id)
        })
    }

    /// Retire the running thread. Its stack stays allocated until reaped.
    ///
    /// Halts the CPU if no other thread can run.
    pub fn exit(&self) -> ! {
        self.lock.lock_irq(self.cpu());
        let error = match unsafe { self.retire_current() } {
            Ok(never) => match never {},
            Err(error) => error,
        };
        log::error!("Fatal error: {error}");
        self.platform.halt()
    }

    /// Free the stacks of all exited threads and forget them.
    pub fn reap(&self) -> usize {
        let mut reaped = 0;
        while let Some(thread) = self.with_state(|state| {
            let slot = state.zombies.pop_front()?;
            state.threads[slot].take()
        }) {
            self.bury(thread);
            reaped += 1;
        }
        reaped
    }

    /// Wait for thread `id` to exit, then reap it.
    ///
    /// # Errors
    /// [`SchedError::JoinSelf`], [`SchedError::UnknownThread`] if `id` never
    /// existed or was already reaped, or any error from yielding.
    pub fn join(&self, id: ThreadId) -> Result<(), SchedError> {
        if self.current() == Some(id) {
            return Err(SchedError::JoinSelf);
        }

        loop {
            match self.state_of(id) {
                None => return Err(SchedError::UnknownThread(id)),
                Some(ThreadState::Exited) => break,
                Some(_) => self.yield_now()?,
            }
        }

        let thread = self.with_state(|state| {
            let slot = state.find(id)?;
            state.zombies.remove(slot);
            state.threads[slot].take()
        });
        thread.map(|t| self.bury(t)).ok_or(SchedError::UnknownThread(id))
    }

    fn bury(&self, thread: Thread<P::Context>) {
        log::debug!("reaped thread {}", thread.id);
        if let Some(stack) = thread.stack {
            self.stacks.release(self.cpu(), stack);
        }
    }

    /// The running thread, once [`start`](Self::start)ed.
    pub fn current(&self) -> Option<ThreadId> {
        self.with_state(|state| state.current().ok().map(|(_, t)| t.id))
    }

    pub fn state_of(&self, id: ThreadId) -> Option<ThreadState> {
        self.with_state(|state| state.thread(id).map(|t| t.state))
    }

    pub fn phase_of(&self, id: ThreadId) -> Option<ThreadPhase> {
        self.with_state(|state| state.thread(id).map(|t| t.phase))
    }

    pub fn blocker_of(&self, id: ThreadId) -> Option<Blocker> {
        self.with_state(|state| state.thread(id).and_then(|t| t.blocker))
    }

    pub fn ready_count(&self) -> usize {
        self.with_state(|state| state.ready.len())
    }

    /// Threads in the table, the exited but unreaped ones included.
    pub fn thread_count(&self) -> usize {
        self.with_state(|state| state.threads.iter().flatten().count())
    }

    /// Second half of a first switch: drop the lock the switching thread took.
    ///
    /// # Safety
    /// Only from the entry trampoline of a thread that was just switched to.
    pub(crate) unsafe fn finish_handoff(&self) {
        unsafe { self.lock.unlock_irq(self.cpu()) };
    }

    /// Running -> Ready ahead of a yield. A suspending thread stays put.
    unsafe fn demote_current(&self) -> Result<(), SchedError> {
        let state = unsafe { self.state() };
        let (_, thread) = state.current()?;
        match thread.state {
            ThreadState::Running => {
                thread.state = ThreadState::Ready;
                Ok(())
            }
            ThreadState::Suspended => Ok(()),
            other => Err(SchedError::NotRunning {
                id: thread.id,
                state: other,
            }),
        }
    }

    fn check_switch(&self) -> Result<(), SchedError> {
        let cpu = self.cpu();
        if !self.lock.is_locked() {
            return Err(SchedError::NotLocked);
        }
        if cpu.depth() != 1 {
            return Err(SchedError::LockDepth(cpu.depth()));
        }
        if cpu.interrupts().enabled() {
            return Err(SchedError::InterruptsEnabled);
        }
        Ok(())
    }

    /// File the outgoing thread by its state and switch to the head of the
    /// ready list.
    ///
    /// # Safety
    /// Scheduler lock held by the caller.
    unsafe fn schedule(&self) -> Result<(), SchedError> {
        self.check_switch()?;
        let state = unsafe { self.state() };
        let current = state.current.ok_or(SchedError::NotStarted)?;
        let outgoing = state.threads[current].as_mut().ok_or(SchedError::Corrupted)?;

        let filed = match outgoing.state {
            ThreadState::Running => return Err(SchedError::StillRunning(outgoing.id)),
            ThreadState::Ready if state.ready.is_empty() => {
                outgoing.state = ThreadState::Running;
                return Ok(());
            }
            ThreadState::Ready => state.ready.push_back(current),
            ThreadState::Suspended => state.suspended.push_back(current),
            ThreadState::Exited => state.zombies.push_back(current),
        };
        filed.map_err(|_| SchedError::Corrupted)?;

        let (from, to) = Self::activate_next(state, current)?;

        let cpu = self.cpu();
        let enable_on_release = cpu.enable_on_release();
        unsafe { self.platform.switch(from, to) };
        cpu.set_enable_on_release(enable_on_release);
        Ok(())
    }

    /// # Safety
    /// Scheduler lock held; never returns on success.
    unsafe fn retire_current(&self) -> Result<Infallible, SchedError> {
        self.check_switch()?;
        let state = unsafe { self.state() };
        let (current, outgoing) = state.current()?;
        outgoing.state = ThreadState::Exited;
        log::debug!("thread {} exited", outgoing.id);
        state
            .zombies
            .push_back(current)
            .map_err(|_| SchedError::Corrupted)?;

        let (_, to) = Self::activate_next(state, current)?;
        unsafe { self.platform.switch_final(to) }
    }

    /// Promote the head of the ready list to current.
    fn activate_next(
        state: &mut State<P::Context>,
        current: Slot,
    ) -> Result<(*mut P::Context, *const P::Context), SchedError> {
        let next = state.ready.pop_front().ok_or(SchedError::NoRunnableThread)?;

        let outgoing = state.threads[current].as_mut().ok_or(SchedError::Corrupted)?;
        let from_id = outgoing.id;
        let from = &raw mut outgoing.context;

        let incoming = state.threads[next].as_mut().ok_or(SchedError::Corrupted)?;
        incoming.state = ThreadState::Running;
        incoming.phase = ThreadPhase::Started;
        log::trace!("switch {from_id} -> {}", incoming.id);
        let to = &raw const incoming.context;

        state.current = Some(next);
        Ok((from, to))
    }
}
