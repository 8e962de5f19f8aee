use crate::{Stack, ThreadStart};
use kernel_sync::{Cpu, InterruptControl};

/// What the scheduler needs from the architecture.
///
/// # Lock hand-off
/// [`switch`](Self::switch) and [`switch_final`](Self::switch_final) are
/// entered with the scheduler lock held, at nesting depth one, and with
/// interrupts disabled. Ownership of that lock passes to the thread that is
/// resumed; it is released either after the resumed thread's own `switch`
/// returns, or by [`ThreadStart::release`] on a thread's first run.
pub trait Platform: Sync + Sized + 'static {
    /// Saved execution state of a thread that is not running.
    type Context: Send;
    type Interrupts: InterruptControl;

    fn cpu(&self) -> &Cpu<Self::Interrupts>;

    /// Context slot for the code that is already running at boot.
    fn bootstrap_context(&self) -> Self::Context;

    /// Prepare `stack` so that switching to the returned context runs
    /// `start`: release the scheduler lock, enable interrupts, call the entry
    /// function and exit when it returns.
    fn prime_new_stack(&'static self, stack: &Stack, start: ThreadStart) -> Self::Context;

    /// Save the running thread into `from` and resume `to`.
    ///
    /// Returns once some later switch resumes `from`.
    ///
    /// # Safety
    /// Both pointers refer to live contexts that stay in place until the
    /// switch back. The hand-off rules above hold.
    unsafe fn switch(&self, from: *mut Self::Context, to: *const Self::Context);

    /// Resume `to` and abandon the running thread for good.
    ///
    /// # Safety
    /// As for [`switch`](Self::switch); nothing may run on the abandoned
    /// stack afterwards.
    unsafe fn switch_final(&self, to: *const Self::Context) -> !;

    /// Stop the CPU.
    fn halt(&self) -> !;
}

/// Source of thread stacks.
///
/// Both calls run outside the scheduler lock. `cpu` is the scheduler's, for
/// implementations that need interrupts off while they work.
pub trait StackAllocator {
    /// A committed, writable stack of at least `size` bytes.
    fn allocate<I: InterruptControl>(&self, cpu: &Cpu<I>, size: u64) -> Option<Stack>;

    /// Return the stack of a reaped thread.
    fn release<I: InterruptControl>(&self, cpu: &Cpu<I>, stack: Stack);
}
