use crate::{ThreadId, ThreadState};

/// Violated scheduler invariants and failed thread operations.
///
/// All of these are fatal for the kernel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SchedError {
    #[error("scheduler has not adopted the boot thread")]
    NotStarted,
    #[error("scheduler was already started")]
    AlreadyStarted,
    #[error("scheduler not locked")]
    NotLocked,
    #[error("spin lock count is {0}, expected 1")]
    LockDepth(usize),
    #[error("interrupts are enabled")]
    InterruptsEnabled,
    #[error("current thread {0} is still running")]
    StillRunning(ThreadId),
    #[error("thread {id} isn't running (state: {state:?})")]
    NotRunning { id: ThreadId, state: ThreadState },
    #[error("thread {id} isn't suspended (state: {state:?})")]
    NotSuspended { id: ThreadId, state: ThreadState },
    #[error("no thread is ready to run")]
    NoRunnableThread,
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("a thread cannot join itself")]
    JoinSelf,
    #[error("thread table is full")]
    TooManyThreads,
    #[error("no memory for a thread stack")]
    StackUnavailable,
    #[error("thread lists are corrupted")]
    Corrupted,
}
