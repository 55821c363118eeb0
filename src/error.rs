//! # Kernel Errors
//!
//! Every fallible kernel call returns `Result<T, Error>`. Conditions
//! that mean the kernel's own bookkeeping is corrupt (stack overflow,
//! a task found on the wrong list) are not errors: they panic and the
//! panic handler halts the core.

use core::fmt;

/// Broad class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The caller broke an API contract: bad handle, wrong context,
    /// wrong object state.
    Contract,
    /// A pool, the heap or a counter ran out.
    Exhaustion,
    /// A bounded wait did not complete.
    Timing,
}

/// Result codes of the kernel API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The handle does not name a slot of its pool.
    InvalidHandle,
    /// The handle names a free pool slot.
    NotCreated,
    /// The call needs a running task but the kernel has not started.
    NotStarted,
    /// `start` was called twice.
    AlreadyStarted,
    /// The call may block and was made from an interrupt handler.
    InterruptContext,
    /// The call may block and was made while the scheduler is suspended.
    SchedulerSuspended,
    PriorityOutOfRange,
    /// The task already has the requested priority.
    SamePriority,
    InvalidDelay,
    InvalidTimeout,
    InvalidStackSize,
    AlreadySuspended,
    /// The idle task and the timer service task cannot be suspended,
    /// resumed or reprioritized.
    SystemTask,
    /// The running task cannot be resumed; it is not suspended.
    ResumeCurrentTask,
    NotSuspended,
    MutexNotLocked,
    MutexNotOwner,
    /// Zero or overflowing element size or count.
    InvalidQueueParam,
    /// The payload or destination is larger than one queue element.
    DataTooBig,
    InvalidInterval,
    TimerAlreadyRunning,
    TimerNotRunning,
    /// Tasks are still asleep on the object.
    DestroyBlockedByWaiters,
    /// The mutex is still held.
    DestroyBlockedByOwner,
    DestroyBlockedByReaders,
    DestroyBlockedByWriters,
    /// The queue still holds unread elements.
    DestroyBlockedByData,
    /// The heap could not satisfy a stack or queue buffer allocation.
    OutOfMemory,
    TaskPoolExhausted,
    MutexPoolExhausted,
    SemaphorePoolExhausted,
    QueuePoolExhausted,
    TimerPoolExhausted,
    /// The semaphore is already at its maximum count.
    SemaphoreOverflow,
    /// A zero-timeout call could not complete immediately.
    TryFailed,
    /// The timeout expired before the resource became available.
    Timeout,
    /// The object was destroyed while the caller was waiting on it.
    Deleted,
    /// The waiter was suspended out of its wait.
    WaitAborted,
}

impl Error {
    pub fn category(self) -> ErrorCategory {
        use Error::*;
        match self {
            OutOfMemory | TaskPoolExhausted | MutexPoolExhausted | SemaphorePoolExhausted
            | QueuePoolExhausted | TimerPoolExhausted | SemaphoreOverflow => {
                ErrorCategory::Exhaustion
            }
            TryFailed | Timeout | Deleted | WaitAborted => ErrorCategory::Timing,
            _ => ErrorCategory::Contract,
        }
    }

    fn as_str(self) -> &'static str {
        use Error::*;
        match self {
            InvalidHandle => "invalid handle",
            NotCreated => "object not created",
            NotStarted => "kernel not started",
            AlreadyStarted => "kernel already started",
            InterruptContext => "blocking call from interrupt context",
            SchedulerSuspended => "blocking call while the scheduler is suspended",
            PriorityOutOfRange => "priority out of range",
            SamePriority => "task already has this priority",
            InvalidDelay => "invalid delay",
            InvalidTimeout => "invalid timeout",
            InvalidStackSize => "stack size too small",
            AlreadySuspended => "task already suspended",
            SystemTask => "operation not allowed on a kernel task",
            ResumeCurrentTask => "cannot resume the running task",
            NotSuspended => "task not suspended",
            MutexNotLocked => "mutex not locked",
            MutexNotOwner => "mutex held by another task",
            InvalidQueueParam => "invalid queue geometry",
            DataTooBig => "data larger than queue element",
            InvalidInterval => "invalid timer interval",
            TimerAlreadyRunning => "timer already running",
            TimerNotRunning => "timer not running",
            DestroyBlockedByWaiters => "destroy blocked: tasks waiting",
            DestroyBlockedByOwner => "destroy blocked: mutex held",
            DestroyBlockedByReaders => "destroy blocked: readers waiting",
            DestroyBlockedByWriters => "destroy blocked: writers waiting",
            DestroyBlockedByData => "destroy blocked: queue not empty",
            OutOfMemory => "out of memory",
            TaskPoolExhausted => "no free task slot",
            MutexPoolExhausted => "no free mutex slot",
            SemaphorePoolExhausted => "no free semaphore slot",
            QueuePoolExhausted => "no free queue slot",
            TimerPoolExhausted => "no free timer slot",
            SemaphoreOverflow => "semaphore count overflow",
            TryFailed => "try failed",
            Timeout => "timed out",
            Deleted => "object deleted while waiting",
            WaitAborted => "wait aborted",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
