//! # Task Control Block
//!
//! One [`TaskControlBlock`] per task slot. The scheduler owns the table;
//! list links live next to it in parallel arrays so that a TCB never
//! points into another TCB.
//!
//! ## Task State Machine
//!
//! ```text
//!   ┌───────────┐   suspend    ┌───────┐   delay(ticks)   ┌─────────┐
//!   │ Suspended │ ◄─────────── │ Ready │ ───────────────► │ Delayed │
//!   │           │ ───────────► │       │ ◄─────────────── │         │
//!   └───────────┘   resume     └───────┘   wake_time hit  └─────────┘
//!                                │   ▲
//!        lock / wait / read /    │   │  granted, deleted
//!        write on a busy object  ▼   │  or timeout expired
//!                    ┌─────────────────────────────────┐
//!                    │ EndlessBlocked / TimeoutBlocked │
//!                    └─────────────────────────────────┘
//! ```
//!
//! Suspending a delayed or blocked task pulls it off its lists first
//! (through `Unknown`); a blocked task's wait then ends as aborted.
//!
//! `Unknown` is transient: a task is `Unknown` only between leaving one
//! list and joining the next, inside a single critical section.

use alloc::boxed::Box;
use alloc::vec::Vec;
use heapless::String;

use crate::config::{STACK_CANARY_WORDS, STACK_FILL_WORD, TASK_NAME_LEN};
use crate::error::Error;
use crate::scheduler::WaitQueueId;
use crate::time::{Tick, NO_WAKE};

/// Handle of a task: its index in the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// Fixed-capacity task name.
pub type TaskName = String<TASK_NAME_LEN>;

/// Scheduling state of a task. Always agrees with the list the task's
/// state link is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// In the ready bucket of its priority (includes the running task).
    Ready,
    /// On the delay list until `wake_time`.
    Delayed,
    /// On the suspend list.
    Suspended,
    /// On an IPC sleep list with no timeout.
    EndlessBlocked,
    /// On an IPC sleep list and on the timeout list until `wake_time`.
    TimeoutBlocked,
    /// On no list.
    Unknown,
}

impl TaskState {
    #[inline]
    pub fn is_blocked(self) -> bool {
        matches!(self, TaskState::EndlessBlocked | TaskState::TimeoutBlocked)
    }
}

/// How the last blocking wait of a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Still asleep.
    Pending,
    /// Woken by the primitive: the resource was handed over, or for a
    /// queue, the condition it waited for may have cleared.
    Granted,
    /// The timeout list woke it first.
    TimedOut,
    /// The primitive was destroyed under it.
    Deleted,
    /// It was suspended out of the wait.
    Aborted,
}

/// Closure a task runs. Boxed once more to get a thin pointer that fits
/// in the argument register of the first frame.
pub(crate) type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Per-task kernel state.
#[derive(Debug)]
pub struct TaskControlBlock {
    /// Slot holds a live task.
    pub(crate) active: bool,
    pub(crate) name: TaskName,
    /// Current (possibly inherited) priority.
    pub(crate) priority: u8,
    pub(crate) state: TaskState,
    /// Absolute expiry of a delay or timeout, `NO_WAKE` if none pending.
    pub(crate) wake_time: Tick,
    pub(crate) wait_outcome: WaitOutcome,
    /// Sleep list the task is on while blocked.
    pub(crate) blocked_on: Option<WaitQueueId>,
    /// Stack memory; index 0 is the lowest address.
    pub(crate) stack: Vec<u32>,
    /// Saved process stack pointer while switched out.
    pub(crate) stack_pointer: usize,
}

impl TaskControlBlock {
    pub const EMPTY: Self = Self {
        active: false,
        name: String::new(),
        priority: 0,
        state: TaskState::Unknown,
        wake_time: NO_WAKE,
        wait_outcome: WaitOutcome::Pending,
        blocked_on: None,
        stack: Vec::new(),
        stack_pointer: 0,
    };

    /// Bring a free slot to life. The caller links it into a state list.
    pub(crate) fn init(&mut self, name: &str, priority: u8, stack: Vec<u32>, stack_pointer: usize) {
        self.active = true;
        self.name = truncated_name(name);
        self.priority = priority;
        self.state = TaskState::Unknown;
        self.wake_time = NO_WAKE;
        self.wait_outcome = WaitOutcome::Pending;
        self.blocked_on = None;
        self.stack = stack;
        self.stack_pointer = stack_pointer;
    }

    /// The low end of the stack still holds the fill pattern.
    pub fn stack_intact(&self) -> bool {
        self.stack
            .iter()
            .take(STACK_CANARY_WORDS)
            .all(|&w| w == STACK_FILL_WORD)
    }
}

/// Longest prefix of `name` that fits, cut at a character boundary.
fn truncated_name(name: &str) -> TaskName {
    let mut end = name.len().min(TASK_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = TaskName::new();
    // Cannot fail: `end <= TASK_NAME_LEN`.
    let _ = out.push_str(&name[..end]);
    out
}

/// Allocate a stack of `size` bytes filled with `STACK_FILL_WORD`.
pub(crate) fn alloc_stack(size: usize) -> Result<Vec<u32>, Error> {
    let words = size / core::mem::size_of::<u32>();
    let mut stack = Vec::new();
    stack
        .try_reserve_exact(words)
        .map_err(|_| Error::OutOfMemory)?;
    stack.resize(words, STACK_FILL_WORD);
    Ok(stack)
}

/// Where every task starts. `arg` is a leaked `Box<TaskEntry>`.
pub(crate) extern "C" fn task_trampoline(arg: usize) -> ! {
    // SAFETY: `arg` was produced by `Box::into_raw` in `Kernel::spawn`
    // and is consumed exactly once, here, on the task's first dispatch.
    let entry = unsafe { Box::from_raw(arg as *mut TaskEntry) };
    (*entry)();
    panic!("task returned from its entry function");
}
