//! # Tern Configuration
//!
//! Compile-time constants governing the kernel. Object pools are sized
//! here; only task stacks and queue buffers come from the heap.

/// Number of priority levels. Priority 31 is the most urgent.
pub const PRIORITY_LEVELS: usize = 32;

/// Priority of the idle task. It is always ready, so the scheduler
/// never runs out of candidates.
pub const IDLE_TASK_PRIORITY: u8 = 0;

/// Priority of the software-timer service task. Reserved: application
/// tasks cannot be created at or moved to this level.
pub const TIMER_TASK_PRIORITY: u8 = 31;

/// Highest priority an application task may use.
pub const MAX_USER_PRIORITY: u8 = TIMER_TASK_PRIORITY - 1;

/// Maximum length of a task name in bytes.
pub const TASK_NAME_LEN: usize = 16;

/// Size of the task table, including the idle and timer service tasks.
pub const MAX_TASKS: usize = 16;

pub const MAX_MUTEXES: usize = 8;
pub const MAX_SEMAPHORES: usize = 8;
pub const MAX_QUEUES: usize = 8;
pub const MAX_TIMERS: usize = 8;

/// Stack size of the idle task in bytes.
pub const IDLE_TASK_STACK_SIZE: usize = 512;

/// Stack size of the timer service task in bytes. Timer handlers run on
/// this stack.
pub const TIMER_TASK_STACK_SIZE: usize = 1024;

/// Smallest stack a task may be created with, in bytes. Must hold the
/// canary plus the initial exception frame and the software-saved
/// context (16 words).
pub const MIN_STACK_SIZE: usize = 128;

/// Upper bound of a counting semaphore.
pub const SEMAPHORE_MAX_COUNT: u32 = 0xFFFE;

/// Upper bound of a binary semaphore.
pub const BINARY_SEMAPHORE_MAX_COUNT: u32 = 1;

/// Value of the tick counter at boot. Set close to `u32::MAX` to
/// exercise counter wraparound early.
pub const TICK_COUNT_INIT: u32 = 0;

/// SysTick frequency in Hz.
pub const TICK_HZ: u32 = 1000;

/// Core clock feeding SysTick (STM32F4 at 168 MHz).
pub const SYSTEM_CLOCK_HZ: u32 = 168_000_000;

/// Pattern every fresh stack is filled with.
pub const STACK_FILL_WORD: u32 = 0xA5A5_A5A5;

/// Number of words at the low end of each stack that must still hold
/// `STACK_FILL_WORD` when the task is switched out.
pub const STACK_CANARY_WORDS: usize = 4;

/// Number of sleep lists owned by the scheduler: one per mutex, one per
/// semaphore and a reader/writer pair per queue.
pub const WAIT_QUEUES: usize = MAX_MUTEXES + MAX_SEMAPHORES + 2 * MAX_QUEUES;
