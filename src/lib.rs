//! # Tern: a preemptive real-time kernel core
//!
//! Tern schedules tasks by fixed priority with preemption, and gives
//! them the synchronization primitives a small microcontroller system
//! needs: a recursive mutex with priority inheritance, counting and
//! binary semaphores, bounded message queues and software timers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │               Kernel API (kernel.rs)                    │
//! │   task_* · mutex_* · semaphore_* · queue_* · timer_*   │
//! ├─────────────┬─────────────┬──────────────┬─────────────┤
//! │  mutex.rs   │ semaphore.rs│   queue.rs   │  timer.rs   │
//! ├─────────────┴─────────────┴──────────────┴─────────────┤
//! │        Scheduler (scheduler.rs): ready buckets,         │
//! │     bitmap, delay/suspend/timeout lists, wait queues    │
//! ├────────────────────────────────────────────────────────┤
//! │   Task model (task.rs) · lists (list.rs) · time.rs      │
//! ├────────────────────────────────────────────────────────┤
//! │      Kernel lock (sync.rs, critical-section crate)      │
//! ├────────────────────────────────────────────────────────┤
//! │   Port trait (arch/): cortex_m4.rs · sim.rs (hosted)    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Priorities
//!
//! 32 levels, 31 most urgent. Level 0 is shared with the idle task and
//! level 31 is reserved for the timer service task, so applications use
//! `0..=30`. Equal-priority tasks share the CPU round robin, switching
//! on every tick and on every yield.
//!
//! ## Memory Model
//!
//! - Fixed pools for tasks, mutexes, semaphores, queues and timers
//!   (see [`config`])
//! - Task stacks and queue buffers come from the global allocator;
//!   failure is reported as [`Error::OutOfMemory`], never a panic
//! - All kernel state lives in one [`Kernel`] behind one critical section
//!
//! ## Logging
//!
//! The kernel logs through the `log` facade and never installs a logger.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod list;
pub mod mutex;
pub mod queue;
pub mod scheduler;
pub mod semaphore;
pub mod sync;
pub mod task;
pub mod time;
pub mod timer;

pub use error::{Error, ErrorCategory};
pub use kernel::Kernel;
pub use mutex::MutexId;
pub use queue::QueueId;
pub use semaphore::SemaphoreId;
pub use sync::SchedulerSuspendGuard;
pub use task::{TaskId, TaskName, TaskState};
pub use time::Tick;
pub use timer::{TimerId, TimerMode};
