//! # Architecture Abstraction Layer
//!
//! The kernel core never touches hardware. Everything it needs from the
//! CPU goes through [`Port`]: laying out a first stack frame, asking
//! for a context switch, starting the first task, telling task context
//! from interrupt context, and starting the tick.
//!
//! - [`cortex_m4`]: PendSV/SysTick port for ARMv7E-M targets.
//! - [`sim`]: hosted port that records switch requests instead of
//!   performing them, used to drive the kernel from tests.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(not(target_os = "none"))]
pub mod sim;

use crate::task::TaskId;

/// First function a task executes, with its single argument.
pub type TaskEntryFn = extern "C" fn(usize) -> !;

/// Hardware services the kernel core relies on.
pub trait Port: Sync {
    /// Write the initial register frame at the top of `stack` so that
    /// the first switch to it calls `entry(arg)`. Returns the stack
    /// pointer to save in the TCB. The lowest words of `stack` hold the
    /// canary and must be left alone.
    fn prepare_stack(&self, stack: &mut [u32], entry: TaskEntryFn, arg: usize) -> usize;

    /// Request a switch from `from` to `to`. Called with the kernel lock
    /// held; the switch itself happens once the lock is released.
    fn trigger_context_switch(&self, from: TaskId, to: TaskId);

    /// Run the first task from `stack_pointer`. Hardware ports do not
    /// return.
    fn start_first_task(&self, stack_pointer: usize);

    fn is_interrupt_context(&self) -> bool;

    /// Start the periodic tick that calls [`Kernel::tick`](crate::Kernel::tick).
    fn system_tick_init(&self);

    /// `task` blocked and its wait has not been resolved yet, so
    /// something else must run first. Ports that really switch never
    /// get here because the blocked task is not running.
    fn wait_for_dispatch(&self, task: TaskId);

    /// One iteration of the idle task.
    fn idle(&self);
}
