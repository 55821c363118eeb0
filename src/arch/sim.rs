//! # Simulation Port
//!
//! A [`Port`] for hosted builds. Nothing is actually switched: the
//! thread driving the kernel plays whichever task the scheduler made
//! current, and switch requests are only recorded.
//!
//! When a task blocks and its wait is not resolved yet, the kernel asks
//! the port to let something else run. The simulation answers by
//! running the next activity queued with [`SimPort::expect_block`],
//! standing in for the rest of the system (other tasks, interrupts,
//! ticks) until the waiting task is current again. Running out of
//! activities is a test bug and panics.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use critical_section::Mutex;
use log::trace;

use super::{Port, TaskEntryFn};
use crate::task::TaskId;

type Activity = Box<dyn FnOnce() + Send + 'static>;

pub struct SimPort {
    interrupt_context: AtomicBool,
    tick_started: AtomicBool,
    first_stack_pointer: AtomicUsize,
    switches: Mutex<RefCell<Vec<(TaskId, TaskId)>>>,
    activities: Mutex<RefCell<VecDeque<Activity>>>,
}

impl SimPort {
    pub const fn new() -> Self {
        Self {
            interrupt_context: AtomicBool::new(false),
            tick_started: AtomicBool::new(false),
            first_stack_pointer: AtomicUsize::new(0),
            switches: Mutex::new(RefCell::new(Vec::new())),
            activities: Mutex::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Queue what happens the next time a task blocks.
    pub fn expect_block(&self, activity: impl FnOnce() + Send + 'static) {
        critical_section::with(|cs| {
            self.activities
                .borrow_ref_mut(cs)
                .push_back(Box::new(activity))
        });
    }

    pub fn pending_activities(&self) -> usize {
        critical_section::with(|cs| self.activities.borrow_ref(cs).len())
    }

    /// Pretend to be inside (or leave) an interrupt handler.
    pub fn set_interrupt_context(&self, value: bool) {
        self.interrupt_context.store(value, Ordering::SeqCst);
    }

    /// Drain the switch requests seen so far.
    pub fn take_switches(&self) -> Vec<(TaskId, TaskId)> {
        critical_section::with(|cs| core::mem::take(&mut *self.switches.borrow_ref_mut(cs)))
    }

    pub fn tick_started(&self) -> bool {
        self.tick_started.load(Ordering::SeqCst)
    }

    /// Stack pointer passed to `start_first_task`, 0 before start.
    pub fn first_stack_pointer(&self) -> usize {
        self.first_stack_pointer.load(Ordering::SeqCst)
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for SimPort {
    /// Leaves the entry point and argument where a real frame would put
    /// PC and R0 so tests can find them.
    fn prepare_stack(&self, stack: &mut [u32], entry: TaskEntryFn, arg: usize) -> usize {
        let top = stack.len();
        if top >= 2 {
            stack[top - 1] = entry as usize as u32;
            stack[top - 2] = arg as u32;
        }
        stack.as_ptr() as usize + (top.saturating_sub(2)) * core::mem::size_of::<u32>()
    }

    fn trigger_context_switch(&self, from: TaskId, to: TaskId) {
        trace!("sim: switch {} -> {}", from.index(), to.index());
        critical_section::with(|cs| self.switches.borrow_ref_mut(cs).push((from, to)));
    }

    fn start_first_task(&self, stack_pointer: usize) {
        self.first_stack_pointer.store(stack_pointer, Ordering::SeqCst);
    }

    fn is_interrupt_context(&self) -> bool {
        self.interrupt_context.load(Ordering::SeqCst)
    }

    fn system_tick_init(&self) {
        self.tick_started.store(true, Ordering::SeqCst);
    }

    fn wait_for_dispatch(&self, task: TaskId) {
        let activity = critical_section::with(|cs| self.activities.borrow_ref_mut(cs).pop_front());
        match activity {
            Some(activity) => {
                trace!("sim: task {} waits, running next activity", task.index());
                activity();
            }
            None => panic!("task {} blocked with no activity queued to wake it", task.index()),
        }
    }

    fn idle(&self) {
        core::hint::spin_loop();
    }
}
