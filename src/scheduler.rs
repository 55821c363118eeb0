//! # Scheduler
//!
//! Fixed-priority preemptive scheduling with round robin among tasks of
//! equal priority.
//!
//! ## Data Structures
//!
//! - One FIFO ready bucket per priority, plus a 32-bit activity bitmap
//!   whose bit `p` is set exactly when bucket `p` is non-empty. The most
//!   urgent ready task is found with a single count-leading-zeros.
//! - A delay list and a timeout list, both kept sorted by `wake_time`
//!   so the tick handler only looks at a prefix.
//! - A suspend list.
//! - A table of IPC sleep lists ("wait queues"), one per mutex and
//!   semaphore and two per queue. A blocked task sits on one of these
//!   through its IPC link and, when its wait is bounded, on the timeout
//!   list through its state link at the same time.
//!
//! Every state transition checks the task's current state before it
//! touches a list, so a `state` field that disagrees with list
//! membership panics instead of corrupting the lists.
//!
//! ## Scheduling Decision
//!
//! [`Scheduler::schedule`] picks the head of the highest non-empty
//! bucket. If the running task left the ready state, or the candidate
//! is strictly more urgent, the candidate runs. On a tie the running
//! task yields to its bucket successor, so equal-priority tasks cycle in
//! arrival order. Whoever is picked moves to the tail of its bucket.
//!
//! The decision only updates bookkeeping. The switch itself is left as
//! a request that the kernel hands to the port once the critical
//! section is about to end.

use alloc::vec::Vec;
use log::{debug, trace};

use crate::config::{MAX_TASKS, PRIORITY_LEVELS, WAIT_QUEUES};
use crate::error::Error;
use crate::list::{Link, List};
use crate::task::{TaskControlBlock, TaskId, TaskState, WaitOutcome};
use crate::time::{after_eq, before, Tick, NO_WAKE};

// ---------------------------------------------------------------------------
// Wait queues
// ---------------------------------------------------------------------------

/// Index of an IPC sleep list in the scheduler's wait-queue table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitQueueId(usize);

impl WaitQueueId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }
}

/// Wake-up order of a sleep list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOrder {
    /// First blocked, first woken.
    Fifo,
    /// Most urgent first; arrival order among equals.
    Priority,
}

/// Result of the non-blocking half of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// Completed without waiting.
    Done,
    /// The caller is now asleep; collect the outcome once it runs again.
    Blocked(TaskId),
}

#[derive(Debug, Clone, Copy)]
struct WaitQueue {
    list: List,
    order: WaitOrder,
}

impl WaitQueue {
    const EMPTY: Self = Self {
        list: List::new(),
        order: WaitOrder::Fifo,
    };
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// Task table and every scheduling list.
///
/// Lives inside the kernel's critical-section mutex; nothing here locks
/// on its own.
pub struct Scheduler {
    pub(crate) tasks: [TaskControlBlock; MAX_TASKS],
    /// Ready bucket, delay, suspend or timeout list membership.
    state_links: [Link; MAX_TASKS],
    /// Wait-queue membership.
    ipc_links: [Link; MAX_TASKS],
    ready: [List; PRIORITY_LEVELS],
    delay: List,
    suspend: List,
    timeout: List,
    wait_queues: [WaitQueue; WAIT_QUEUES],
    /// Bit `p` set ⇔ `ready[p]` non-empty.
    bitmap: u32,
    suspend_nesting: u32,
    reschedule_pending: bool,
    /// The always-ready fallback task, once created.
    idle_task: Option<TaskId>,
    /// Task the scheduler decided should run.
    current: Option<TaskId>,
    /// Task whose context is loaded on the CPU. Lags `current` until
    /// the port performs the switch.
    dispatched: Option<TaskId>,
    tick: Tick,
    /// `(from, to)` of a switch decided but not yet handed to the port.
    switch_request: Option<(TaskId, TaskId)>,
    context_switches: u32,
}

impl Scheduler {
    pub const fn new(tick: Tick) -> Self {
        Self {
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS],
            state_links: [Link::UNLINKED; MAX_TASKS],
            ipc_links: [Link::UNLINKED; MAX_TASKS],
            ready: [List::new(); PRIORITY_LEVELS],
            delay: List::new(),
            suspend: List::new(),
            timeout: List::new(),
            wait_queues: [WaitQueue::EMPTY; WAIT_QUEUES],
            bitmap: 0,
            suspend_nesting: 0,
            reschedule_pending: false,
            idle_task: None,
            current: None,
            dispatched: None,
            tick,
            switch_request: None,
            context_switches: 0,
        }
    }

    // -- queries ------------------------------------------------------------

    /// Validated access to a task slot.
    pub fn task(&self, id: TaskId) -> Result<&TaskControlBlock, Error> {
        let tcb = self.tasks.get(id.index()).ok_or(Error::InvalidHandle)?;
        if tcb.active {
            Ok(tcb)
        } else {
            Err(Error::NotCreated)
        }
    }

    #[inline]
    fn tcb(&self, id: TaskId) -> &TaskControlBlock {
        &self.tasks[id.index()]
    }

    #[inline]
    fn tcb_mut(&mut self, id: TaskId) -> &mut TaskControlBlock {
        &mut self.tasks[id.index()]
    }

    #[inline]
    pub fn priority(&self, id: TaskId) -> u8 {
        self.tcb(id).priority
    }

    #[inline]
    pub fn state(&self, id: TaskId) -> TaskState {
        self.tcb(id).state
    }

    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// The running task, or `NotStarted` before the first dispatch.
    pub fn running(&self) -> Result<TaskId, Error> {
        self.current.ok_or(Error::NotStarted)
    }

    #[inline]
    pub fn now(&self) -> Tick {
        self.tick
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.current.is_some()
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspend_nesting > 0
    }

    #[inline]
    pub fn context_switches(&self) -> u32 {
        self.context_switches
    }

    #[inline]
    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    #[inline]
    pub fn idle_task(&self) -> Option<TaskId> {
        self.idle_task
    }

    pub(crate) fn set_idle_task(&mut self, id: TaskId) {
        self.idle_task = Some(id);
    }

    /// Number of unused task slots.
    pub fn free_slots(&self) -> usize {
        self.tasks.iter().filter(|t| !t.active).count()
    }

    pub fn has_waiters(&self, wq: WaitQueueId) -> bool {
        !self.wait_queues[wq.0].list.is_empty()
    }

    pub fn waiter_count(&self, wq: WaitQueueId) -> usize {
        self.wait_queues[wq.0].list.len()
    }

    /// Head of the highest non-empty ready bucket.
    pub fn highest_ready(&self) -> Option<TaskId> {
        if self.bitmap == 0 {
            return None;
        }
        let priority = 31 - self.bitmap.leading_zeros() as usize;
        self.ready[priority].front().map(TaskId::from_index)
    }

    /// Outcome of `me`'s last wait, once `me` is running again.
    pub fn take_wait_outcome(&self, me: TaskId) -> Option<WaitOutcome> {
        if self.current == Some(me) {
            Some(self.tcb(me).wait_outcome)
        } else {
            None
        }
    }

    // -- task registration --------------------------------------------------

    /// Claim a free task slot and link the new task into its ready bucket,
    /// or into the suspend list when `start_suspended` is set.
    pub(crate) fn register(
        &mut self,
        name: &str,
        priority: u8,
        stack: Vec<u32>,
        stack_pointer: usize,
        start_suspended: bool,
    ) -> Result<TaskId, Error> {
        let index = self
            .tasks
            .iter()
            .position(|t| !t.active)
            .ok_or(Error::TaskPoolExhausted)?;
        let id = TaskId::from_index(index);
        self.tasks[index].init(name, priority, stack, stack_pointer);

        if start_suspended {
            self.unknown_to_suspend(id);
        } else {
            self.insert_ready(id);
        }
        debug!("task {} `{}` created at priority {}", index, name, priority);
        Ok(id)
    }

    // -- ready buckets ------------------------------------------------------

    fn insert_ready(&mut self, id: TaskId) {
        let priority = self.priority(id) as usize;
        self.ready[priority].push_back(&mut self.state_links, id.index());
        self.bitmap |= 1 << priority;
        self.tcb_mut(id).state = TaskState::Ready;
    }

    fn remove_ready(&mut self, id: TaskId) {
        assert_eq!(self.state(id), TaskState::Ready, "task {} is not ready", id.index());
        let priority = self.priority(id) as usize;
        self.ready[priority].remove(&mut self.state_links, id.index());
        if self.ready[priority].is_empty() {
            self.bitmap &= !(1 << priority);
        }
        self.tcb_mut(id).state = TaskState::Unknown;
    }

    fn rotate_to_tail(&mut self, id: TaskId) {
        let priority = self.priority(id) as usize;
        self.ready[priority].rotate_to_back(&mut self.state_links, id.index());
    }

    // -- state transitions --------------------------------------------------

    pub fn ready_to_delay(&mut self, id: TaskId, ticks: Tick) {
        self.remove_ready(id);
        let wake = self.tick.wrapping_add(ticks);
        self.tcb_mut(id).wake_time = wake;
        let tasks = &self.tasks;
        self.delay
            .insert_by(&mut self.state_links, id.index(), |at| before(wake, tasks[at].wake_time));
        self.tcb_mut(id).state = TaskState::Delayed;
        trace!("task {} delayed until {}", id.index(), wake);
    }

    pub fn delay_to_ready(&mut self, id: TaskId) {
        assert_eq!(self.state(id), TaskState::Delayed, "task {} is not delayed", id.index());
        self.delay.remove(&mut self.state_links, id.index());
        self.tcb_mut(id).wake_time = NO_WAKE;
        self.insert_ready(id);
        trace!("task {} delay expired", id.index());
    }

    pub fn ready_to_suspend(&mut self, id: TaskId) {
        self.remove_ready(id);
        self.unknown_to_suspend(id);
    }

    pub fn unknown_to_suspend(&mut self, id: TaskId) {
        assert_eq!(self.state(id), TaskState::Unknown, "task {} is still on a list", id.index());
        self.suspend.push_back(&mut self.state_links, id.index());
        self.tcb_mut(id).state = TaskState::Suspended;
        trace!("task {} suspended", id.index());
    }

    pub fn suspend_to_ready(&mut self, id: TaskId) {
        assert_eq!(self.state(id), TaskState::Suspended, "task {} is not suspended", id.index());
        self.suspend.remove(&mut self.state_links, id.index());
        self.insert_ready(id);
        trace!("task {} resumed", id.index());
    }

    /// Pull a delayed or blocked task off all its lists. A pending wait
    /// ends as `Aborted`.
    pub fn detach(&mut self, id: TaskId) {
        match self.state(id) {
            TaskState::Delayed => {
                self.delay.remove(&mut self.state_links, id.index());
            }
            TaskState::EndlessBlocked | TaskState::TimeoutBlocked => {
                self.unlink_waiter(id);
                self.tcb_mut(id).wait_outcome = WaitOutcome::Aborted;
            }
            state => panic!("task {} cannot be detached from {:?}", id.index(), state),
        }
        let tcb = self.tcb_mut(id);
        tcb.wake_time = NO_WAKE;
        tcb.state = TaskState::Unknown;
    }

    /// Move the ready task `id` onto the sleep list `wq`. With a timeout
    /// it also joins the timeout list.
    pub fn ready_to_block(
        &mut self,
        id: TaskId,
        wq: WaitQueueId,
        order: WaitOrder,
        timeout: Option<Tick>,
    ) {
        self.remove_ready(id);

        let priority = self.priority(id);
        let tasks = &self.tasks;
        let queue = &mut self.wait_queues[wq.0];
        queue.order = order;
        match order {
            WaitOrder::Fifo => queue.list.push_back(&mut self.ipc_links, id.index()),
            WaitOrder::Priority => queue
                .list
                .insert_by(&mut self.ipc_links, id.index(), |at| priority > tasks[at].priority),
        }

        let state = match timeout {
            Some(ticks) => {
                let wake = self.tick.wrapping_add(ticks);
                self.tcb_mut(id).wake_time = wake;
                let tasks = &self.tasks;
                self.timeout
                    .insert_by(&mut self.state_links, id.index(), |at| before(wake, tasks[at].wake_time));
                TaskState::TimeoutBlocked
            }
            None => TaskState::EndlessBlocked,
        };

        let tcb = self.tcb_mut(id);
        tcb.state = state;
        tcb.blocked_on = Some(wq);
        tcb.wait_outcome = WaitOutcome::Pending;
        trace!("task {} blocked on wait queue {} ({:?})", id.index(), wq.0, state);
    }

    /// Take a blocked task off its sleep list (and the timeout list) and
    /// make it ready with `outcome`.
    pub fn block_to_ready(&mut self, id: TaskId, outcome: WaitOutcome) {
        assert!(self.state(id).is_blocked(), "task {} is not blocked", id.index());
        self.unlink_waiter(id);
        let tcb = self.tcb_mut(id);
        tcb.wake_time = NO_WAKE;
        tcb.wait_outcome = outcome;
        tcb.state = TaskState::Unknown;
        self.insert_ready(id);
        trace!("task {} unblocked: {:?}", id.index(), outcome);
    }

    fn unlink_waiter(&mut self, id: TaskId) {
        if self.state(id) == TaskState::TimeoutBlocked {
            self.timeout.remove(&mut self.state_links, id.index());
        }
        let Some(wq) = self.tcb_mut(id).blocked_on.take() else {
            panic!("blocked task {} has no wait queue", id.index());
        };
        self.wait_queues[wq.0].list.remove(&mut self.ipc_links, id.index());
    }

    /// Wake the head of `wq`, if any.
    pub fn wake_first(&mut self, wq: WaitQueueId, outcome: WaitOutcome) -> Option<TaskId> {
        let id = TaskId::from_index(self.wait_queues[wq.0].list.front()?);
        self.block_to_ready(id, outcome);
        Some(id)
    }

    /// Wake every task on `wq`. Returns how many were woken.
    pub fn wake_all(&mut self, wq: WaitQueueId, outcome: WaitOutcome) -> usize {
        let mut woken = 0;
        while self.wake_first(wq, outcome).is_some() {
            woken += 1;
        }
        woken
    }

    /// Set a task's priority, keeping bucket membership and
    /// priority-ordered sleep lists consistent.
    pub fn change_priority(&mut self, id: TaskId, priority: u8) {
        assert!((priority as usize) < PRIORITY_LEVELS);
        match self.state(id) {
            TaskState::Ready => {
                self.remove_ready(id);
                self.tcb_mut(id).priority = priority;
                self.insert_ready(id);
            }
            TaskState::EndlessBlocked | TaskState::TimeoutBlocked => {
                self.tcb_mut(id).priority = priority;
                if let Some(wq) = self.tcb(id).blocked_on {
                    let tasks = &self.tasks;
                    let queue = &mut self.wait_queues[wq.0];
                    if queue.order == WaitOrder::Priority {
                        queue.list.remove(&mut self.ipc_links, id.index());
                        queue
                            .list
                            .insert_by(&mut self.ipc_links, id.index(), |at| priority > tasks[at].priority);
                    }
                }
            }
            _ => self.tcb_mut(id).priority = priority,
        }
        trace!("task {} priority -> {}", id.index(), priority);
    }

    // -- scheduling ---------------------------------------------------------

    /// Decide which task runs next. Deferred while scheduling is
    /// suspended; a no-op before the kernel starts.
    pub fn schedule(&mut self) {
        if self.suspend_nesting > 0 {
            self.reschedule_pending = true;
            return;
        }
        let Some(running) = self.current else {
            return;
        };
        let Some(next) = self.highest_ready() else {
            panic!("no ready task to schedule");
        };

        let target = if self.state(running) != TaskState::Ready
            || self.priority(next) > self.priority(running)
        {
            self.rotate_to_tail(next);
            next
        } else if next == running {
            let bucket = &self.ready[self.priority(running) as usize];
            if bucket.len() == 1 {
                return;
            }
            let Some(successor) = bucket.next(&self.state_links, running.index()) else {
                panic!("running task {} is not at the head of its bucket", running.index());
            };
            let successor = TaskId::from_index(successor);
            self.rotate_to_tail(running);
            self.rotate_to_tail(successor);
            successor
        } else if self.priority(next) == self.priority(running) {
            self.rotate_to_tail(next);
            next
        } else {
            return;
        };

        self.switch_to(running, target);
    }

    /// Schedule only if a ready task outranks the running one. Used after
    /// a task became ready or changed priority, where a tie must not
    /// trigger round robin.
    pub fn preempt_if_outranked(&mut self) {
        let (Some(running), Some(next)) = (self.current, self.highest_ready()) else {
            return;
        };
        if self.state(running) != TaskState::Ready || self.priority(next) > self.priority(running) {
            self.schedule();
        }
    }

    fn switch_to(&mut self, from: TaskId, to: TaskId) {
        if from == to {
            return;
        }
        #[cfg(feature = "stack-check")]
        {
            let tcb = self.tcb(from);
            assert!(tcb.stack_intact(), "stack overflow in task `{}`", tcb.name);
        }
        self.switch_request = match self.switch_request {
            Some((first, _)) => Some((first, to)),
            None => Some((from, to)),
        };
        self.current = Some(to);
        self.context_switches = self.context_switches.wrapping_add(1);
        trace!("switch {} -> {}", from.index(), to.index());
    }

    /// Switch decided since the last call, if it still changes tasks.
    pub fn take_switch_request(&mut self) -> Option<(TaskId, TaskId)> {
        self.switch_request.take().filter(|(from, to)| from != to)
    }

    pub fn suspend_scheduling(&mut self) {
        self.suspend_nesting += 1;
    }

    /// Undo one `suspend_scheduling`. The outermost call runs the
    /// schedule that was deferred meanwhile, if any.
    pub fn resume_scheduling(&mut self) {
        assert!(self.suspend_nesting > 0, "scheduler resumed more often than suspended");
        self.suspend_nesting -= 1;
        if self.suspend_nesting == 0 && self.reschedule_pending {
            self.reschedule_pending = false;
            self.schedule();
        }
    }

    // -- time ---------------------------------------------------------------

    /// Advance the tick counter and wake every delay or timeout that
    /// expired. Does not schedule.
    pub fn advance_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let now = self.tick;

        while let Some(head) = self.delay.front() {
            let id = TaskId::from_index(head);
            if !after_eq(now, self.tcb(id).wake_time) {
                break;
            }
            self.delay_to_ready(id);
        }

        while let Some(head) = self.timeout.front() {
            let id = TaskId::from_index(head);
            if !after_eq(now, self.tcb(id).wake_time) {
                break;
            }
            self.block_to_ready(id, WaitOutcome::TimedOut);
            debug!("task {} timed out", id.index());
        }
    }

    // -- dispatch -----------------------------------------------------------

    /// Pick the first task to run. Returns its stack pointer.
    pub fn start(&mut self) -> usize {
        let Some(first) = self.highest_ready() else {
            panic!("no ready task to start");
        };
        self.current = Some(first);
        self.dispatched = Some(first);
        debug!("starting task {} `{}`", first.index(), self.tcb(first).name);
        self.tcb(first).stack_pointer
    }

    /// Save the outgoing context and load the one `schedule` picked.
    pub fn switch_context(&mut self, saved_sp: usize) -> usize {
        if let Some(out) = self.dispatched {
            self.tcb_mut(out).stack_pointer = saved_sp;
        }
        let Some(next) = self.current else {
            panic!("context switch before start");
        };
        self.dispatched = Some(next);
        self.tcb(next).stack_pointer
    }
}
