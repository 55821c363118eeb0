//! # Kernel
//!
//! [`Kernel`] is the single context object of the system. It owns the
//! scheduler and the object pools behind one critical section and
//! exposes the public API. A board creates exactly one, in a `static`,
//! and hands out `&'static` references to it.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel_init()            ← exception priorities
//!         ├─► KERNEL.task_create() ×N  ← application tasks
//!         ├─► KERNEL.*_create()        ← mutexes, semaphores, queues, timers
//!         └─► kernel_start()           ← never returns
//!               ├─► idle task (priority 0) and timer service task (31)
//!               ├─► pick the most urgent ready task
//!               ├─► start SysTick
//!               └─► Port::start_first_task()
//! ```
//!
//! ## Blocking Calls
//!
//! A blocking call runs in two halves. The first half, under the lock,
//! either completes or puts the caller to sleep and schedules someone
//! else. The switch happens as the lock is released. When the caller
//! runs again the second half reads how the wait ended from its TCB:
//! granted, timed out, deleted or aborted.

use alloc::boxed::Box;
use log::{debug, info, warn};

use crate::arch::Port;
use crate::config::{
    BINARY_SEMAPHORE_MAX_COUNT, IDLE_TASK_PRIORITY, IDLE_TASK_STACK_SIZE, MAX_USER_PRIORITY,
    MIN_STACK_SIZE, SEMAPHORE_MAX_COUNT, TICK_COUNT_INIT, TIMER_TASK_PRIORITY,
    TIMER_TASK_STACK_SIZE,
};
use crate::error::Error;
use crate::mutex::{MutexId, MutexPool};
use crate::queue::{self, QueueId, QueuePool};
use crate::scheduler::{Acquire, Scheduler};
use crate::semaphore::{SemaphoreId, SemaphorePool};
use crate::sync::{KernelLock, SchedulerSuspendGuard};
use crate::task::{self, TaskEntry, TaskId, TaskName, TaskState, WaitOutcome};
use crate::time::{Tick, Wait, MAX_DELAY};
use crate::timer::{TimerId, TimerMode, TimerPool};

/// Everything the critical section protects.
pub(crate) struct KernelState {
    pub(crate) sched: Scheduler,
    pub(crate) mutexes: MutexPool,
    pub(crate) semaphores: SemaphorePool,
    pub(crate) queues: QueuePool,
    pub(crate) timers: TimerPool,
}

impl KernelState {
    const fn new() -> Self {
        Self {
            sched: Scheduler::new(TICK_COUNT_INIT),
            mutexes: MutexPool::new(),
            semaphores: SemaphorePool::new(),
            queues: QueuePool::new(),
            timers: TimerPool::new(),
        }
    }

    /// Blocking calls are refused while the scheduler is suspended.
    fn check_schedulable(&self) -> Result<(), Error> {
        if self.sched.is_suspended() {
            warn!("blocking call with the scheduler suspended");
            return Err(Error::SchedulerSuspended);
        }
        Ok(())
    }

    /// Task operations may not target the idle or timer service task.
    fn check_user_task(&self, id: TaskId) -> Result<(), Error> {
        if self.sched.idle_task() == Some(id) || self.timers.service_task() == Some(id) {
            warn!("task {} belongs to the kernel", id.index());
            return Err(Error::SystemTask);
        }
        Ok(())
    }
}

/// The kernel instance, generic over the hardware port.
pub struct Kernel<P: Port> {
    port: P,
    state: KernelLock<KernelState>,
}

impl<P: Port> Kernel<P> {
    /// An unstarted kernel with empty pools, driving `port`.
    pub const fn new(port: P) -> Self {
        Self {
            port,
            state: KernelLock::new(KernelState::new()),
        }
    }

    /// The hardware port this kernel was built with.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Enter the critical section. A context switch decided inside is
    /// handed to the port before the section ends.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        self.state.with(|s| {
            let result = f(s);
            if let Some((from, to)) = s.sched.take_switch_request() {
                self.port.trigger_context_switch(from, to);
            }
            result
        })
    }

    fn check_task_context(&self) -> Result<(), Error> {
        if self.port.is_interrupt_context() {
            warn!("blocking call from interrupt context");
            return Err(Error::InterruptContext);
        }
        Ok(())
    }

    /// Second half of a blocking call: wait until `me` runs again and
    /// report how its wait ended.
    fn wait_until_running(&self, me: TaskId) -> WaitOutcome {
        loop {
            if let Some(outcome) = self.with_state(|s| s.sched.take_wait_outcome(me)) {
                return outcome;
            }
            self.port.wait_for_dispatch(me);
        }
    }

    fn finish_wait(&self, acquired: Acquire) -> Result<(), Error> {
        let Acquire::Blocked(me) = acquired else {
            return Ok(());
        };
        match self.wait_until_running(me) {
            WaitOutcome::Granted => Ok(()),
            outcome => wait_error(me, outcome),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle and hardware hooks
    // -----------------------------------------------------------------------

    /// Create the idle and timer service tasks, start the tick and run
    /// the most urgent ready task. Does not return on hardware.
    ///
    /// Fails with [`Error::TaskPoolExhausted`] before creating anything
    /// when the task table cannot hold both kernel tasks. A kernel task
    /// that a failed call did create is reused by the next call.
    pub fn start(&'static self) -> Result<(), Error> {
        self.with_state(|s| {
            if s.sched.is_started() {
                return Err(Error::AlreadyStarted);
            }
            let missing = usize::from(s.sched.idle_task().is_none())
                + usize::from(s.timers.service_task().is_none());
            if s.sched.free_slots() < missing {
                return Err(Error::TaskPoolExhausted);
            }
            Ok(())
        })?;

        if self.with_state(|s| s.sched.idle_task()).is_none() {
            let idle = self.spawn(
                "idle",
                IDLE_TASK_PRIORITY,
                IDLE_TASK_STACK_SIZE,
                false,
                move || loop {
                    self.port.idle();
                },
            )?;
            self.with_state(|s| s.sched.set_idle_task(idle));
        }
        if self.with_state(|s| s.timers.service_task()).is_none() {
            let service = self.spawn(
                "timer",
                TIMER_TASK_PRIORITY,
                TIMER_TASK_STACK_SIZE,
                true,
                move || loop {
                    self.run_timer_service();
                },
            )?;
            self.with_state(|s| s.timers.set_service_task(service));
        }

        let stack_pointer = self.with_state(|s| s.sched.start());
        info!("kernel started");
        self.port.system_tick_init();
        self.port.start_first_task(stack_pointer);
        Ok(())
    }

    /// Tick interrupt body. Ignored while the scheduler is suspended.
    pub fn tick(&self) {
        self.with_state(|s| {
            if s.sched.is_suspended() {
                return;
            }
            s.sched.advance_tick();
            s.timers.check(&mut s.sched);
            s.sched.schedule();
        });
    }

    /// Context-switch body: save `saved_sp` as the outgoing task's stack
    /// pointer and return the incoming task's.
    pub fn switch_context(&self, saved_sp: usize) -> usize {
        self.state.with(|s| s.sched.switch_context(saved_sp))
    }

    /// One pass of the timer service task: run every expired handler,
    /// then suspend until the next expiry.
    pub fn run_timer_service(&self) {
        loop {
            let expired = self.with_state(|s| {
                let now = s.sched.now();
                s.timers.expire_next(now)
            });
            let Some(mut expired) = expired else {
                break;
            };
            if let Some(handler) = expired.handler.as_mut() {
                handler();
            }
            self.with_state(|s| s.timers.restore(expired));
        }
        self.with_state(|s| s.timers.finish_service(&mut s.sched));
    }

    // -----------------------------------------------------------------------
    // Scheduler control and queries
    // -----------------------------------------------------------------------

    /// Suspend scheduling until the returned guard (and every other live
    /// guard) is dropped.
    pub fn suspend_scheduler(&self) -> SchedulerSuspendGuard<'_, P> {
        SchedulerSuspendGuard::new(self)
    }

    /// Whether any [`SchedulerSuspendGuard`] is alive.
    pub fn is_scheduler_suspended(&self) -> bool {
        self.with_state(|s| s.sched.is_suspended())
    }

    /// The running task, `None` before [`start`](Self::start).
    pub fn current_task(&self) -> Option<TaskId> {
        self.with_state(|s| s.sched.current())
    }

    /// Ticks elapsed since boot, wrapping at `u32::MAX`.
    pub fn current_time(&self) -> Tick {
        self.with_state(|s| s.sched.now())
    }

    /// Number of context switches decided since boot.
    pub fn context_switches(&self) -> u32 {
        self.with_state(|s| s.sched.context_switches())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Create a task running `entry`. Priorities `0..=30` are available;
    /// 31 belongs to the timer service task. The task is ready at once
    /// and preempts the caller if it is more urgent. `name` is cut to
    /// [`TASK_NAME_LEN`](crate::config::TASK_NAME_LEN) bytes.
    pub fn task_create<F>(
        &self,
        name: &str,
        priority: u8,
        stack_size: usize,
        entry: F,
    ) -> Result<TaskId, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if priority > MAX_USER_PRIORITY {
            return Err(Error::PriorityOutOfRange);
        }
        self.spawn(name, priority, stack_size, false, entry)
    }

    fn spawn<F>(
        &self,
        name: &str,
        priority: u8,
        stack_size: usize,
        start_suspended: bool,
        entry: F,
    ) -> Result<TaskId, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidStackSize);
        }
        let mut stack = task::alloc_stack(stack_size)?;
        let entry: Box<TaskEntry> = Box::new(Box::new(entry));
        let arg = Box::into_raw(entry) as usize;
        let stack_pointer = self.port.prepare_stack(&mut stack, task::task_trampoline, arg);

        let result = self.with_state(|s| {
            let id = s
                .sched
                .register(name, priority, stack, stack_pointer, start_suspended)?;
            s.sched.preempt_if_outranked();
            Ok(id)
        });
        if result.is_err() {
            // SAFETY: `arg` came from `Box::into_raw` above and no task
            // exists that could consume it.
            drop(unsafe { Box::from_raw(arg as *mut TaskEntry) });
        }
        result
    }

    /// Put the running task to sleep for `ticks` ticks, `1..MAX_DELAY`.
    /// Not callable from interrupts or with the scheduler suspended.
    pub fn task_delay(&self, ticks: Tick) -> Result<(), Error> {
        self.check_task_context()?;
        let me = self.with_state(|s| {
            s.check_schedulable()?;
            if ticks == 0 || ticks >= MAX_DELAY {
                return Err(Error::InvalidDelay);
            }
            let me = s.sched.running()?;
            s.sched.ready_to_delay(me, ticks);
            s.sched.schedule();
            Ok(me)
        })?;
        self.wait_until_running(me);
        Ok(())
    }

    /// Give up the CPU to the next ready task of the same priority.
    pub fn task_yield(&self) -> Result<(), Error> {
        self.check_task_context()?;
        self.with_state(|s| {
            s.check_schedulable()?;
            s.sched.running()?;
            s.sched.schedule();
            Ok(())
        })
    }

    /// Suspend `id`. A delayed task loses the rest of its delay; a blocked
    /// task's wait ends with [`Error::WaitAborted`] once it is resumed.
    /// Suspending the running task returns once another task resumes it.
    pub fn task_suspend(&self, id: TaskId) -> Result<(), Error> {
        let in_interrupt = self.port.is_interrupt_context();
        let suspended_self = self.with_state(|s| {
            s.sched.task(id)?;
            s.check_user_task(id)?;
            let is_running = s.sched.current() == Some(id);
            if is_running {
                if in_interrupt {
                    return Err(Error::InterruptContext);
                }
                s.check_schedulable()?;
            }
            match s.sched.state(id) {
                TaskState::Suspended => return Err(Error::AlreadySuspended),
                TaskState::Ready => s.sched.ready_to_suspend(id),
                _ => {
                    s.sched.detach(id);
                    s.sched.unknown_to_suspend(id);
                }
            }
            debug!("task {} suspended", id.index());
            if is_running {
                s.sched.schedule();
            }
            Ok(is_running)
        })?;
        if suspended_self {
            self.wait_until_running(id);
        }
        Ok(())
    }

    /// Make a suspended task ready again. It preempts the caller if it
    /// is more urgent.
    pub fn task_resume(&self, id: TaskId) -> Result<(), Error> {
        self.with_state(|s| {
            s.sched.task(id)?;
            s.check_user_task(id)?;
            if s.sched.current() == Some(id) {
                return Err(Error::ResumeCurrentTask);
            }
            if s.sched.state(id) != TaskState::Suspended {
                return Err(Error::NotSuspended);
            }
            s.sched.suspend_to_ready(id);
            debug!("task {} resumed", id.index());
            s.sched.preempt_if_outranked();
            Ok(())
        })
    }

    /// Current priority of `id`, including any inherited boost.
    pub fn task_priority_get(&self, id: TaskId) -> Result<u8, Error> {
        self.with_state(|s| Ok(s.sched.task(id)?.priority))
    }

    /// Move `id` to `priority` and reschedule if that changes who should
    /// run. A task blocked on a mutex or queue keeps its place in line
    /// by priority.
    pub fn task_priority_set(&self, id: TaskId, priority: u8) -> Result<(), Error> {
        if priority > MAX_USER_PRIORITY {
            return Err(Error::PriorityOutOfRange);
        }
        self.with_state(|s| {
            s.check_user_task(id)?;
            if s.sched.task(id)?.priority == priority {
                return Err(Error::SamePriority);
            }
            s.sched.change_priority(id, priority);
            s.sched.preempt_if_outranked();
            Ok(())
        })
    }

    /// Scheduling state of `id`.
    pub fn task_state(&self, id: TaskId) -> Result<TaskState, Error> {
        self.with_state(|s| Ok(s.sched.task(id)?.state))
    }

    /// Name `id` was created with, possibly truncated.
    pub fn task_name(&self, id: TaskId) -> Result<TaskName, Error> {
        self.with_state(|s| Ok(s.sched.task(id)?.name.clone()))
    }

    // -----------------------------------------------------------------------
    // Mutexes
    // -----------------------------------------------------------------------

    /// Create an unlocked mutex.
    pub fn mutex_create(&self) -> Result<MutexId, Error> {
        self.with_state(|s| s.mutexes.create())
    }

    /// Lock `id`, waiting as long as it takes. The owner may lock again;
    /// each lock needs its own unlock. While a more urgent task waits,
    /// the owner runs at that task's priority.
    pub fn mutex_lock(&self, id: MutexId) -> Result<(), Error> {
        self.mutex_pend(id, Wait::Forever)
    }

    /// Lock `id`, waiting at most `timeout` ticks. Zero means try once.
    pub fn mutex_lock_timeout(&self, id: MutexId, timeout: Tick) -> Result<(), Error> {
        self.mutex_pend(id, Wait::from_timeout(timeout)?)
    }

    /// Lock `id` only if that needs no wait, else [`Error::TryFailed`].
    pub fn mutex_try_lock(&self, id: MutexId) -> Result<(), Error> {
        self.mutex_pend(id, Wait::NoWait)
    }

    fn mutex_pend(&self, id: MutexId, wait: Wait) -> Result<(), Error> {
        self.check_task_context()?;
        let acquired = self.with_state(|s| {
            s.check_schedulable()?;
            s.mutexes.lock(&mut s.sched, id, wait)
        })?;
        self.finish_wait(acquired)
    }

    /// Release one level of `id`. The last release restores the owner's
    /// priority and hands the mutex to the most urgent waiter.
    pub fn mutex_unlock(&self, id: MutexId) -> Result<(), Error> {
        self.check_task_context()?;
        self.with_state(|s| {
            s.check_schedulable()?;
            s.mutexes.unlock(&mut s.sched, id)
        })
    }

    /// Task holding `id`, if any.
    pub fn mutex_owner(&self, id: MutexId) -> Result<Option<TaskId>, Error> {
        self.with_state(|s| s.mutexes.owner(id))
    }

    /// Free `id`. Refused while it is held or has waiters.
    pub fn mutex_destroy(&self, id: MutexId) -> Result<(), Error> {
        self.with_state(|s| s.mutexes.destroy(&s.sched, id))
    }

    // -----------------------------------------------------------------------
    // Semaphores
    // -----------------------------------------------------------------------

    /// Create a counting semaphore holding `initial` units, capped at
    /// [`SEMAPHORE_MAX_COUNT`].
    pub fn semaphore_create(&self, initial: u32) -> Result<SemaphoreId, Error> {
        self.with_state(|s| s.semaphores.create(initial, SEMAPHORE_MAX_COUNT))
    }

    /// Create a semaphore capped at one unit.
    pub fn semaphore_create_binary(&self, initial: u32) -> Result<SemaphoreId, Error> {
        self.with_state(|s| s.semaphores.create(initial, BINARY_SEMAPHORE_MAX_COUNT))
    }

    /// Take one unit, waiting as long as it takes. Waiters are served in
    /// arrival order.
    pub fn semaphore_wait(&self, id: SemaphoreId) -> Result<(), Error> {
        self.semaphore_pend(id, Wait::Forever)
    }

    /// Take one unit, waiting at most `timeout` ticks. Zero means try once.
    pub fn semaphore_wait_timeout(&self, id: SemaphoreId, timeout: Tick) -> Result<(), Error> {
        self.semaphore_pend(id, Wait::from_timeout(timeout)?)
    }

    /// Take one unit only if one is available, else [`Error::TryFailed`].
    pub fn semaphore_try_wait(&self, id: SemaphoreId) -> Result<(), Error> {
        self.semaphore_pend(id, Wait::NoWait)
    }

    fn semaphore_pend(&self, id: SemaphoreId, wait: Wait) -> Result<(), Error> {
        self.check_task_context()?;
        let acquired = self.with_state(|s| {
            s.check_schedulable()?;
            s.semaphores.wait(&mut s.sched, id, wait)
        })?;
        self.finish_wait(acquired)
    }

    /// Release one unit. Legal from interrupt handlers.
    pub fn semaphore_post(&self, id: SemaphoreId) -> Result<(), Error> {
        self.with_state(|s| s.semaphores.post(&mut s.sched, id))
    }

    /// Units currently available.
    pub fn semaphore_count(&self, id: SemaphoreId) -> Result<u32, Error> {
        self.with_state(|s| s.semaphores.count(id))
    }

    /// Free `id`. Its waiters wake with [`Error::Deleted`].
    pub fn semaphore_destroy(&self, id: SemaphoreId) -> Result<(), Error> {
        self.with_state(|s| s.semaphores.destroy(&mut s.sched, id))
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    /// Create a queue of `element_count` slots of `element_size` bytes.
    /// The buffer comes from the heap.
    pub fn queue_create(&self, element_size: usize, element_count: usize) -> Result<QueueId, Error> {
        let buffer = queue::alloc_buffer(element_size, element_count)?;
        self.with_state(|s| s.queues.create(element_size, element_count, buffer))
    }

    /// Append `data` (at most one element, zero-padded), waiting for
    /// space as long as it takes.
    pub fn queue_write(&self, id: QueueId, data: &[u8]) -> Result<(), Error> {
        self.queue_send(id, data, Wait::Forever)
    }

    /// Append `data`, waiting at most `timeout` ticks for space.
    pub fn queue_write_timeout(&self, id: QueueId, data: &[u8], timeout: Tick) -> Result<(), Error> {
        self.queue_send(id, data, Wait::from_timeout(timeout)?)
    }

    /// Write without blocking. Legal from interrupt handlers.
    pub fn queue_try_write(&self, id: QueueId, data: &[u8]) -> Result<(), Error> {
        self.queue_send(id, data, Wait::NoWait)
    }

    fn queue_send(&self, id: QueueId, data: &[u8], wait: Wait) -> Result<(), Error> {
        let in_interrupt = self.port.is_interrupt_context();
        loop {
            let acquired =
                self.with_state(|s| s.queues.write(&mut s.sched, id, data, wait, in_interrupt))?;
            let Acquire::Blocked(me) = acquired else {
                return Ok(());
            };
            match self.wait_until_running(me) {
                WaitOutcome::Granted => continue,
                outcome => return wait_error(me, outcome),
            }
        }
    }

    /// Take the oldest element into `buf`, waiting for data as long as
    /// it takes. Only `buf.len()` bytes are copied.
    pub fn queue_read(&self, id: QueueId, buf: &mut [u8]) -> Result<(), Error> {
        self.queue_receive(id, buf, Wait::Forever)
    }

    /// Take the oldest element, waiting at most `timeout` ticks for data.
    pub fn queue_read_timeout(&self, id: QueueId, buf: &mut [u8], timeout: Tick) -> Result<(), Error> {
        self.queue_receive(id, buf, Wait::from_timeout(timeout)?)
    }

    /// Read without blocking. Legal from interrupt handlers.
    pub fn queue_try_read(&self, id: QueueId, buf: &mut [u8]) -> Result<(), Error> {
        self.queue_receive(id, buf, Wait::NoWait)
    }

    fn queue_receive(&self, id: QueueId, buf: &mut [u8], wait: Wait) -> Result<(), Error> {
        let in_interrupt = self.port.is_interrupt_context();
        loop {
            let acquired =
                self.with_state(|s| s.queues.read(&mut s.sched, id, buf, wait, in_interrupt))?;
            let Acquire::Blocked(me) = acquired else {
                return Ok(());
            };
            match self.wait_until_running(me) {
                WaitOutcome::Granted => continue,
                outcome => return wait_error(me, outcome),
            }
        }
    }

    /// Free slots left in `id`.
    pub fn queue_remaining_space(&self, id: QueueId) -> Result<usize, Error> {
        self.with_state(|s| s.queues.remaining_space(id))
    }

    /// Free `id`. Refused while tasks wait on it or it holds data.
    pub fn queue_destroy(&self, id: QueueId) -> Result<(), Error> {
        self.with_state(|s| s.queues.destroy(&s.sched, id))
    }

    // -----------------------------------------------------------------------
    // Software timers
    // -----------------------------------------------------------------------

    /// Create a stopped timer. `handler` runs on the timer service task
    /// with the kernel lock released and must not block.
    pub fn timer_create<F>(&self, mode: TimerMode, interval: Tick, handler: F) -> Result<TimerId, Error>
    where
        F: FnMut() + Send + 'static,
    {
        let handler = Box::new(handler);
        self.with_state(|s| s.timers.create(mode, interval, handler))
    }

    /// Arm the timer to fire `interval` ticks from now.
    pub fn timer_start(&self, id: TimerId) -> Result<(), Error> {
        self.with_state(|s| s.timers.start(id, s.sched.now()))
    }

    /// Disarm a running timer. Its handler will not run again until the
    /// next start.
    pub fn timer_stop(&self, id: TimerId) -> Result<(), Error> {
        self.with_state(|s| s.timers.stop(id))
    }

    /// Stop `id` if needed and free its slot.
    pub fn timer_delete(&self, id: TimerId) -> Result<(), Error> {
        let handler = self.with_state(|s| s.timers.delete(id))?;
        drop(handler);
        Ok(())
    }

    /// Whether `id` is armed.
    pub fn timer_is_running(&self, id: TimerId) -> Result<bool, Error> {
        self.with_state(|s| s.timers.is_running(id))
    }

    /// Task id of the idle task, once started.
    pub fn idle_task(&self) -> Option<TaskId> {
        self.with_state(|s| s.sched.idle_task())
    }

    /// Task id of the timer service task, once started.
    pub fn timer_service_task(&self) -> Option<TaskId> {
        self.with_state(|s| s.timers.service_task())
    }
}

/// Map a wait that did not end in a grant to the caller's error.
fn wait_error(me: TaskId, outcome: WaitOutcome) -> Result<(), Error> {
    match outcome {
        WaitOutcome::TimedOut => Err(Error::Timeout),
        WaitOutcome::Deleted => Err(Error::Deleted),
        WaitOutcome::Aborted => Err(Error::WaitAborted),
        WaitOutcome::Granted => Ok(()),
        WaitOutcome::Pending => panic!("task {} running with its wait unresolved", me.index()),
    }
}
