//! # Software Timers
//!
//! Armed timers sit on one list sorted by expiry, with the head's expiry
//! cached in `next_wake`. The tick handler only compares the clock with
//! `next_wake` and, when it is due, readies the timer service task. That
//! task (priority 31) does the actual work: it pops every expired timer,
//! re-arms auto-reload timers from the current tick, and runs the
//! handlers with the kernel lock released.

use alloc::boxed::Box;
use log::{debug, trace};

use crate::config::MAX_TIMERS;
use crate::error::Error;
use crate::list::{Link, List};
use crate::scheduler::Scheduler;
use crate::task::{TaskId, TaskState};
use crate::time::{after_eq, before, Tick, MAX_DELAY, NO_WAKE};

/// Handle of a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

impl TimerId {
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once, then stop.
    OneShot,
    /// Fire every `interval` ticks until stopped.
    AutoReload,
}

/// Timer callback. Runs on the timer service task.
pub(crate) type TimerHandler = Box<dyn FnMut() + Send + 'static>;

struct TimerControl {
    used: bool,
    /// Bumped on delete so a handler that was out running can tell its
    /// slot was recycled.
    generation: u32,
    mode: TimerMode,
    interval: Tick,
    wake_time: Tick,
    running: bool,
    /// `None` while the handler is being run.
    handler: Option<TimerHandler>,
}

impl TimerControl {
    const FREE: Self = Self {
        used: false,
        generation: 0,
        mode: TimerMode::OneShot,
        interval: 0,
        wake_time: NO_WAKE,
        running: false,
        handler: None,
    };
}

/// An expired timer whose handler has been taken out to run.
pub(crate) struct Expired {
    id: TimerId,
    generation: u32,
    pub(crate) handler: Option<TimerHandler>,
}

pub(crate) struct TimerPool {
    slots: [TimerControl; MAX_TIMERS],
    links: [Link; MAX_TIMERS],
    armed: List,
    next_wake: Tick,
    service_task: Option<TaskId>,
}

impl TimerPool {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [TimerControl::FREE; MAX_TIMERS],
            links: [Link::UNLINKED; MAX_TIMERS],
            armed: List::new(),
            next_wake: NO_WAKE,
            service_task: None,
        }
    }

    pub(crate) fn set_service_task(&mut self, task: TaskId) {
        self.service_task = Some(task);
    }

    pub(crate) fn service_task(&self) -> Option<TaskId> {
        self.service_task
    }

    fn slot(&mut self, id: TimerId) -> Result<&mut TimerControl, Error> {
        let t = self.slots.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        if t.used {
            Ok(t)
        } else {
            Err(Error::NotCreated)
        }
    }

    pub(crate) fn create(
        &mut self,
        mode: TimerMode,
        interval: Tick,
        handler: TimerHandler,
    ) -> Result<TimerId, Error> {
        if interval == 0 || interval >= MAX_DELAY {
            return Err(Error::InvalidInterval);
        }
        let index = self
            .slots
            .iter()
            .position(|t| !t.used)
            .ok_or(Error::TimerPoolExhausted)?;
        let slot = &mut self.slots[index];
        slot.used = true;
        slot.mode = mode;
        slot.interval = interval;
        slot.wake_time = NO_WAKE;
        slot.running = false;
        slot.handler = Some(handler);
        debug!("timer {} created ({:?}, every {} ticks)", index, mode, interval);
        Ok(TimerId(index))
    }

    pub(crate) fn is_running(&mut self, id: TimerId) -> Result<bool, Error> {
        Ok(self.slot(id)?.running)
    }

    pub(crate) fn next_wake(&self) -> Option<Tick> {
        self.armed.front().map(|_| self.next_wake)
    }

    pub(crate) fn start(&mut self, id: TimerId, now: Tick) -> Result<(), Error> {
        let timer = self.slot(id)?;
        if timer.running {
            return Err(Error::TimerAlreadyRunning);
        }
        timer.wake_time = now.wrapping_add(timer.interval);
        self.arm(id);
        Ok(())
    }

    pub(crate) fn stop(&mut self, id: TimerId) -> Result<(), Error> {
        if !self.slot(id)?.running {
            return Err(Error::TimerNotRunning);
        }
        self.disarm(id);
        Ok(())
    }

    /// Release the slot, stopping the timer first if needed. Returns the
    /// handler so the caller can drop it outside the critical section.
    pub(crate) fn delete(&mut self, id: TimerId) -> Result<Option<TimerHandler>, Error> {
        if self.slot(id)?.running {
            self.disarm(id);
        }
        let timer = &mut self.slots[id.0];
        let generation = timer.generation.wrapping_add(1);
        let handler = timer.handler.take();
        *timer = TimerControl {
            generation,
            ..TimerControl::FREE
        };
        debug!("timer {} deleted", id.0);
        // A handler that is out running comes back through `restore` and
        // is dropped there.
        Ok(handler)
    }

    fn arm(&mut self, id: TimerId) {
        let slots = &self.slots;
        let wake = slots[id.0].wake_time;
        self.armed
            .insert_by(&mut self.links, id.0, |at| before(wake, slots[at].wake_time));
        self.slots[id.0].running = true;
        self.refresh_next_wake();
        trace!("timer {} armed for {}", id.0, wake);
    }

    fn disarm(&mut self, id: TimerId) {
        self.armed.remove(&mut self.links, id.0);
        let timer = &mut self.slots[id.0];
        timer.running = false;
        timer.wake_time = NO_WAKE;
        self.refresh_next_wake();
    }

    fn refresh_next_wake(&mut self) {
        self.next_wake = match self.armed.front() {
            Some(head) => self.slots[head].wake_time,
            None => NO_WAKE,
        };
    }

    /// Tick hook: ready the service task when the earliest timer is due.
    pub(crate) fn check(&self, sched: &mut Scheduler) {
        if self.armed.is_empty() || !after_eq(sched.now(), self.next_wake) {
            return;
        }
        if let Some(task) = self.service_task {
            if sched.state(task) == TaskState::Suspended {
                trace!("timer service due at {}", self.next_wake);
                sched.suspend_to_ready(task);
            }
        }
    }

    /// Pop the earliest timer if it has expired at `now`, re-arming it if
    /// it auto-reloads, and take its handler out to run.
    pub(crate) fn expire_next(&mut self, now: Tick) -> Option<Expired> {
        let head = self.armed.front()?;
        if !after_eq(now, self.slots[head].wake_time) {
            return None;
        }
        let id = TimerId(head);
        self.disarm(id);
        if self.slots[head].mode == TimerMode::AutoReload {
            let timer = &mut self.slots[head];
            timer.wake_time = now.wrapping_add(timer.interval);
            self.arm(id);
        }
        let timer = &mut self.slots[head];
        debug!("timer {} expired at {}", head, now);
        Some(Expired {
            id,
            generation: timer.generation,
            handler: timer.handler.take(),
        })
    }

    /// Put a handler back after it ran, unless its timer was deleted
    /// meanwhile.
    pub(crate) fn restore(&mut self, expired: Expired) {
        let timer = &mut self.slots[expired.id.0];
        if timer.used && timer.generation == expired.generation && timer.handler.is_none() {
            timer.handler = expired.handler;
        }
    }

    /// End of one service pass: park the service task until the next
    /// expiry.
    pub(crate) fn finish_service(&mut self, sched: &mut Scheduler) {
        self.refresh_next_wake();
        if let Some(task) = self.service_task {
            if sched.state(task) == TaskState::Ready {
                sched.ready_to_suspend(task);
                sched.schedule();
            }
        }
    }
}
