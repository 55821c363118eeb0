//! # Counting Semaphore
//!
//! Waiters queue in arrival order regardless of priority. A post with
//! waiters present hands the unit straight to the one that has waited
//! longest; the count only grows when nobody is waiting.

use log::debug;

use crate::config::{MAX_MUTEXES, MAX_SEMAPHORES};
use crate::error::Error;
use crate::scheduler::{Acquire, Scheduler, WaitOrder, WaitQueueId};
use crate::task::WaitOutcome;
use crate::time::Wait;

/// Handle of a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(usize);

impl SemaphoreId {
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    fn wait_queue(self) -> WaitQueueId {
        WaitQueueId::new(MAX_MUTEXES + self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct SemaphoreControl {
    used: bool,
    count: u32,
    max_count: u32,
}

impl SemaphoreControl {
    const FREE: Self = Self {
        used: false,
        count: 0,
        max_count: 0,
    };
}

pub(crate) struct SemaphorePool {
    slots: [SemaphoreControl; MAX_SEMAPHORES],
}

impl SemaphorePool {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [SemaphoreControl::FREE; MAX_SEMAPHORES],
        }
    }

    fn slot(&mut self, id: SemaphoreId) -> Result<&mut SemaphoreControl, Error> {
        let sem = self.slots.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        if sem.used {
            Ok(sem)
        } else {
            Err(Error::NotCreated)
        }
    }

    pub(crate) fn create(&mut self, initial: u32, max_count: u32) -> Result<SemaphoreId, Error> {
        if initial > max_count {
            return Err(Error::SemaphoreOverflow);
        }
        let index = self
            .slots
            .iter()
            .position(|s| !s.used)
            .ok_or(Error::SemaphorePoolExhausted)?;
        self.slots[index] = SemaphoreControl {
            used: true,
            count: initial,
            max_count,
        };
        debug!("semaphore {} created ({}/{})", index, initial, max_count);
        Ok(SemaphoreId(index))
    }

    pub(crate) fn count(&mut self, id: SemaphoreId) -> Result<u32, Error> {
        Ok(self.slot(id)?.count)
    }

    pub(crate) fn wait(
        &mut self,
        sched: &mut Scheduler,
        id: SemaphoreId,
        wait: Wait,
    ) -> Result<Acquire, Error> {
        let sem = self.slot(id)?;
        if sem.count > 0 {
            sem.count -= 1;
            return Ok(Acquire::Done);
        }
        if wait == Wait::NoWait {
            return Err(Error::TryFailed);
        }
        let me = sched.running()?;
        sched.ready_to_block(me, id.wait_queue(), WaitOrder::Fifo, wait.timeout());
        sched.schedule();
        Ok(Acquire::Blocked(me))
    }

    pub(crate) fn post(&mut self, sched: &mut Scheduler, id: SemaphoreId) -> Result<(), Error> {
        let sem = self.slot(id)?;
        if let Some(waiter) = sched.wake_first(id.wait_queue(), WaitOutcome::Granted) {
            debug!("semaphore {} handed to task {}", id.0, waiter.index());
            sched.schedule();
            return Ok(());
        }
        if sem.count >= sem.max_count {
            return Err(Error::SemaphoreOverflow);
        }
        sem.count += 1;
        Ok(())
    }

    /// Release the slot. Every waiter wakes with `Deleted`.
    pub(crate) fn destroy(&mut self, sched: &mut Scheduler, id: SemaphoreId) -> Result<(), Error> {
        let sem = self.slot(id)?;
        *sem = SemaphoreControl::FREE;
        let woken = sched.wake_all(id.wait_queue(), WaitOutcome::Deleted);
        debug!("semaphore {} destroyed, {} waiters released", id.0, woken);
        if woken > 0 {
            sched.schedule();
        }
        Ok(())
    }

    #[cfg(test)]
    fn waiters(sched: &Scheduler, id: SemaphoreId) -> usize {
        sched.waiter_count(id.wait_queue())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SEMAPHORE_MAX_COUNT;
    use crate::task::TaskId;
    use alloc::vec::Vec;
    use quickcheck_macros::quickcheck;

    fn spawn(s: &mut Scheduler, priority: u8) -> TaskId {
        s.register("t", priority, Vec::new(), 0, false).unwrap()
    }

    #[test]
    fn test_counting() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 1);
        s.start();
        let mut pool = SemaphorePool::new();
        let id = pool.create(2, 3).unwrap();

        assert_eq!(pool.wait(&mut s, id, Wait::NoWait), Ok(Acquire::Done));
        assert_eq!(pool.wait(&mut s, id, Wait::NoWait), Ok(Acquire::Done));
        assert_eq!(pool.wait(&mut s, id, Wait::NoWait), Err(Error::TryFailed));
        for _ in 0..3 {
            pool.post(&mut s, id).unwrap();
        }
        assert_eq!(pool.post(&mut s, id), Err(Error::SemaphoreOverflow));
        assert_eq!(pool.count(id), Ok(3));
    }

    #[test]
    fn test_create_above_cap() {
        let mut pool = SemaphorePool::new();
        assert_eq!(pool.create(2, 1).unwrap_err(), Error::SemaphoreOverflow);
        assert!(pool.create(SEMAPHORE_MAX_COUNT, SEMAPHORE_MAX_COUNT).is_ok());
    }

    #[test]
    fn test_fifo_wakeup_ignores_priority() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 0);
        let low = spawn(&mut s, 2);
        let high = spawn(&mut s, 8);
        s.start();
        let mut pool = SemaphorePool::new();
        let id = pool.create(0, 5).unwrap();

        // `high` runs first and blocks, then `low`.
        assert_eq!(pool.wait(&mut s, id, Wait::Forever), Ok(Acquire::Blocked(high)));
        assert_eq!(s.current(), Some(low));
        assert_eq!(pool.wait(&mut s, id, Wait::Forever), Ok(Acquire::Blocked(low)));

        pool.post(&mut s, id).unwrap();
        assert_eq!(s.current(), Some(high));
        assert_eq!(pool.count(id), Ok(0));
        assert_eq!(SemaphorePool::waiters(&s, id), 1);
    }

    #[test]
    fn test_destroy_releases_waiters() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 0);
        let t = spawn(&mut s, 4);
        s.start();
        let mut pool = SemaphorePool::new();
        let id = pool.create(0, 1).unwrap();
        pool.wait(&mut s, id, Wait::Ticks(50)).unwrap();

        pool.destroy(&mut s, id).unwrap();
        assert_eq!(s.current(), Some(t));
        assert_eq!(s.take_wait_outcome(t), Some(WaitOutcome::Deleted));
        assert_eq!(pool.count(id), Err(Error::NotCreated));
    }

    /// `count + waiters` moves by exactly one per post and per wait that
    /// takes a unit or goes to sleep.
    #[quickcheck]
    fn qc_conservation(ops: Vec<bool>) {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 0);
        let tasks: Vec<TaskId> = (0..4).map(|_| spawn(&mut s, 3)).collect();
        s.start();
        let mut pool = SemaphorePool::new();
        let id = pool.create(1, SEMAPHORE_MAX_COUNT).unwrap();

        let mut balance: i64 = 1;
        for post in ops {
            let running = s.current().unwrap();
            if post {
                pool.post(&mut s, id).unwrap();
                balance += 1;
            } else if tasks.contains(&running) {
                let acquired = pool.wait(&mut s, id, Wait::Forever).unwrap();
                log::trace!("wait by {:?} -> {:?}", running, acquired);
                balance -= 1;
            }
            let waiters = SemaphorePool::waiters(&s, id) as i64;
            let count = pool.count(id).unwrap() as i64;
            assert_eq!(count - waiters, balance);
            assert!(count == 0 || waiters == 0);
        }
    }
}
