//! # Mutex
//!
//! Recursive mutex with single-level priority inheritance.
//!
//! A waiter more urgent than the owner lifts the owner to the waiter's
//! priority for as long as the owner holds the lock. The owner's own
//! priority is remembered at acquisition and restored on the final
//! unlock. Release hands the lock straight to the most urgent waiter, so
//! nothing can slip in between release and wake-up.

use log::{debug, warn};

use crate::config::MAX_MUTEXES;
use crate::error::Error;
use crate::scheduler::{Acquire, Scheduler, WaitOrder, WaitQueueId};
use crate::task::{TaskId, WaitOutcome};
use crate::time::Wait;

/// Handle of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(usize);

impl MutexId {
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    fn wait_queue(self) -> WaitQueueId {
        WaitQueueId::new(self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct MutexControl {
    used: bool,
    owner: Option<TaskId>,
    hold_count: u32,
    /// Owner's priority before any inheritance.
    owner_priority: u8,
}

impl MutexControl {
    const FREE: Self = Self {
        used: false,
        owner: None,
        hold_count: 0,
        owner_priority: 0,
    };
}

pub(crate) struct MutexPool {
    slots: [MutexControl; MAX_MUTEXES],
}

impl MutexPool {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [MutexControl::FREE; MAX_MUTEXES],
        }
    }

    fn slot(&mut self, id: MutexId) -> Result<&mut MutexControl, Error> {
        let m = self.slots.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        if m.used {
            Ok(m)
        } else {
            Err(Error::NotCreated)
        }
    }

    pub(crate) fn create(&mut self) -> Result<MutexId, Error> {
        let index = self
            .slots
            .iter()
            .position(|m| !m.used)
            .ok_or(Error::MutexPoolExhausted)?;
        self.slots[index] = MutexControl {
            used: true,
            ..MutexControl::FREE
        };
        debug!("mutex {} created", index);
        Ok(MutexId(index))
    }

    pub(crate) fn owner(&mut self, id: MutexId) -> Result<Option<TaskId>, Error> {
        Ok(self.slot(id)?.owner)
    }

    pub(crate) fn lock(
        &mut self,
        sched: &mut Scheduler,
        id: MutexId,
        wait: Wait,
    ) -> Result<Acquire, Error> {
        let m = self.slot(id)?;
        let me = sched.running()?;

        let owner = match m.owner {
            None => {
                m.owner = Some(me);
                m.hold_count = 1;
                m.owner_priority = sched.priority(me);
                return Ok(Acquire::Done);
            }
            Some(owner) if owner == me => {
                m.hold_count += 1;
                return Ok(Acquire::Done);
            }
            Some(owner) => owner,
        };

        if wait == Wait::NoWait {
            return Err(Error::TryFailed);
        }
        let priority = sched.priority(me);
        if priority > sched.priority(owner) {
            debug!(
                "mutex {}: task {} inherits priority {}",
                id.0,
                owner.index(),
                priority
            );
            sched.change_priority(owner, priority);
        }
        sched.ready_to_block(me, id.wait_queue(), WaitOrder::Priority, wait.timeout());
        sched.schedule();
        Ok(Acquire::Blocked(me))
    }

    pub(crate) fn unlock(&mut self, sched: &mut Scheduler, id: MutexId) -> Result<(), Error> {
        let m = self.slot(id)?;
        let me = sched.running()?;
        match m.owner {
            None => return Err(Error::MutexNotLocked),
            Some(owner) if owner != me => {
                warn!("mutex {}: unlock by task {}, owned by {}", id.0, me.index(), owner.index());
                return Err(Error::MutexNotOwner);
            }
            Some(_) => {}
        }

        m.hold_count -= 1;
        if m.hold_count > 0 {
            return Ok(());
        }

        let restored = sched.priority(me) != m.owner_priority;
        if restored {
            sched.change_priority(me, m.owner_priority);
        }

        match sched.wake_first(id.wait_queue(), WaitOutcome::Granted) {
            Some(next) => {
                m.owner = Some(next);
                m.hold_count = 1;
                m.owner_priority = sched.priority(next);
                debug!("mutex {} handed to task {}", id.0, next.index());
                sched.schedule();
            }
            None => {
                m.owner = None;
                if restored {
                    sched.schedule();
                }
            }
        }
        Ok(())
    }

    pub(crate) fn destroy(&mut self, sched: &Scheduler, id: MutexId) -> Result<(), Error> {
        let m = self.slot(id)?;
        if sched.has_waiters(id.wait_queue()) {
            return Err(Error::DestroyBlockedByWaiters);
        }
        if m.owner.is_some() {
            return Err(Error::DestroyBlockedByOwner);
        }
        *m = MutexControl::FREE;
        debug!("mutex {} destroyed", id.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn spawn(s: &mut Scheduler, priority: u8) -> TaskId {
        s.register("t", priority, Vec::new(), 0, false).unwrap()
    }

    #[test]
    fn test_recursive_lock() {
        let mut s = Scheduler::new(0);
        let t = spawn(&mut s, 4);
        s.start();
        let mut pool = MutexPool::new();
        let m = pool.create().unwrap();

        assert_eq!(pool.lock(&mut s, m, Wait::Forever), Ok(Acquire::Done));
        assert_eq!(pool.lock(&mut s, m, Wait::NoWait), Ok(Acquire::Done));
        assert_eq!(pool.unlock(&mut s, m), Ok(()));
        assert_eq!(pool.owner(m), Ok(Some(t)));
        assert_eq!(pool.unlock(&mut s, m), Ok(()));
        assert_eq!(pool.owner(m), Ok(None));
        assert_eq!(pool.unlock(&mut s, m), Err(Error::MutexNotLocked));
    }

    #[test]
    fn test_inheritance_and_handover() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 0);
        let low = spawn(&mut s, 2);
        s.start();
        let mut pool = MutexPool::new();
        let m = pool.create().unwrap();
        assert_eq!(pool.lock(&mut s, m, Wait::Forever), Ok(Acquire::Done));

        let high = spawn(&mut s, 9);
        s.schedule();
        assert_eq!(s.current(), Some(high));
        assert_eq!(pool.lock(&mut s, m, Wait::NoWait), Err(Error::TryFailed));
        assert_eq!(pool.lock(&mut s, m, Wait::Forever), Ok(Acquire::Blocked(high)));
        assert_eq!(s.priority(low), 9);
        assert_eq!(s.current(), Some(low));

        assert_eq!(pool.destroy(&s, m), Err(Error::DestroyBlockedByWaiters));
        assert_eq!(pool.unlock(&mut s, m), Ok(()));
        assert_eq!(s.priority(low), 2);
        assert_eq!(pool.owner(m), Ok(Some(high)));
        assert_eq!(s.current(), Some(high));
        assert_eq!(s.take_wait_outcome(high), Some(WaitOutcome::Granted));

        assert_eq!(pool.destroy(&s, m), Err(Error::DestroyBlockedByOwner));
        assert_eq!(pool.unlock(&mut s, m), Ok(()));
        assert_eq!(pool.destroy(&s, m), Ok(()));
        assert_eq!(pool.owner(m), Err(Error::NotCreated));
    }

    #[test]
    fn test_unlock_by_non_owner() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 0);
        let a = spawn(&mut s, 3);
        s.start();
        let mut pool = MutexPool::new();
        let m = pool.create().unwrap();
        pool.lock(&mut s, m, Wait::Forever).unwrap();
        s.ready_to_delay(a, 5);
        s.schedule();
        assert_eq!(pool.unlock(&mut s, m), Err(Error::MutexNotOwner));
    }

    #[test]
    fn test_pool_exhaustion_and_bad_handle() {
        let mut pool = MutexPool::new();
        for _ in 0..MAX_MUTEXES {
            pool.create().unwrap();
        }
        assert_eq!(pool.create(), Err(Error::MutexPoolExhausted));
        assert_eq!(pool.owner(MutexId::from_index(MAX_MUTEXES)), Err(Error::InvalidHandle));
    }
}
