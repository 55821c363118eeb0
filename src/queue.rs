//! # Bounded Queue
//!
//! A ring of `element_count` fixed-size slots in one heap buffer.
//!
//! `read_pos` and `write_pos` only move forward and the slot of a cursor
//! is `pos % element_count`. Once the read cursor has gone a full lap
//! both cursors are pulled back by `element_count`, which keeps their
//! difference and their slots while keeping them below
//! `2 * element_count`.
//!
//! Readers and writers sleep on separate priority-ordered lists. A
//! woken task is not handed anything: it re-checks the queue, because a
//! more urgent task may have got there first.

use alloc::vec::Vec;
use log::debug;

use crate::config::{MAX_MUTEXES, MAX_QUEUES, MAX_SEMAPHORES};
use crate::error::Error;
use crate::scheduler::{Acquire, Scheduler, WaitOrder, WaitQueueId};
use crate::task::{TaskId, WaitOutcome};
use crate::time::Wait;

const FIRST_QUEUE_WAIT_QUEUE: usize = MAX_MUTEXES + MAX_SEMAPHORES;

/// Handle of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(usize);

impl QueueId {
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    fn readers(self) -> WaitQueueId {
        WaitQueueId::new(FIRST_QUEUE_WAIT_QUEUE + 2 * self.0)
    }

    fn writers(self) -> WaitQueueId {
        WaitQueueId::new(FIRST_QUEUE_WAIT_QUEUE + 2 * self.0 + 1)
    }
}

struct QueueControl {
    used: bool,
    element_size: usize,
    element_count: usize,
    buffer: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl QueueControl {
    const FREE: Self = Self {
        used: false,
        element_size: 0,
        element_count: 0,
        buffer: Vec::new(),
        read_pos: 0,
        write_pos: 0,
    };

    #[inline]
    fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.element_count - self.len()
    }

    fn slot_mut(&mut self, pos: usize) -> &mut [u8] {
        let start = (pos % self.element_count) * self.element_size;
        &mut self.buffer[start..start + self.element_size]
    }
}

/// Allocate the zeroed ring buffer of a new queue.
pub(crate) fn alloc_buffer(element_size: usize, element_count: usize) -> Result<Vec<u8>, Error> {
    if element_size == 0 || element_count == 0 {
        return Err(Error::InvalidQueueParam);
    }
    let bytes = element_size
        .checked_mul(element_count)
        .ok_or(Error::InvalidQueueParam)?;
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|_| Error::OutOfMemory)?;
    buffer.resize(bytes, 0);
    Ok(buffer)
}

pub(crate) struct QueuePool {
    slots: [QueueControl; MAX_QUEUES],
}

impl QueuePool {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [QueueControl::FREE; MAX_QUEUES],
        }
    }

    fn slot(&mut self, id: QueueId) -> Result<&mut QueueControl, Error> {
        let q = self.slots.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        if q.used {
            Ok(q)
        } else {
            Err(Error::NotCreated)
        }
    }

    /// Claim a slot for a buffer from [`alloc_buffer`].
    pub(crate) fn create(
        &mut self,
        element_size: usize,
        element_count: usize,
        buffer: Vec<u8>,
    ) -> Result<QueueId, Error> {
        let index = self
            .slots
            .iter()
            .position(|q| !q.used)
            .ok_or(Error::QueuePoolExhausted)?;
        self.slots[index] = QueueControl {
            used: true,
            element_size,
            element_count,
            buffer,
            read_pos: 0,
            write_pos: 0,
        };
        debug!("queue {} created ({} x {} bytes)", index, element_count, element_size);
        Ok(QueueId(index))
    }

    pub(crate) fn remaining_space(&mut self, id: QueueId) -> Result<usize, Error> {
        Ok(self.slot(id)?.remaining())
    }

    /// One attempt at writing `data` into the next slot. Blocks the
    /// caller when the queue is full and `wait` allows it.
    pub(crate) fn write(
        &mut self,
        sched: &mut Scheduler,
        id: QueueId,
        data: &[u8],
        wait: Wait,
        in_interrupt: bool,
    ) -> Result<Acquire, Error> {
        let q = self.slot(id)?;
        if data.len() > q.element_size {
            return Err(Error::DataTooBig);
        }

        if q.remaining() == 0 {
            let me = check_can_block(sched, wait, in_interrupt)?;
            sched.ready_to_block(me, id.writers(), WaitOrder::Priority, wait.timeout());
            sched.schedule();
            return Ok(Acquire::Blocked(me));
        }

        let pos = q.write_pos;
        let slot = q.slot_mut(pos);
        slot[..data.len()].copy_from_slice(data);
        slot[data.len()..].fill(0);
        q.write_pos += 1;

        if sched.wake_first(id.readers(), WaitOutcome::Granted).is_some() {
            sched.schedule();
        }
        Ok(Acquire::Done)
    }

    /// One attempt at reading the oldest element into `buf`. Blocks the
    /// caller when the queue is empty and `wait` allows it.
    pub(crate) fn read(
        &mut self,
        sched: &mut Scheduler,
        id: QueueId,
        buf: &mut [u8],
        wait: Wait,
        in_interrupt: bool,
    ) -> Result<Acquire, Error> {
        let q = self.slot(id)?;
        if buf.len() > q.element_size {
            return Err(Error::DataTooBig);
        }

        if q.len() == 0 {
            let me = check_can_block(sched, wait, in_interrupt)?;
            sched.ready_to_block(me, id.readers(), WaitOrder::Priority, wait.timeout());
            sched.schedule();
            return Ok(Acquire::Blocked(me));
        }

        let pos = q.read_pos;
        let len = buf.len();
        buf.copy_from_slice(&q.slot_mut(pos)[..len]);
        q.read_pos += 1;
        if q.read_pos >= q.element_count {
            q.read_pos -= q.element_count;
            q.write_pos -= q.element_count;
        }

        if sched.wake_first(id.writers(), WaitOutcome::Granted).is_some() {
            sched.schedule();
        }
        Ok(Acquire::Done)
    }

    pub(crate) fn destroy(&mut self, sched: &Scheduler, id: QueueId) -> Result<(), Error> {
        let q = self.slot(id)?;
        if sched.has_waiters(id.writers()) {
            return Err(Error::DestroyBlockedByWriters);
        }
        if sched.has_waiters(id.readers()) {
            return Err(Error::DestroyBlockedByReaders);
        }
        if q.len() != 0 {
            return Err(Error::DestroyBlockedByData);
        }
        *q = QueueControl::FREE;
        debug!("queue {} destroyed", id.0);
        Ok(())
    }
}

fn check_can_block(sched: &Scheduler, wait: Wait, in_interrupt: bool) -> Result<TaskId, Error> {
    if wait == Wait::NoWait {
        return Err(Error::TryFailed);
    }
    if in_interrupt {
        return Err(Error::InterruptContext);
    }
    if sched.is_suspended() {
        return Err(Error::SchedulerSuspended);
    }
    sched.running()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    fn spawn(s: &mut Scheduler, priority: u8) -> TaskId {
        s.register("t", priority, Vec::new(), 0, false).unwrap()
    }

    fn new_queue(pool: &mut QueuePool, size: usize, count: usize) -> QueueId {
        let buffer = alloc_buffer(size, count).unwrap();
        pool.create(size, count, buffer).unwrap()
    }

    #[test]
    fn test_geometry_validation() {
        assert_eq!(alloc_buffer(0, 4).unwrap_err(), Error::InvalidQueueParam);
        assert_eq!(alloc_buffer(4, 0).unwrap_err(), Error::InvalidQueueParam);
        assert_eq!(alloc_buffer(usize::MAX, 2).unwrap_err(), Error::InvalidQueueParam);
        assert_eq!(alloc_buffer(usize::MAX / 2, 1).unwrap_err(), Error::OutOfMemory);
    }

    #[test]
    fn test_full_queue_rejects_try_write() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 1);
        s.start();
        let mut pool = QueuePool::new();
        let q = new_queue(&mut pool, 32, 3);

        for i in 0..3u8 {
            assert_eq!(pool.write(&mut s, q, &[i; 32], Wait::NoWait, false), Ok(Acquire::Done));
        }
        assert_eq!(pool.remaining_space(q), Ok(0));
        assert_eq!(
            pool.write(&mut s, q, &[9; 32], Wait::NoWait, false),
            Err(Error::TryFailed)
        );
        assert_eq!(
            pool.write(&mut s, q, &[9; 32], Wait::Forever, true),
            Err(Error::InterruptContext)
        );

        let mut out = [0u8; 32];
        pool.read(&mut s, q, &mut out, Wait::NoWait, false).unwrap();
        assert_eq!(out, [0; 32]);
        assert_eq!(pool.remaining_space(q), Ok(1));
        assert_eq!(pool.write(&mut s, q, &[3; 32], Wait::NoWait, false), Ok(Acquire::Done));
        assert_eq!(pool.destroy(&s, q), Err(Error::DestroyBlockedByData));
    }

    #[test]
    fn test_size_checks_and_short_payloads() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 1);
        s.start();
        let mut pool = QueuePool::new();
        let q = new_queue(&mut pool, 4, 2);

        assert_eq!(
            pool.write(&mut s, q, &[1; 5], Wait::NoWait, false),
            Err(Error::DataTooBig)
        );
        pool.write(&mut s, q, &[7, 7], Wait::NoWait, false).unwrap();
        let mut out = [0xFF; 4];
        pool.read(&mut s, q, &mut out, Wait::NoWait, false).unwrap();
        assert_eq!(out, [7, 7, 0, 0]);
        let mut big = [0; 5];
        assert_eq!(
            pool.read(&mut s, q, &mut big, Wait::NoWait, false),
            Err(Error::DataTooBig)
        );
    }

    #[test]
    fn test_reader_wakes_blocked_writer() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 0);
        let writer = spawn(&mut s, 5);
        s.start();
        let mut pool = QueuePool::new();
        let q = new_queue(&mut pool, 1, 1);

        pool.write(&mut s, q, &[1], Wait::NoWait, false).unwrap();
        assert_eq!(
            pool.write(&mut s, q, &[2], Wait::Ticks(10), false),
            Ok(Acquire::Blocked(writer))
        );
        assert_eq!(pool.destroy(&s, q), Err(Error::DestroyBlockedByWriters));

        let mut out = [0];
        pool.read(&mut s, q, &mut out, Wait::NoWait, false).unwrap();
        assert_eq!(s.current(), Some(writer));
        assert_eq!(s.take_wait_outcome(writer), Some(WaitOutcome::Granted));
        assert_eq!(pool.write(&mut s, q, &[2], Wait::Ticks(10), false), Ok(Acquire::Done));
    }

    #[test]
    fn test_writers_wake_by_priority() {
        let mut s = Scheduler::new(0);
        let idle = spawn(&mut s, 0);
        let low = spawn(&mut s, 3);
        s.start();
        let mut pool = QueuePool::new();
        let q = new_queue(&mut pool, 1, 1);

        pool.write(&mut s, q, &[1], Wait::NoWait, false).unwrap();
        assert_eq!(
            pool.write(&mut s, q, &[2], Wait::Forever, false),
            Ok(Acquire::Blocked(low))
        );
        let high = spawn(&mut s, 6);
        s.schedule();
        assert_eq!(
            pool.write(&mut s, q, &[3], Wait::Forever, false),
            Ok(Acquire::Blocked(high))
        );
        assert_eq!(s.current(), Some(idle));

        // `high` blocked last but is served first.
        let mut out = [0];
        pool.read(&mut s, q, &mut out, Wait::NoWait, false).unwrap();
        assert_eq!(out, [1]);
        assert_eq!(s.current(), Some(high));
        assert_eq!(s.state(low), TaskState::EndlessBlocked);
        assert_eq!(pool.write(&mut s, q, &[3], Wait::NoWait, false), Ok(Acquire::Done));
    }

    #[test]
    fn test_readers_wake_by_priority() {
        let mut s = Scheduler::new(0);
        let idle = spawn(&mut s, 0);
        let low = spawn(&mut s, 2);
        s.start();
        let mut pool = QueuePool::new();
        let q = new_queue(&mut pool, 1, 2);

        let mut out = [0];
        assert_eq!(
            pool.read(&mut s, q, &mut out, Wait::Ticks(20), false),
            Ok(Acquire::Blocked(low))
        );
        let high = spawn(&mut s, 9);
        s.schedule();
        assert_eq!(
            pool.read(&mut s, q, &mut out, Wait::Forever, false),
            Ok(Acquire::Blocked(high))
        );
        assert_eq!(s.current(), Some(idle));

        pool.write(&mut s, q, &[5], Wait::NoWait, false).unwrap();
        assert_eq!(s.current(), Some(high));
        assert_eq!(s.take_wait_outcome(high), Some(WaitOutcome::Granted));
        assert_eq!(s.state(low), TaskState::TimeoutBlocked);
        assert_eq!(pool.read(&mut s, q, &mut out, Wait::NoWait, false), Ok(Acquire::Done));
        assert_eq!(out, [5]);
    }

    #[test]
    fn test_cursors_stay_bounded_over_many_laps() {
        let mut s = Scheduler::new(0);
        spawn(&mut s, 1);
        s.start();
        let mut pool = QueuePool::new();
        let q = new_queue(&mut pool, 1, 3);

        pool.write(&mut s, q, &[0], Wait::NoWait, false).unwrap();
        let mut out = [0];
        for round in 1..1000u32 {
            let value = (round % 251) as u8;
            pool.write(&mut s, q, &[value], Wait::NoWait, false).unwrap();
            pool.read(&mut s, q, &mut out, Wait::NoWait, false).unwrap();
            assert_eq!(out, [((round - 1) % 251) as u8]);

            let queue = &pool.slots[q.0];
            assert!(queue.read_pos < 3, "read cursor {}", queue.read_pos);
            assert!(queue.write_pos < 6, "write cursor {}", queue.write_pos);
            assert_eq!(queue.len(), 1);
        }
    }

    /// Map random bytes to writes (even) and reads (odd) against a
    /// `VecDeque` model.
    #[quickcheck]
    fn qc_fifo_and_capacity(bytecode: Vec<u8>, count: u8) {
        let count = count as usize % 6 + 1;
        let mut s = Scheduler::new(0);
        spawn(&mut s, 1);
        s.start();
        let mut pool = QueuePool::new();
        let q = new_queue(&mut pool, 2, count);
        let mut model = VecDeque::new();

        for (i, &byte) in bytecode.iter().enumerate() {
            if byte % 2 == 0 {
                let value = [byte, i as u8];
                let result = pool.write(&mut s, q, &value, Wait::NoWait, false);
                if model.len() == count {
                    assert_eq!(result, Err(Error::TryFailed));
                } else {
                    assert_eq!(result, Ok(Acquire::Done));
                    model.push_back(value);
                }
            } else {
                let mut out = [0; 2];
                let result = pool.read(&mut s, q, &mut out, Wait::NoWait, false);
                match model.pop_front() {
                    Some(expected) => {
                        assert_eq!(result, Ok(Acquire::Done));
                        assert_eq!(out, expected);
                    }
                    None => assert_eq!(result, Err(Error::TryFailed)),
                }
            }
            let remaining = pool.remaining_space(q).unwrap();
            assert!(remaining <= count);
            assert_eq!(remaining, count - model.len());
        }
    }
}
