//! # Kernel Time
//!
//! The tick counter is a free-running `u32` that wraps. Two instants are
//! ordered by the sign of their difference, never by magnitude, so the
//! comparisons stay correct across the wrap as long as the instants are
//! less than `MAX_DELAY` ticks apart.

use crate::error::Error;

/// One SysTick period.
pub type Tick = u32;

/// `wake_time` of a task that has no delay or timeout pending.
pub const NO_WAKE: Tick = Tick::MAX;

/// Delays and timeouts must be strictly below this many ticks.
pub const MAX_DELAY: Tick = Tick::MAX / 2;

/// `a` is strictly later than `b`.
#[inline]
pub const fn after(a: Tick, b: Tick) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` is later than or equal to `b`.
#[inline]
pub const fn after_eq(a: Tick, b: Tick) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// `a` is strictly earlier than `b`.
#[inline]
pub const fn before(a: Tick, b: Tick) -> bool {
    after(b, a)
}

/// `a` is earlier than or equal to `b`.
#[inline]
pub const fn before_eq(a: Tick, b: Tick) -> bool {
    after_eq(b, a)
}

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    /// Fail with `Error::TryFailed` instead of blocking.
    NoWait,
    /// Block for at most this many ticks.
    Ticks(Tick),
    /// Block until the resource becomes available.
    Forever,
}

impl Wait {
    /// Convert a user-supplied timeout. Zero means "try".
    pub(crate) fn from_timeout(ticks: Tick) -> Result<Self, Error> {
        match ticks {
            0 => Ok(Wait::NoWait),
            t if t >= MAX_DELAY => Err(Error::InvalidTimeout),
            t => Ok(Wait::Ticks(t)),
        }
    }

    /// Timeout to arm on the timeout list, `None` for an endless block.
    pub(crate) fn timeout(self) -> Option<Tick> {
        match self {
            Wait::Ticks(t) => Some(t),
            Wait::NoWait | Wait::Forever => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_ordering_across_wrap() {
        let late = 5u32;
        let early = u32::MAX - 5;
        assert!(after(late, early));
        assert!(before(early, late));
        assert!(!after(early, late));
        assert!(after_eq(late, late));
        assert!(before_eq(late, late));
        assert!(!after(late, late));
    }

    #[test]
    fn test_wait_from_timeout() {
        assert_eq!(Wait::from_timeout(0), Ok(Wait::NoWait));
        assert_eq!(Wait::from_timeout(10), Ok(Wait::Ticks(10)));
        assert_eq!(Wait::from_timeout(MAX_DELAY), Err(Error::InvalidTimeout));
        assert_eq!(Wait::Forever.timeout(), None);
    }

    #[quickcheck]
    fn qc_deadline_is_after_now(now: u32, delay: u32) -> bool {
        let delay = delay % (MAX_DELAY - 1) + 1;
        let deadline = now.wrapping_add(delay);
        after(deadline, now) && before(now, deadline) && !after_eq(now, deadline)
    }

    #[quickcheck]
    fn qc_after_eq_is_after_or_equal(a: u32, b: u32) -> bool {
        after_eq(a, b) == (after(a, b) || a == b)
    }
}
