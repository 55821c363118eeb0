//! # Kernel Lock
//!
//! All kernel state sits behind one critical section. On Cortex-M the
//! `critical-section` implementation from `cortex-m` masks interrupts
//! with PRIMASK and restores the previous mask on exit, so sections nest
//! and may be entered from handlers. Hosted builds plug in the `std`
//! implementation.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::arch::Port;
use crate::kernel::Kernel;

/// Interior-mutable cell that can only be opened inside a critical section.
pub(crate) struct KernelLock<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> KernelLock<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access. Re-entering from inside `f` panics
    /// on the `RefCell` borrow.
    #[inline]
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }
}

/// Keeps the scheduler suspended while alive.
///
/// Guards nest. Scheduling decisions requested while any guard is alive
/// are collapsed into one, made when the last guard drops. Blocking calls
/// fail with [`Error::SchedulerSuspended`](crate::Error::SchedulerSuspended)
/// in the meantime.
#[must_use = "the scheduler resumes as soon as the guard is dropped"]
pub struct SchedulerSuspendGuard<'k, P: Port> {
    kernel: &'k Kernel<P>,
}

impl<'k, P: Port> SchedulerSuspendGuard<'k, P> {
    pub(crate) fn new(kernel: &'k Kernel<P>) -> Self {
        kernel.with_state(|s| s.sched.suspend_scheduling());
        Self { kernel }
    }
}

impl<P: Port> Drop for SchedulerSuspendGuard<'_, P> {
    fn drop(&mut self) {
        self.kernel.with_state(|s| s.sched.resume_scheduling());
    }
}
