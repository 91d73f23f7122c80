//! PMutex: a short-critical-section lock over the futex word.
//!
//! A real mutex on systems where threads run in parallel, and effectively
//! free under the cooperative model where it is never contended (only one
//! task runs at a time, and no yield point sits inside a PMutex section).
//! It guards runtime-internal state: the task arena and the timer queue.
//!
//! Built on the same pokeable futex as every other blocking point, so a
//! task parked on a PMutex still honors a stop-the-world request.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use crossbeam_utils::Backoff;

use super::Futex;

/// Mutual exclusion for runtime-internal data.
///
/// State lives in one futex word: 0 unlocked, 1 locked, 2 locked with
/// waiters. Misuse checking is deliberately absent to keep the lock as
/// light as possible; the guard type makes unbalanced unlocks impossible
/// from safe code anyway.
pub struct PMutex<T> {
    futex: Futex,
    data: UnsafeCell<T>,
}

// The lock protocol hands out at most one guard at a time.
unsafe impl<T: Send> Send for PMutex<T> {}
unsafe impl<T: Send> Sync for PMutex<T> {}

impl<T> PMutex<T> {
    /// Create an unlocked PMutex holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            futex: Futex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) -> PMutexGuard<'_, T> {
        // Fast path: take an uncontended lock.
        if self.futex.compare_and_swap(0, 1) {
            return PMutexGuard { lock: self };
        }

        // Contended: mark the lock as such and spin briefly before
        // parking, re-checking after every wakeup.
        let backoff = Backoff::new();
        while self.futex.swap(2) != 0 {
            if backoff.is_completed() {
                self.futex.wait(2);
            } else {
                backoff.snooze();
            }
        }
        PMutexGuard { lock: self }
    }

    /// Try to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<PMutexGuard<'_, T>> {
        if self.futex.compare_and_swap(0, 1) {
            Some(PMutexGuard { lock: self })
        } else {
            None
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PMutex<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("PMutex").field("data", &*guard).finish(),
            None => f.debug_struct("PMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard released on drop.
pub struct PMutexGuard<'a, T> {
    lock: &'a PMutex<T>,
}

impl<T> Deref for PMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for PMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for PMutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.futex.swap(0) == 2 {
            // The lock was contended: wake the next waiter.
            self.lock.futex.wake(1);
        }
    }
}
