//! Futex-style wait/wake cell.
//!
//! A futex lets a waiter block conditionally on the current value of a
//! 32-bit word and lets another party wake one or all such waiters. It is
//! the sole blocking primitive of the threaded scheduling model: mutexes,
//! semaphores and the timer runner all park through it.
//!
//! The kernel futex table is emulated with a per-word queue of parked
//! waiter slots. A waiting task additionally registers its slot with the
//! task itself so that a stop-the-world request can wake it out of the
//! wait (a legal spurious wakeup) and run the scan rendezvous.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{clear_wait_slot, current_gc_pending, register_wait_slot, safepoint};

/// One parked waiter. Slots are single-use: a fresh slot is created for
/// every wait and discarded when the wait returns.
pub(crate) struct WaitSlot {
    /// Set to true by the first wake; a parked waiter sleeps until then.
    woken: Mutex<bool>,
    cond: Condvar,
}

impl WaitSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            woken: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Wake the slot. Returns false if it had already been woken, so that
    /// `Futex::wake` can skip slots consumed by a stop-the-world poke.
    pub(crate) fn wake(&self) -> bool {
        let mut woken = self.woken.lock().unwrap();
        let first = !*woken;
        *woken = true;
        self.cond.notify_one();
        first
    }

    fn park(&self) {
        let mut woken = self.woken.lock().unwrap();
        while !*woken {
            woken = self.cond.wait(woken).unwrap();
        }
    }

    fn park_timeout(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut woken = self.woken.lock().unwrap();
        while !*woken {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (guard, _) = self.cond.wait_timeout(woken, deadline - now).unwrap();
            woken = guard;
        }
    }
}

/// An atomically accessed 32-bit cell with conditional-wait and wake
/// operations.
///
/// `wait` blocks only if the cell still holds the expected value at the
/// moment the wait is registered, which closes the store-then-wake race.
/// A wait may return for reasons unrelated to a matching wake, so callers
/// must always re-validate the protected value after waking.
pub struct Futex {
    value: AtomicU32,
    waiters: Mutex<VecDeque<Arc<WaitSlot>>>,
}

impl Futex {
    /// Create a futex with an initial value of zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically load the value.
    #[inline]
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Atomically store a new value. Does not wake waiters.
    #[inline]
    pub fn store(&self, value: u32) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Atomically add `delta` (wrapping) and return the new value.
    #[inline]
    pub fn add(&self, delta: i32) -> u32 {
        self.value
            .fetch_add(delta as u32, Ordering::SeqCst)
            .wrapping_add(delta as u32)
    }

    /// Atomically replace the value, returning the previous one.
    #[inline]
    pub fn swap(&self, value: u32) -> u32 {
        self.value.swap(value, Ordering::SeqCst)
    }

    /// Atomically replace `expected` with `new`. Returns true on success.
    #[inline]
    pub fn compare_and_swap(&self, expected: u32, new: u32) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Block the calling task while the cell still equals `expected`.
    ///
    /// May return spuriously; the caller must re-check the protected value
    /// and never treat a return as proof of a matching wake.
    pub fn wait(&self, expected: u32) {
        self.wait_inner(expected, None);
    }

    /// Like [`Futex::wait`], but returns after `timeout` even without a
    /// wake.
    pub fn wait_until(&self, expected: u32, timeout: Duration) {
        self.wait_inner(expected, Some(timeout));
    }

    fn wait_inner(&self, expected: u32, timeout: Option<Duration>) {
        let slot = WaitSlot::new();
        let bound = register_wait_slot(&slot);

        // Enqueue only while the value still matches; checking under the
        // queue lock prevents a lost wakeup from a concurrent store+wake.
        {
            let mut queue = self.waiters.lock().unwrap();
            if self.value.load(Ordering::SeqCst) != expected {
                drop(queue);
                if bound {
                    clear_wait_slot();
                    safepoint();
                }
                return;
            }
            queue.push_back(slot.clone());
        }

        // A stop-the-world request that raced with the registration above
        // may have missed the slot; the pending flag catches that side.
        if bound && current_gc_pending() {
            slot.wake();
        }

        match timeout {
            None => slot.park(),
            Some(timeout) => slot.park_timeout(timeout),
        }

        self.unlink(&slot);
        if bound {
            clear_wait_slot();
            safepoint();
        }
    }

    /// Wake up to `count` waiters.
    pub fn wake(&self, count: u32) {
        let mut queue = self.waiters.lock().unwrap();
        let mut woken = 0;
        while woken < count {
            match queue.pop_front() {
                Some(slot) => {
                    // Slots already woken by a stop-the-world poke do not
                    // consume a wake.
                    if slot.wake() {
                        woken += 1;
                    }
                }
                None => break,
            }
        }
    }

    /// Wake every waiter.
    #[inline]
    pub fn wake_all(&self) {
        self.wake(u32::MAX);
    }

    /// Remove a slot from the wait queue, if it is still linked.
    fn unlink(&self, slot: &Arc<WaitSlot>) {
        let mut queue = self.waiters.lock().unwrap();
        if let Some(pos) = queue.iter().position(|s| Arc::ptr_eq(s, slot)) {
            queue.remove(pos);
        }
    }
}

impl Default for Futex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Futex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Futex").field("value", &self.load()).finish()
    }
}
