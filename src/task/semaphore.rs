//! Barebones counting semaphore.
//!
//! The main limitation is that with multiple waiters a single `post` call
//! may not wake anything: only once `post` has been called often enough to
//! bring the count back to zero do the waiters proceed. This is not a
//! problem when there is a single waiter, which is the only way the
//! scheduler uses it (pause/resume and the GC rendezvous are one-to-one).

use super::Futex;

/// Counting semaphore over a futex word.
#[derive(Debug, Default)]
pub struct Semaphore {
    futex: Futex,
}

impl Semaphore {
    /// Create a semaphore with a count of zero.
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(),
        }
    }

    /// Post (unlock) the semaphore, incrementing its count.
    pub fn post(&self) {
        let new_value = self.futex.add(1);
        if new_value == 0 {
            // The count went from negative to zero: waiters exist.
            self.futex.wake_all();
        }
    }

    /// Wait (lock) the semaphore, decrementing its count. Blocks while the
    /// count is negative.
    pub fn wait(&self) {
        let mut value = self.futex.add(-1);
        loop {
            if value as i32 >= 0 {
                // Count is non-negative: the decrement was covered by an
                // earlier post, possibly one that arrived before this wait.
                return;
            }
            self.futex.wait(value);
            value = self.futex.load();
        }
    }
}
