//! Wait-queue synchronization for the cooperative scheduling model.
//!
//! With a single running task, spinning cannot make progress, so these
//! primitives park contenders on explicit per-lock wait queues and hand
//! the lock over directly with pause/resume. A resume credit delivered
//! before the matching pause is legal and must not deadlock, so the
//! enqueue-then-pause sequence here is race-free even though the state
//! lock is dropped in between.

use std::collections::VecDeque;
use std::sync::Arc;

use super::SyncError;
use crate::task::{self, PMutex, Task};
use crate::unwind;

/// Mutual exclusion lock with a FIFO wait queue.
#[derive(Debug)]
pub struct Mutex {
    state: PMutex<MutexState>,
}

#[derive(Debug)]
struct MutexState {
    locked: bool,
    waiters: VecDeque<Arc<Task>>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// Create an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            state: PMutex::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the lock, parking until it is handed over.
    pub fn lock(&self) {
        let mut state = self.state.lock();
        if !state.locked {
            state.locked = true;
            return;
        }
        state.waiters.push_back(task::current());
        drop(state);
        // Unlock hands the lock over before resuming us; on wakeup we
        // already own it.
        task::pause();
    }

    /// Release the lock, handing it to the first queued waiter if any.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        if !state.locked {
            drop(state);
            unwind::raise(SyncError::UnlockOfUnlocked);
        }
        match state.waiters.pop_front() {
            Some(next) => {
                // Ownership transfers; locked stays true.
                drop(state);
                next.resume();
            }
            None => state.locked = false,
        }
    }

    /// Try to acquire the lock without parking.
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }
}

/// Sentinel state marking the counter as write-locked.
const WRITE_LOCKED: u32 = u32::MAX;
/// Highest representable reader count.
const MAX_READERS: u32 = WRITE_LOCKED - 1;

/// Reader/writer lock with explicit reader and writer wait queues.
///
/// The state counter is 0 when fully unlocked, [`WRITE_LOCKED`] while a
/// writer holds the lock, and the number of active readers otherwise.
/// Unlocking a writer prefers draining the whole reader queue over
/// handing off to a single writer, so queued readers are never starved
/// once the writer has released.
#[derive(Debug)]
pub struct RwMutex {
    state: PMutex<RwState>,
}

#[derive(Debug)]
struct RwState {
    count: u32,
    writers: VecDeque<Arc<Task>>,
    readers: VecDeque<Arc<Task>>,
}

impl Default for RwMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RwMutex {
    /// Create an unlocked rwmutex.
    pub const fn new() -> Self {
        Self {
            state: PMutex::new(RwState {
                count: 0,
                writers: VecDeque::new(),
                readers: VecDeque::new(),
            }),
        }
    }

    /// Acquire the write lock.
    pub fn lock(&self) {
        let mut state = self.state.lock();
        if state.count == 0 {
            state.count = WRITE_LOCKED;
            return;
        }
        state.writers.push_back(task::current());
        drop(state);
        // Woken with the counter already set to WRITE_LOCKED for us.
        task::pause();
    }

    /// Release the write lock.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        if state.count != WRITE_LOCKED {
            let err = if state.count > 0 {
                SyncError::WriteUnlockOfReadLocked
            } else {
                SyncError::RwUnlockOfUnlocked
            };
            drop(state);
            unwind::raise(err);
        }

        if !state.readers.is_empty() {
            // Switch to shared mode: transfer the lock to every queued
            // reader as a single batch.
            let drained: Vec<Arc<Task>> = state.readers.drain(..).collect();
            state.count = drained.len() as u32;
            drop(state);
            for reader in drained {
                reader.resume();
            }
        } else if let Some(writer) = state.writers.pop_front() {
            // Hand off to the next writer; the counter stays
            // WRITE_LOCKED on its behalf.
            drop(state);
            writer.resume();
        } else {
            state.count = 0;
        }
    }

    /// Acquire a read lock, parking while a writer holds the lock.
    pub fn rlock(&self) {
        let mut state = self.state.lock();
        if state.count == WRITE_LOCKED {
            state.readers.push_back(task::current());
            drop(state);
            // The batch hand-off in unlock() already counted us.
            task::pause();
            return;
        }
        if state.count == MAX_READERS {
            drop(state);
            unwind::raise(SyncError::TooManyReaders);
        }
        state.count += 1;
    }

    /// Release a read lock; the last reader unblocks one queued writer.
    pub fn runlock(&self) {
        let mut state = self.state.lock();
        match state.count {
            0 => {
                drop(state);
                unwind::raise(SyncError::RwUnlockOfUnlocked);
            }
            WRITE_LOCKED => {
                drop(state);
                unwind::raise(SyncError::ReadUnlockOfWriteLocked);
            }
            _ => {
                state.count -= 1;
                if state.count == 0 {
                    if let Some(writer) = state.writers.pop_front() {
                        state.count = WRITE_LOCKED;
                        drop(state);
                        writer.resume();
                    }
                }
            }
        }
    }

    /// Expose the read side through the plain lock/unlock shape.
    pub fn rlocker(&self) -> RLocker<'_> {
        RLocker { rw: self }
    }
}

/// Adaptor implementing lock/unlock by calling rlock/runlock.
#[derive(Debug)]
pub struct RLocker<'a> {
    rw: &'a RwMutex,
}

impl RLocker<'_> {
    #[inline]
    pub fn lock(&self) {
        self.rw.rlock();
    }

    #[inline]
    pub fn unlock(&self) {
        self.rw.runlock();
    }
}
