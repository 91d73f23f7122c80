//! Futex-based synchronization for the threaded scheduling model.

use crossbeam_utils::Backoff;

use super::SyncError;
use crate::task::Futex;
use crate::unwind;

/// Mutual exclusion lock.
///
/// State is one futex word: 0 unlocked, 1 locked uncontended, 2 locked
/// contended. These are raw lock objects guarding guest state, so lock
/// and unlock may legally happen on different tasks.
#[derive(Debug, Default)]
pub struct Mutex {
    futex: Futex,
}

impl Mutex {
    /// Create an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(),
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) {
        // Fast path: take an uncontended lock.
        if self.futex.compare_and_swap(0, 1) {
            return;
        }

        // Mark the lock contended and spin briefly before parking. Every
        // wakeup re-attempts the swap: a return from wait proves nothing.
        let backoff = Backoff::new();
        while self.futex.swap(2) != 0 {
            if backoff.is_completed() {
                self.futex.wait(2);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Release the lock, waking one waiter if the lock was contended.
    pub fn unlock(&self) {
        match self.futex.swap(0) {
            0 => unwind::raise(SyncError::UnlockOfUnlocked),
            2 => self.futex.wake(1),
            _ => {}
        }
    }

    /// Try to acquire the lock without blocking; only the fast path.
    pub fn try_lock(&self) -> bool {
        self.futex.compare_and_swap(0, 1)
    }
}

/// Maximum number of concurrent readers, also the bias a pending writer
/// subtracts from the reader count.
const RW_MAX_READERS: u32 = 1 << 30;

/// Reader/writer lock.
///
/// The reader futex holds the reader count in one of two bases: 0 for
/// normal operation, or -RW_MAX_READERS while a writer holds or wants the
/// lock. The count reaching exactly -RW_MAX_READERS means the last reader
/// is gone and the pending writer can be woken.
#[derive(Debug, Default)]
pub struct RwMutex {
    /// Reader count, possibly biased by a pending writer.
    readers: Futex,
    /// Writer hand-off: 0 idle, 1 writer waiting for readers to drain,
    /// 2 set by the last reader together with a wake.
    writer: Futex,
    /// Held between lock() and unlock() so writers exclude each other.
    writer_lock: Mutex,
}

impl RwMutex {
    /// Create an unlocked rwmutex.
    pub const fn new() -> Self {
        Self {
            readers: Futex::new(),
            writer: Futex::new(),
            writer_lock: Mutex::new(),
        }
    }

    /// Acquire the write lock.
    pub fn lock(&self) {
        // Writers exclude each other.
        self.writer_lock.lock();

        // Flag that the last reader to unlock must wake us.
        self.writer.store(1);

        // Flip the reader count into the writer-pending base; new readers
        // now wait.
        let waiting = self.readers.add(-(RW_MAX_READERS as i32));
        if waiting as i32 == -(RW_MAX_READERS as i32) {
            // No readers were holding the lock.
            self.writer.store(0);
            return;
        }

        // Wait until the last reader hands the lock off.
        while self.writer.load() == 1 {
            self.writer.wait(1);
        }
        self.writer.store(0);
    }

    /// Release the write lock.
    pub fn unlock(&self) {
        let current = self.readers.load() as i32;
        if current >= 0 {
            // Not write-locked at all.
            if current > 0 {
                unwind::raise(SyncError::WriteUnlockOfReadLocked);
            }
            unwind::raise(SyncError::RwUnlockOfUnlocked);
        }

        // Restore the unbiased base; new readers may lock again.
        let waiting = self.readers.add(RW_MAX_READERS as i32);
        if waiting != 0 {
            // Readers queued up while we held the lock.
            self.readers.wake_all();
        }

        // The next writer may try its luck.
        self.writer_lock.unlock();
    }

    /// Acquire a read lock.
    pub fn rlock(&self) {
        let mut new_val = self.readers.add(1);
        if new_val as i32 >= RW_MAX_READERS as i32 {
            unwind::raise(SyncError::TooManyReaders);
        }

        // Wait while a writer holds or wants the lock (biased negative).
        while new_val as i32 <= 0 {
            self.readers.wait(new_val);
            new_val = self.readers.load();
        }
    }

    /// Release a read lock. The last reader wakes a pending writer.
    pub fn runlock(&self) {
        let readers = self.readers.add(-1) as i32;

        // Check whether runlock was called too often.
        if readers == -1 {
            unwind::raise(SyncError::RwUnlockOfUnlocked);
        }
        if readers == -(RW_MAX_READERS as i32) - 1 {
            unwind::raise(SyncError::ReadUnlockOfWriteLocked);
        }

        if readers == -(RW_MAX_READERS as i32) {
            // Last reader out: hand off to the waiting writer.
            if self.writer.compare_and_swap(1, 2) {
                self.writer.wake(1);
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
