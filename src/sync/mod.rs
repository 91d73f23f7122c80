//! Synchronization primitives.
//!
//! Two interchangeable backends behind one lock/unlock surface:
//!
//! - [`threaded`]: futex-based spin-then-block primitives for the
//!   preemptive/multithreaded scheduling model.
//! - [`coop`]: explicit per-lock wait queues plus direct pause/resume for
//!   the cooperative model, where spinning cannot make progress because
//!   only one task runs at a time.
//!
//! The canonical `Mutex`/`RwMutex` exports follow the scheduling model
//! compiled into this artifact (cargo feature `cooperative`); both
//! backends stay public for direct use.
//!
//! Misuse (double unlock, wrong-mode unlock, reader overflow) is
//! reported as an abnormal termination carrying a [`SyncError`], which a
//! registered cleanup frame can intercept.

pub mod coop;
pub mod threaded;

#[cfg(test)]
mod tests;

#[cfg(not(feature = "cooperative"))]
pub use threaded::{Mutex, RLocker, RwMutex};

#[cfg(feature = "cooperative")]
pub use coop::{Mutex, RLocker, RwMutex};

use thiserror::Error;

/// Locally-detected lock misuse.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// Unlock of a mutex that is not locked.
    #[error("sync: unlock of unlocked mutex")]
    UnlockOfUnlocked,

    /// Write-unlock of an rwmutex that is not locked at all.
    #[error("sync: unlock of unlocked rwmutex")]
    RwUnlockOfUnlocked,

    /// Write-unlock of an rwmutex that is only read-locked.
    #[error("sync: write-unlock of read-locked rwmutex")]
    WriteUnlockOfReadLocked,

    /// Read-unlock of an rwmutex that is write-locked.
    #[error("sync: read-unlock of write-locked rwmutex")]
    ReadUnlockOfWriteLocked,

    /// The reader count limit was exceeded.
    #[error("sync: too many concurrent readers")]
    TooManyReaders,
}
