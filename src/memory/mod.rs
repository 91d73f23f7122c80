//! Heap region and bump allocator.
//!
//! The simplest useful memory allocator possible: it only allocates
//! memory and never frees it. Allocation advances a single atomic pointer
//! through a contiguous region; the committed end of the region grows on
//! demand through an injectable policy and the region start never moves,
//! so handed-out ranges stay valid forever.


use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::unwind;

/// Allocation granularity; every size is rounded up to a multiple.
pub const HEAP_ALIGN: usize = 16;

/// Memory allocation error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The heap cannot grow enough to satisfy the allocation.
    #[error("out of memory: {requested} bytes requested")]
    OutOfMemory {
        /// Rounded-up size of the failed request.
        requested: usize,
    },
}

/// Heap configuration.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Committed size at startup.
    pub initial_size: usize,
    /// Reserved capacity the heap may grow into.
    pub max_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_size: 16 * 1024 * 1024,
            max_size: 256 * 1024 * 1024,
        }
    }
}

/// Memory statistics snapshot.
///
/// Up to date as of the call; reading does not trigger a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemStats {
    /// Cumulative bytes allocated.
    pub total_alloc: u64,
    /// Number of allocations.
    pub mallocs: u64,
    /// Number of frees; always 0 for the allocate-only variant.
    pub frees: u64,
    /// Bytes currently in use. With no frees this equals total_alloc.
    pub heap_alloc: u64,
    /// Committed span of the heap region.
    pub sys: u64,
}

/// The "grow the heap region" collaborator: given the current committed
/// end, the offset the failed allocation needs, and the reserved
/// capacity, return the new committed end or None when growth is
/// impossible.
pub type GrowPolicy = Box<dyn Fn(usize, usize, usize) -> Option<usize> + Send + Sync>;

/// Default policy: double the committed end (at least to the needed
/// offset) within the reserved capacity.
fn default_grow(end: usize, needed: usize, capacity: usize) -> Option<usize> {
    if needed > capacity {
        return None;
    }
    Some((end * 2).max(needed).min(capacity))
}

/// A contiguous heap region with a monotonically advancing free pointer.
pub struct Heap {
    /// Region start; never moves.
    base: NonNull<u8>,
    /// Reserved capacity in bytes.
    capacity: usize,
    /// Offset of the next free byte. Updated only by atomic add; no lock.
    next: AtomicUsize,
    /// Committed end offset; grows, never shrinks.
    end: AtomicUsize,
    grow: GrowPolicy,
    /// Cumulative statistics. Tracked separately, so a snapshot may be
    /// slightly inconsistent with a concurrent allocation.
    total_alloc: AtomicU64,
    mallocs: AtomicU64,
}

// Safety: allocation hands out disjoint ranges; all shared book-keeping
// is atomic.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Create a heap with the default growth policy.
    pub fn new(config: HeapConfig) -> Self {
        Self::with_grow_policy(config, Box::new(default_grow))
    }

    /// Create a heap with a custom growth policy.
    pub fn with_grow_policy(config: HeapConfig, grow: GrowPolicy) -> Self {
        let capacity = config.max_size.max(HEAP_ALIGN);
        let initial = config.initial_size.min(capacity);
        let layout = Layout::from_size_align(capacity, HEAP_ALIGN)
            .expect("heap capacity overflows a layout");
        // Safety: layout has non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let base = match NonNull::new(base) {
            Some(base) => base,
            None => unwind::runtime_fatal("could not reserve the heap region"),
        };
        debug!(capacity, initial, "heap region reserved");
        Self {
            base,
            capacity,
            next: AtomicUsize::new(0),
            end: AtomicUsize::new(initial),
            grow,
            total_alloc: AtomicU64::new(0),
            mallocs: AtomicU64::new(0),
        }
    }

    /// Allocate `size` bytes, zero-filled. Out of memory is fatal.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        match self.try_allocate(size) {
            Ok(ptr) => ptr,
            Err(err) => unwind::runtime_fatal(&err.to_string()),
        }
    }

    /// Allocate `size` bytes, zero-filled, reporting failure instead of
    /// halting.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = align_up(size.max(1));

        self.total_alloc.fetch_add(size as u64, Ordering::SeqCst);
        self.mallocs.fetch_add(1, Ordering::SeqCst);

        let next = self.next.fetch_add(size, Ordering::SeqCst) + size;
        while next > self.end.load(Ordering::SeqCst) {
            // Try to grow the committed region and check again.
            if !self.grow_heap(next) {
                return Err(AllocError::OutOfMemory { requested: size });
            }
        }
        let offset = next - size;

        // Safety: [offset, offset + size) is within the reserved region
        // and handed out exactly once.
        unsafe {
            let ptr = self.base.as_ptr().add(offset);
            ptr::write_bytes(ptr, 0, size);
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    /// Allocate fresh space and copy the old contents forward. Bytes
    /// beyond the previous allocation's size are unspecified, matching
    /// the platform convention for growing a buffer.
    pub fn reallocate(&self, old: NonNull<u8>, size: usize) -> NonNull<u8> {
        let new = self.allocate(size);

        let old_offset = old.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert!(old_offset < self.capacity, "realloc of a foreign pointer");
        // Clamp the copy so the read stays inside the committed region.
        let available = self.end.load(Ordering::SeqCst).saturating_sub(old_offset);
        let count = size.min(available);

        // Safety: both ranges lie inside the region, and the fresh range
        // cannot overlap an earlier allocation.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), count);
        }
        new
    }

    /// Free memory. Memory is never freed in this variant.
    pub fn free(&self, _ptr: NonNull<u8>) {}

    /// Statistics snapshot.
    pub fn stats(&self) -> MemStats {
        let total_alloc = self.total_alloc.load(Ordering::SeqCst);
        MemStats {
            total_alloc,
            mallocs: self.mallocs.load(Ordering::SeqCst),
            frees: 0,
            heap_alloc: total_alloc,
            sys: self.end.load(Ordering::SeqCst) as u64,
        }
    }

    /// Offset of the next free byte; monotonically non-decreasing.
    pub fn used(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }

    /// Committed end offset.
    pub fn committed(&self) -> usize {
        self.end.load(Ordering::SeqCst)
    }

    /// Reserved capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ask the growth policy for a larger committed end covering
    /// `needed`. Returns false when the heap cannot grow.
    fn grow_heap(&self, needed: usize) -> bool {
        let end = self.end.load(Ordering::SeqCst);
        match (self.grow)(end, needed, self.capacity) {
            Some(new_end) if new_end >= needed && new_end <= self.capacity => {
                // Concurrent growers race; keep the largest end.
                self.end.fetch_max(new_end, Ordering::SeqCst);
                debug!(end = new_end, "heap region grown");
                true
            }
            _ => false,
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, HEAP_ALIGN)
            .expect("heap capacity overflows a layout");
        // Safety: base was allocated with this layout in the constructor.
        unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
    }
}

impl fmt::Debug for Heap {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Heap")
            .field("used", &self.used())
            .field("committed", &self.committed())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Round `size` up to the allocation granularity.
#[inline]
fn align_up(size: usize) -> usize {
    (size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}
