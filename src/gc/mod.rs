//! Garbage collection hooks.
//!
//! The substrate does not mark or reclaim anything itself: it stops the
//! world, hands every live stack range and every registered global root
//! range to a caller-supplied visitor, and resumes. The allocate-only
//! collector pairs that hand-off with the bump allocator for systems
//! where reclamation is unnecessary or too costly.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::memory::{Heap, MemStats};
use crate::task::Scheduler;

/// A half-open range of addresses to scan for object references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: usize,
    pub end: usize,
}

impl AddressRange {
    /// Length of the range in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for AddressRange {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end)
    }
}

/// The "scan these memory ranges for object references" collaborator.
///
/// Invoked once per live task stack and once per registered global root
/// range during a stop-the-world scan. Implementations must not block on
/// runtime primitives: the world is stopped while they run.
pub trait RootVisitor: Send + Sync {
    fn visit_range(&self, range: AddressRange);
}

/// Registered global root ranges, scanned inside every stop-the-world
/// phase after all stacks and before any task resumes.
pub struct GlobalRoots {
    ranges: RwLock<Vec<AddressRange>>,
}

impl GlobalRoots {
    pub fn new() -> Self {
        Self {
            ranges: RwLock::new(Vec::new()),
        }
    }

    /// Register a range of memory holding global roots.
    pub fn register(&self, range: AddressRange) {
        self.ranges.write().push(range);
    }

    /// Remove a previously registered range. Returns false if the range
    /// was not registered.
    pub fn unregister(&self, range: AddressRange) -> bool {
        let mut ranges = self.ranges.write();
        match ranges.iter().position(|r| *r == range) {
            Some(pos) => {
                ranges.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of registered ranges.
    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }

    pub(crate) fn scan(&self, visitor: &dyn RootVisitor) {
        for range in self.ranges.read().iter() {
            visitor.visit_range(*range);
        }
    }
}

impl Default for GlobalRoots {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GlobalRoots {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("GlobalRoots")
            .field("ranges", &*self.ranges.read())
            .finish()
    }
}

/// The allocate-only collector: memory is only ever allocated, never
/// freed. For some constrained systems this is the only collector
/// possible.
#[derive(Debug)]
pub struct LeakingCollector {
    heap: Arc<Heap>,
    sched: Arc<Scheduler>,
}

impl LeakingCollector {
    pub fn new(heap: Arc<Heap>, sched: Arc<Scheduler>) -> Self {
        Self { heap, sched }
    }

    /// Collect garbage. A no-op for this variant.
    pub fn collect(&self) {}

    /// Run a full stop-the-world scan, handing every live stack range and
    /// global root range to `visitor`.
    pub fn scan_roots(&self, visitor: Arc<dyn RootVisitor>) {
        self.sched.gc_scan(visitor);
    }

    /// Memory statistics snapshot. Frees stay zero for this variant.
    pub fn mem_stats(&self) -> MemStats {
        self.heap.stats()
    }
}
