//! Timer queue.
//!
//! Pending timers form a single globally ordered list (ascending expiry)
//! guarded by a lock, plus a futex used purely as a wake signal whose
//! value counts insertions. One dedicated runner task pops expired timers
//! and invokes their callbacks; inserting a sooner timer bumps the futex
//! so the runner re-evaluates even mid-wait.


use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::task::{Futex, PMutex, Scheduler};

/// Source of the tick count timers expire against.
///
/// The default is the host's monotonic clock at nanosecond resolution;
/// embedded targets substitute their hardware tick counter.
pub trait TickSource: Send + Sync {
    /// Current tick count.
    fn ticks(&self) -> u64;

    /// Convert a tick delta to a wall duration.
    fn ticks_to_duration(&self, ticks: u64) -> Duration;

    /// Convert a wall duration to a tick delta.
    fn duration_to_ticks(&self, duration: Duration) -> u64;
}

/// Monotonic clock ticking in nanoseconds since creation.
#[derive(Debug)]
pub struct MonotonicTicks {
    origin: Instant,
}

impl MonotonicTicks {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    fn ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn ticks_to_duration(&self, ticks: u64) -> Duration {
        Duration::from_nanos(ticks)
    }

    fn duration_to_ticks(&self, duration: Duration) -> u64 {
        duration.as_nanos() as u64
    }
}

/// Identity of a scheduled timer, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Callback invoked when a timer fires; receives the overshoot past the
/// requested deadline.
pub type TimerCallback = Box<dyn FnOnce(Duration) + Send>;

struct TimerNode {
    id: TimerId,
    /// Expiry tick count.
    when: u64,
    callback: TimerCallback,
}

impl fmt::Debug for TimerNode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TimerNode")
            .field("id", &self.id)
            .field("when", &self.when)
            .finish()
    }
}

/// Pending timers, maintained in strictly ascending expiry order.
#[derive(Debug, Default)]
struct TimerList {
    nodes: Vec<TimerNode>,
}

impl TimerList {
    /// Insert in sorted position; linear scan under the queue lock.
    fn add(&mut self, node: TimerNode) {
        let pos = self
            .nodes
            .iter()
            .position(|n| node.when < n.when)
            .unwrap_or(self.nodes.len());
        self.nodes.insert(pos, node);
    }

    /// Search-and-unlink by identity.
    fn remove(&mut self, id: TimerId) -> bool {
        match self.nodes.iter().position(|n| n.id == id) {
            Some(pos) => {
                self.nodes.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// The timer queue and its runner task.
pub struct TimerQueue {
    sched: Arc<Scheduler>,
    clock: Arc<dyn TickSource>,
    queue: PMutex<TimerList>,
    /// Wake signal for the runner; the value counts insertions.
    futex: Futex,
    /// The runner task is started lazily on first use.
    started: AtomicBool,
    running: AtomicBool,
    next_id: AtomicU64,
    weak: Weak<TimerQueue>,
}

impl TimerQueue {
    pub fn new(sched: Arc<Scheduler>, clock: Arc<dyn TickSource>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sched,
            clock,
            queue: PMutex::new(TimerList::default()),
            futex: Futex::new(),
            started: AtomicBool::new(false),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            weak: weak.clone(),
        })
    }

    /// The queue's tick source.
    #[inline]
    pub fn clock(&self) -> &Arc<dyn TickSource> {
        &self.clock
    }

    /// Schedule `callback` to run at tick `when`. Starts the runner task
    /// on first use.
    pub fn add_timer_at<F>(&self, when: u64, callback: F) -> TimerId
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut queue = self.queue.lock();

        if !self.started.swap(true, Ordering::SeqCst) {
            let this = self.weak.upgrade().expect("timer queue is alive during insert");
            self.sched.start(move || this.run());
        }

        queue.add(TimerNode {
            id,
            when,
            callback: Box::new(callback),
        });
        trace!(id = ?id, when, "timer added");

        // Exit the runner's wait early so it re-evaluates the head.
        self.futex.add(1);
        self.futex.wake(1);

        id
    }

    /// Schedule `callback` to run after `delay`.
    pub fn add_timer_in<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let when = self
            .clock
            .ticks()
            .saturating_add(self.clock.duration_to_ticks(delay));
        self.add_timer_at(when, callback)
    }

    /// Cancel a scheduled timer. Returns false when the timer was not
    /// found, an expected outcome if it already fired.
    pub fn remove_timer(&self, id: TimerId) -> bool {
        let removed = self.queue.lock().remove(id);
        if removed {
            trace!(id = ?id, "timer removed");
        } else {
            debug!(id = ?id, "timer not found");
        }
        removed
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.queue.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the runner task once its current wait finishes.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.futex.add(1);
        self.futex.wake_all();
    }

    /// Runner task: blocks until the nearest deadline elapses or a new,
    /// sooner timer is inserted.
    fn run(self: Arc<Self>) {
        debug!("timer runner started");
        while self.running.load(Ordering::SeqCst) {
            let queue = self.queue.lock();

            if queue.nodes.is_empty() {
                // Wait until a timer becomes available.
                let val = self.futex.load();
                drop(queue);
                self.sched.block_on(&self.futex, val, None);
                continue;
            }

            let now = self.clock.ticks();
            let head_when = queue.nodes[0].when;
            if now < head_when {
                // A timer exists but has not expired; bounded wait so an
                // insertion of a sooner timer can interrupt it.
                let val = self.futex.load();
                drop(queue);
                let timeout = self.clock.ticks_to_duration(head_when - now);
                self.sched.block_on(&self.futex, val, Some(timeout));
                continue;
            }

            // Pop the expired head, then run the callback outside the
            // lock.
            let mut queue = queue;
            let node = queue.nodes.remove(0);
            drop(queue);

            let overshoot = self.clock.ticks_to_duration(now - node.when);
            trace!(id = ?node.id, "timer fired");
            (node.callback)(overshoot);
        }
        debug!("timer runner stopped");
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}
