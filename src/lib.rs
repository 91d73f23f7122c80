//! XuanJi (璇玑) Runtime Substrate
//!
//! The low-level execution substrate of a language runtime, targeting
//! both general multithreaded hosts and resource-constrained platforms:
//!
//! - lightweight tasks, schedulable cooperatively on a single native
//!   thread or preemptively across many;
//! - synchronization primitives built on a futex-style wait/wake cell;
//! - a stop-the-world coordination protocol letting a garbage collector
//!   scan every live task's stack consistently;
//! - a timer queue feeding time-based wakeups;
//! - a per-task abnormal-termination protocol (deferred cleanup,
//!   unwinding, recovery);
//! - a bump allocator for environments where a reclaiming collector is
//!   unnecessary or too costly.
//!
//! # Example
//!
//! ```no_run
//! use xuanji::Runtime;
//!
//! let rt = Runtime::with_defaults();
//! rt.start(|| {
//!     tracing::info!("hello from a task");
//! });
//! ```
//!
//! # Crate Features
//!
//! - `cooperative`: select the cooperative scheduling model and the
//!   queue-based synchronization backend for this artifact

#![doc(html_root_url = "https://docs.rs/xuanji")]
#![warn(rust_2018_idioms)]
#![allow(dead_code)]

// Public modules
pub mod gc;
pub mod memory;
pub mod sync;
pub mod task;
pub mod timer;
pub mod unwind;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use util::config::RuntimeConfig;

use std::ptr::NonNull;
use std::sync::Arc;

use gc::RootVisitor;
use memory::{Heap, MemStats};
use task::{Scheduler, Task, TaskId};
use timer::{MonotonicTicks, TimerQueue};

/// Substrate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Substrate name
pub const NAME: &str = "XuanJi (璇玑)";

/// An assembled runtime substrate: scheduler, heap and timer queue.
///
/// Creating a runtime adopts the calling thread as the main task, which
/// stays live for the lifetime of the runtime without an explicit start
/// call.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    sched: Arc<Scheduler>,
    heap: Arc<Heap>,
    timers: Arc<TimerQueue>,
    main: Arc<Task>,
}

impl Runtime {
    /// Assemble a runtime from a configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        unwind::install_panic_hook();
        unwind::set_panic_strategy(config.panic.strategy);
        let sched = Scheduler::new(config.scheduler_config());
        let main = sched.adopt_current_thread();
        let heap = Arc::new(Heap::new(config.heap_config()));
        let timers = TimerQueue::new(sched.clone(), Arc::new(MonotonicTicks::new()));
        tracing::debug!(version = VERSION, "runtime ready");
        Self {
            config,
            sched,
            heap,
            timers,
            main,
        }
    }

    /// Assemble a runtime with the default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RuntimeConfig::default())
    }

    /// The runtime's configuration.
    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The task scheduler.
    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// The heap region.
    #[inline]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The timer queue.
    #[inline]
    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    /// The main task adopted at startup.
    #[inline]
    pub fn main_task(&self) -> &Arc<Task> {
        &self.main
    }

    /// Start a new task running `entry`.
    pub fn start<F>(&self, entry: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.start(entry)
    }

    /// Run a full stop-the-world scan, handing every live stack range and
    /// registered global root range to `visitor`.
    pub fn gc_scan(&self, visitor: Arc<dyn RootVisitor>) {
        self.sched.gc_scan(visitor);
    }

    /// Allocate zero-filled memory from the bump heap.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.heap.allocate(size)
    }

    /// Memory statistics snapshot.
    pub fn mem_stats(&self) -> MemStats {
        self.heap.stats()
    }

    /// Stop background machinery (the timer runner).
    pub fn shutdown(&self) {
        self.timers.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
        task::unbind_current_if(&self.main);
    }
}
