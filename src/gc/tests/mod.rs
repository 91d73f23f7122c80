//! GC 协调单元测试
//!
//! 测试全局根注册与全停顿扫描协议

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::gc::{AddressRange, GlobalRoots, LeakingCollector, RootVisitor};
use crate::memory::{Heap, HeapConfig};
use crate::task::{self, Scheduler, SchedulerConfig, Semaphore, SchedulingModel};

/// Marker range registered as a global root so the visitor can tell
/// global scans apart from stack scans.
const GLOBAL_MARK: AddressRange = AddressRange {
    start: 0x1000,
    end: 0x2000,
};

/// Counts stack and global visits separately.
struct CountingVisitor {
    stacks: AtomicUsize,
    globals: AtomicUsize,
}

impl CountingVisitor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stacks: AtomicUsize::new(0),
            globals: AtomicUsize::new(0),
        })
    }
}

impl RootVisitor for CountingVisitor {
    fn visit_range(&self, range: AddressRange) {
        if range == GLOBAL_MARK {
            self.globals.fetch_add(1, Ordering::SeqCst);
        } else {
            // A task stack: a real, non-empty address range.
            assert!(!range.is_empty(), "empty stack range");
            self.stacks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_address_range() {
    let range = AddressRange { start: 16, end: 32 };
    assert_eq!(range.len(), 16);
    assert!(!range.is_empty());
    assert!(AddressRange { start: 8, end: 8 }.is_empty());
    assert_eq!(format!("{}", range), "0x10..0x20");
}

#[test]
fn test_global_roots_register_unregister() {
    let roots = GlobalRoots::new();
    assert!(roots.is_empty());

    roots.register(GLOBAL_MARK);
    assert_eq!(roots.len(), 1);

    assert!(roots.unregister(GLOBAL_MARK));
    assert!(!roots.unregister(GLOBAL_MARK));
    assert!(roots.is_empty());
}

#[test]
fn test_scan_covers_running_tasks_and_globals() {
    let sched = Scheduler::with_model(SchedulingModel::Threaded, SchedulerConfig::default());
    let _main = sched.adopt_current_thread();
    sched.global_roots().register(GLOBAL_MARK);

    // Workers spin on the safepoint poll until told to stop.
    let stop = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Semaphore::new());
    for _ in 0..3 {
        let stop = stop.clone();
        let started = started.clone();
        sched.start(move || {
            started.post();
            while !stop.load(Ordering::SeqCst) {
                task::safepoint();
                std::hint::spin_loop();
            }
        });
    }
    for _ in 0..3 {
        started.wait();
    }

    let visitor = CountingVisitor::new();
    sched.gc_scan(visitor.clone());

    // Three workers plus the scanner, each scanned exactly once, and the
    // global roots exactly once.
    assert_eq!(visitor.stacks.load(Ordering::SeqCst), 4);
    assert_eq!(visitor.globals.load(Ordering::SeqCst), 1);

    stop.store(true, Ordering::SeqCst);
    assert!(wait_for(|| sched.task_count() == 1));
}

#[test]
fn test_scan_reaches_tasks_blocked_in_waits() {
    let sched = Scheduler::with_model(SchedulingModel::Threaded, SchedulerConfig::default());
    let _main = sched.adopt_current_thread();
    sched.global_roots().register(GLOBAL_MARK);

    // Workers park on their pause semaphore; the stop-the-world request
    // must reach them inside the blocking wait.
    let mut ids = Vec::new();
    for _ in 0..2 {
        ids.push(sched.start(task::pause));
    }
    assert!(wait_for(|| sched.task_count() == 3));
    // Let the workers actually reach their pause.
    std::thread::sleep(Duration::from_millis(50));

    let visitor = CountingVisitor::new();
    sched.gc_scan(visitor.clone());

    assert_eq!(visitor.stacks.load(Ordering::SeqCst), 3);
    assert_eq!(visitor.globals.load(Ordering::SeqCst), 1);

    // The scan must not have consumed the pause credits: the workers are
    // still parked and resumable.
    for id in ids {
        sched.task(id).expect("worker is live").resume();
    }
    assert!(wait_for(|| sched.task_count() == 1));
}

#[test]
fn test_repeated_scans() {
    let sched = Scheduler::with_model(SchedulingModel::Threaded, SchedulerConfig::default());
    let _main = sched.adopt_current_thread();

    let stop = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Semaphore::new());
    sched.start({
        let stop = stop.clone();
        let started = started.clone();
        move || {
            started.post();
            while !stop.load(Ordering::SeqCst) {
                task::safepoint();
                std::hint::spin_loop();
            }
        }
    });
    started.wait();

    for _ in 0..5 {
        let visitor = CountingVisitor::new();
        sched.gc_scan(visitor.clone());
        assert_eq!(visitor.stacks.load(Ordering::SeqCst), 2);
    }

    stop.store(true, Ordering::SeqCst);
    assert!(wait_for(|| sched.task_count() == 1));
}

#[test]
fn test_cooperative_scan_walks_parked_extents() {
    let sched = Scheduler::with_model(SchedulingModel::Cooperative, SchedulerConfig::default());
    let main = sched.adopt_current_thread();
    sched.global_roots().register(GLOBAL_MARK);

    // A worker that parks immediately; under the cooperative model it
    // never runs concurrently with the scanner.
    sched.start({
        let main = main.clone();
        move || {
            main.resume();
            task::pause();
        }
    });

    // Yield until the worker reached its pause and handed control back.
    task::pause();
    assert!(wait_for(|| sched.task_count() == 2));

    let visitor = CountingVisitor::new();
    sched.gc_scan(visitor.clone());

    assert_eq!(visitor.stacks.load(Ordering::SeqCst), 2);
    assert_eq!(visitor.globals.load(Ordering::SeqCst), 1);
}

#[test]
fn test_leaking_collector_is_a_noop() {
    let sched = Scheduler::with_model(SchedulingModel::Threaded, SchedulerConfig::default());
    let _main = sched.adopt_current_thread();
    let heap = Arc::new(Heap::new(HeapConfig {
        initial_size: 4096,
        max_size: 65536,
    }));

    let collector = LeakingCollector::new(heap.clone(), sched);
    heap.allocate(64);
    collector.collect();

    let stats = collector.mem_stats();
    assert_eq!(stats.mallocs, 1);
    assert_eq!(stats.frees, 0);
    assert_eq!(stats.total_alloc, 64);
}
