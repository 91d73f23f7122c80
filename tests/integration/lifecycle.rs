//! 运行时生命周期集成测试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use xuanji::task::{self, Semaphore};
use xuanji::{Runtime, RuntimeConfig};

fn small_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.heap.initial_size = 64 * 1024;
    config.heap.max_size = 1024 * 1024;
    config
}

#[test]
fn test_runtime_adopts_main_task() {
    let rt = Runtime::new(small_config());
    assert_eq!(rt.main_task().id().inner(), 0);
    assert_eq!(rt.scheduler().task_count(), 1);
    assert!(Arc::ptr_eq(&task::current(), rt.main_task()));
}

#[test]
fn test_tasks_share_work() {
    let rt = Runtime::new(small_config());

    let counter = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Semaphore::new());
    for _ in 0..8 {
        let counter = counter.clone();
        let done = done.clone();
        rt.start(move || {
            for _ in 0..1000 {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            done.post();
        });
    }
    for _ in 0..8 {
        done.wait();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 8000);
}

#[test]
fn test_allocation_through_the_runtime() {
    let rt = Runtime::new(small_config());

    let ptr = rt.allocate(100);
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 100) };
    assert!(bytes.iter().all(|&b| b == 0));

    let stats = rt.mem_stats();
    assert_eq!(stats.mallocs, 1);
    assert_eq!(stats.frees, 0);
    assert!(stats.total_alloc >= 100);
}

#[test]
fn test_tasks_allocate_concurrently() {
    let rt = Runtime::new(small_config());
    let heap = rt.heap().clone();

    let done = Arc::new(Semaphore::new());
    for _ in 0..4 {
        let heap = heap.clone();
        let done = done.clone();
        rt.start(move || {
            for _ in 0..50 {
                let ptr = heap.allocate(32);
                let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 32) };
                assert!(bytes.iter().all(|&b| b == 0));
            }
            done.post();
        });
    }
    for _ in 0..4 {
        done.wait();
    }
    assert_eq!(rt.mem_stats().mallocs, 200);
}

#[test]
fn test_version_constants() {
    assert!(!xuanji::VERSION.is_empty());
    assert!(xuanji::NAME.contains("XuanJi"));
}
