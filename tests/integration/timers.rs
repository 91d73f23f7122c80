//! 定时器集成测试

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlainMutex;

use xuanji::{Runtime, RuntimeConfig};

fn small_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.heap.initial_size = 64 * 1024;
    config.heap.max_size = 1024 * 1024;
    config
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
fn test_timers_drain_in_order() {
    let rt = Runtime::new(small_config());
    let fired = Arc::new(PlainMutex::new(Vec::new()));

    for delay_ms in [50u64, 10, 30] {
        let fired = fired.clone();
        rt.timers()
            .add_timer_in(Duration::from_millis(delay_ms), move |_| {
                fired.lock().push(delay_ms);
            });
    }

    assert!(wait_for(|| fired.lock().len() == 3));
    assert_eq!(*fired.lock(), vec![10, 30, 50]);
}

#[test]
fn test_cancelled_timer_stays_silent() {
    let rt = Runtime::new(small_config());
    let fired = Arc::new(PlainMutex::new(Vec::new()));

    let keep = rt.timers().add_timer_in(Duration::from_millis(20), {
        let fired = fired.clone();
        move |_| fired.lock().push("keep")
    });
    let cancel = rt.timers().add_timer_in(Duration::from_millis(40), {
        let fired = fired.clone();
        move |_| fired.lock().push("cancel")
    });

    assert!(rt.timers().remove_timer(cancel));
    let _ = keep;

    assert!(wait_for(|| !fired.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*fired.lock(), vec!["keep"]);

    // Removing it again reports not-found without side effects.
    assert!(!rt.timers().remove_timer(cancel));
}

#[test]
fn test_timer_callbacks_run_off_the_caller() {
    let rt = Runtime::new(small_config());
    let caller = std::thread::current().id();
    let fired_on = Arc::new(PlainMutex::new(None));

    rt.timers().add_timer_in(Duration::from_millis(10), {
        let fired_on = fired_on.clone();
        move |_| {
            *fired_on.lock() = Some(std::thread::current().id());
        }
    });

    assert!(wait_for(|| fired_on.lock().is_some()));
    // The callback ran on the dedicated runner task, not the inserter.
    assert_ne!(fired_on.lock().unwrap(), caller);
}

#[test]
fn test_shutdown_silences_pending_timers() {
    let rt = Runtime::new(small_config());
    let fired = Arc::new(PlainMutex::new(false));

    rt.timers().add_timer_in(Duration::from_millis(60), {
        let fired = fired.clone();
        move |_| *fired.lock() = true
    });
    rt.shutdown();

    std::thread::sleep(Duration::from_millis(150));
    assert!(!*fired.lock());
}
