//! 异常终止传播单元测试
//!
//! 测试清理帧的注册、拦截、逐帧传播与静默退出

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::task::{self, Scheduler, SchedulerConfig, Semaphore, SchedulingModel};
use crate::unwind::{self, PanicStrategy};

fn adopt() -> Arc<Scheduler> {
    let sched = Scheduler::with_model(SchedulingModel::Threaded, SchedulerConfig::default());
    sched.adopt_current_thread();
    sched
}

#[test]
fn test_cleanup_runs_on_normal_return() {
    let _sched = adopt();
    let cleaned = RefCell::new(false);
    let result = unwind::with_frame(|| 42, || *cleaned.borrow_mut() = true);
    assert_eq!(result, Some(42));
    assert!(*cleaned.borrow());
}

#[test]
fn test_raise_is_intercepted_by_innermost_recover() {
    let _sched = adopt();
    let recovered = RefCell::new(None);

    let result = unwind::with_frame(
        || {
            unwind::raise("boom".to_string());
        },
        || {
            if let Some(value) = unwind::recover() {
                *recovered.borrow_mut() = value.downcast_ref::<String>().cloned();
            }
        },
    );

    // The body never completed; the termination was intercepted.
    assert_eq!(result, None);
    assert_eq!(recovered.borrow().as_deref(), Some("boom"));
}

#[test]
fn test_unintercepted_termination_propagates_outward() {
    let _sched = adopt();
    let order = RefCell::new(Vec::new());
    let recovered = RefCell::new(false);

    let outer: Option<()> = unwind::with_frame(
        || {
            let inner: Option<()> = unwind::with_frame(
                || unwind::raise("escalate"),
                // Inner cleanup runs but does not recover.
                || order.borrow_mut().push("inner"),
            );
            // Unreachable: the re-raise jumps past this point.
            let _ = inner;
            unreachable!("termination should have propagated");
        },
        || {
            order.borrow_mut().push("outer");
            if unwind::recover().is_some() {
                *recovered.borrow_mut() = true;
            }
        },
    );

    assert_eq!(outer, None);
    assert!(*recovered.borrow());
    // Cleanups ran innermost-first.
    assert_eq!(*order.borrow(), vec!["inner", "outer"]);
}

#[test]
fn test_middle_frame_intercepts_fully() {
    let _sched = adopt();
    let outer_saw_termination = RefCell::new(false);

    let result = unwind::with_frame(
        || {
            // Middle frame intercepts; the outer frame must observe
            // nothing at all.
            let middle: Option<()> = unwind::with_frame(
                || {
                    let _: Option<()> = unwind::with_frame(
                        || unwind::raise(7u32),
                        || {},
                    );
                    unreachable!();
                },
                || {
                    let value = unwind::recover().expect("termination in flight");
                    assert_eq!(*value.downcast_ref::<u32>().unwrap(), 7);
                },
            );
            assert_eq!(middle, None);
            "outer body continues"
        },
        || {
            if unwind::recover().is_some() {
                *outer_saw_termination.borrow_mut() = true;
            }
        },
    );

    assert_eq!(result, Some("outer body continues"));
    assert!(!*outer_saw_termination.borrow());
}

#[test]
fn test_recover_outside_unwinding_returns_none() {
    let _sched = adopt();
    let result = unwind::with_frame(
        || {
            // Nothing is unwinding yet.
            assert!(unwind::recover().is_none());
            1
        },
        || {
            assert!(unwind::recover().is_none());
        },
    );
    assert_eq!(result, Some(1));
}

#[test]
fn test_recover_without_any_frame_returns_none() {
    let _sched = adopt();
    assert!(unwind::recover().is_none());
}

#[test]
fn test_exit_task_runs_cleanups_but_resists_recovery() {
    let sched = adopt();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let recovered = Arc::new(AtomicUsize::new(0));
    let reached_end = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Semaphore::new());

    sched.start({
        let cleanups = cleanups.clone();
        let recovered = recovered.clone();
        let reached_end = reached_end.clone();
        let done = done.clone();
        move || {
            let _guard = DoneGuard(done.clone());
            let _: Option<()> = unwind::with_frame(
                || {
                    let _: Option<()> = unwind::with_frame(
                        || unwind::exit_task(),
                        || {
                            cleanups.fetch_add(1, Ordering::SeqCst);
                            // The silent-exit signal must pass through.
                            if unwind::recover().is_some() {
                                recovered.fetch_add(1, Ordering::SeqCst);
                            }
                        },
                    );
                    unreachable!();
                },
                || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                    if unwind::recover().is_some() {
                        recovered.fetch_add(1, Ordering::SeqCst);
                    }
                },
            );
            // Unreachable: the task exits out of its entry.
            reached_end.fetch_add(1, Ordering::SeqCst);
        }
    });

    done.wait();
    assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    assert_eq!(recovered.load(Ordering::SeqCst), 0);
    assert_eq!(reached_end.load(Ordering::SeqCst), 0);
}

/// Posts a semaphore when dropped, surviving the task's exit unwind.
struct DoneGuard(Arc<Semaphore>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.post();
    }
}

#[test]
fn test_foreign_panic_passes_through_cleanup_frames() {
    let _sched = adopt();
    let cleaned = Arc::new(AtomicUsize::new(0));

    let caught = std::panic::catch_unwind({
        let cleaned = cleaned.clone();
        move || {
            let _: Option<()> = unwind::with_frame(
                || panic!("plain rust panic"),
                || {
                    cleaned.fetch_add(1, Ordering::SeqCst);
                    // A foreign panic is not an interceptable
                    // termination.
                    assert!(unwind::recover().is_none());
                },
            );
        }
    });

    assert!(caught.is_err());
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
}

#[test]
fn test_raise_value_kinds() {
    let _sched = adopt();
    let seen = RefCell::new(String::new());

    unwind::with_frame(
        || unwind::raise("static str"),
        || {
            if let Some(value) = unwind::recover() {
                if let Some(text) = value.downcast_ref::<&'static str>() {
                    *seen.borrow_mut() = (*text).to_string();
                }
            }
        },
    );
    assert_eq!(*seen.borrow(), "static str");
}

#[test]
fn test_panic_strategy_default() {
    // The halt-immediately strategy is opt-in; toggling it process-wide
    // would race other tests, so only the default is checked here.
    assert_eq!(PanicStrategy::default(), PanicStrategy::Unwind);
    assert_eq!(unwind::panic_strategy(), PanicStrategy::Unwind);
}

#[test]
fn test_frames_balance_across_calls() {
    let _sched = adopt();
    let task = task::current();
    assert_eq!(task.frames().lock().depth(), 0);

    let _ = unwind::with_frame(|| (), || ());
    assert_eq!(task.frames().lock().depth(), 0);

    let _: Option<()> = unwind::with_frame(
        || {
            let _: Option<()> = unwind::with_frame(|| unwind::raise(1u8), || {});
            unreachable!();
        },
        || {
            let _ = unwind::recover();
        },
    );
    assert_eq!(task.frames().lock().depth(), 0);
}
