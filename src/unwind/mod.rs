//! Abnormal-termination propagation.
//!
//! Each task carries a stack of deferred-cleanup frames mirroring the
//! call frames that registered cleanup. Raising a termination stores an
//! opaque value in the innermost frame and jumps to its cleanup block;
//! when a cleanup block finishes without intercepting, the termination is
//! re-raised against the next frame outward. Unwinding past the
//! outermost frame prints the value and halts the process.
//!
//! The jump is expressed with `panic_any` of a private zero-sized token
//! caught at each frame boundary; the termination value and the tri-state
//! flag live in the task's frame stack, never in the panic payload.
//! Foreign Rust panics pass through cleanup frames untouched.

#[cfg(test)]
mod tests;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Once;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::error;

use crate::task;

/// The opaque value carried by an in-flight termination.
pub type TerminationValue = Box<dyn Any + Send + 'static>;

/// What to do when a termination is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanicStrategy {
    /// Unwind through the cleanup frames, halting only past the top.
    #[default]
    Unwind,
    /// Halt immediately, running no cleanup at all.
    Halt,
}

static PANIC_STRATEGY: AtomicU8 = AtomicU8::new(0);

/// Select the process-wide strategy for raised terminations.
pub fn set_panic_strategy(strategy: PanicStrategy) {
    let val = match strategy {
        PanicStrategy::Unwind => 0,
        PanicStrategy::Halt => 1,
    };
    PANIC_STRATEGY.store(val, Ordering::SeqCst);
}

/// The currently selected strategy.
pub fn panic_strategy() -> PanicStrategy {
    match PANIC_STRATEGY.load(Ordering::SeqCst) {
        1 => PanicStrategy::Halt,
        _ => PanicStrategy::Unwind,
    }
}

/// Zero-sized token unwinding to the innermost cleanup frame.
struct UnwindSignal;

/// Token unwinding a task cleanly out of its entry function.
pub(crate) struct TaskExit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Not terminating.
    Normal,
    /// An interceptable termination is in flight.
    Unwinding,
    /// The task is exiting without unwinding; cleanups run but recovery
    /// must let it pass through.
    Exiting,
}

/// One deferred-cleanup frame.
pub(crate) struct Frame {
    state: FrameState,
    value: Option<TerminationValue>,
}

/// Per-task stack of cleanup frames, innermost last.
pub(crate) struct FrameStack {
    frames: SmallVec<[Frame; 4]>,
}

impl FrameStack {
    pub(crate) fn new() -> Self {
        Self {
            frames: SmallVec::new(),
        }
    }

    fn push_normal(&mut self) {
        self.frames.push(Frame {
            state: FrameState::Normal,
            value: None,
        });
    }

    fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    fn innermost_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Number of active frames; used by tests and diagnostics.
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Raise an abnormal termination carrying `value`.
///
/// Control resumes in the innermost registered cleanup block; if no frame
/// is active the value is printed and the process halts. Under the
/// halt-immediately strategy no unwinding happens at all.
pub fn raise<V: Any + Send + 'static>(value: V) -> ! {
    raise_inner(Some(Box::new(value)), FrameState::Unwinding)
}

/// Terminate the current task, running its cleanup frames but bypassing
/// recovery. No other task is affected.
pub fn exit_task() -> ! {
    raise_inner(None, FrameState::Exiting)
}

fn raise_inner(value: Option<TerminationValue>, state: FrameState) -> ! {
    if panic_strategy() == PanicStrategy::Halt {
        halt_with(value);
    }

    let task = task::current();
    {
        let mut frames = task.frames().lock();
        if let Some(frame) = frames.innermost_mut() {
            frame.state = state;
            frame.value = value;
            drop(frames);
            // Jump to the innermost frame's cleanup block.
            panic::panic_any(UnwindSignal);
        }
    }

    // Unwound past the top without a handler.
    match state {
        FrameState::Exiting => exit_current_task(),
        _ => halt_with(value),
    }
}

/// Run `body` with a registered cleanup frame; `cleanup` runs on both the
/// normal and the abnormal path, like a deferred call.
///
/// Returns `Some` with the body's value on a normal return and `None`
/// when an in-flight termination was intercepted inside `cleanup`.
/// An unintercepted termination keeps propagating outward.
pub fn with_frame<R, F, C>(body: F, cleanup: C) -> Option<R>
where
    F: FnOnce() -> R,
    C: FnOnce(),
{
    let task = task::current();
    task.frames().lock().push_normal();

    let body_result = panic::catch_unwind(AssertUnwindSafe(body));
    // The cleanup block itself may raise or recover; its frame is still
    // the innermost one while it runs.
    let cleanup_result = panic::catch_unwind(AssertUnwindSafe(cleanup));

    let frame = match task.frames().lock().pop() {
        Some(frame) => frame,
        None => runtime_fatal("cleanup frame stack corrupted"),
    };

    if let Err(payload) = cleanup_result {
        if !payload.is::<UnwindSignal>() {
            // A foreign Rust panic from the cleanup block.
            panic::resume_unwind(payload);
        }
    }

    match frame.state {
        FrameState::Normal => match body_result {
            Ok(value) => Some(value),
            Err(payload) if payload.is::<UnwindSignal>() => {
                // The termination was intercepted by recover().
                None
            }
            // Foreign Rust panic: pass through, cleanup has already run.
            Err(payload) => panic::resume_unwind(payload),
        },
        FrameState::Unwinding | FrameState::Exiting => repropagate(frame),
    }
}

/// Re-raise a termination that survived its frame's cleanup against the
/// next frame outward.
fn repropagate(frame: Frame) -> ! {
    let task = task::current();
    {
        let mut frames = task.frames().lock();
        if let Some(outer) = frames.innermost_mut() {
            outer.state = frame.state;
            outer.value = frame.value;
            drop(frames);
            panic::panic_any(UnwindSignal);
        }
    }
    match frame.state {
        FrameState::Exiting => exit_current_task(),
        _ => halt_with(frame.value),
    }
}

/// Intercept the termination currently unwinding through the calling
/// frame's cleanup block.
///
/// Returns the stored value and stops further propagation. Returns None
/// when nothing is unwinding. The exiting-without-unwind signal also
/// yields None: it must pass through unintercepted.
pub fn recover() -> Option<TerminationValue> {
    let task = task::try_current()?;
    let mut frames = task.frames().lock();
    let frame = frames.innermost_mut()?;
    match frame.state {
        FrameState::Unwinding => {
            frame.state = FrameState::Normal;
            frame.value.take()
        }
        _ => None,
    }
}

/// Terminate the current task silently.
///
/// A spawned task unwinds out of its entry; an adopted task has no entry
/// to unwind out of and parks forever, mirroring the original deadlock
/// behavior.
fn exit_current_task() -> ! {
    let task = task::current();
    if task.is_spawned() {
        panic::panic_any(TaskExit);
    }
    loop {
        task::pause();
    }
}

/// Unrecoverable runtime error: write the diagnostic and halt the
/// process. Never unwinds.
pub fn runtime_fatal(msg: &str) -> ! {
    error!("fatal runtime error: {msg}");
    eprintln!("fatal runtime error: {msg}");
    process::abort();
}

fn halt_with(value: Option<TerminationValue>) -> ! {
    let text = match &value {
        Some(value) => payload_text(value.as_ref()),
        None => "task exit".to_string(),
    };
    error!("panic: {text}");
    eprintln!("panic: {text}");
    process::abort();
}

/// Best-effort rendering of an opaque termination or panic payload.
pub(crate) fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else if let Some(err) = payload.downcast_ref::<crate::sync::SyncError>() {
        err.to_string()
    } else {
        "<opaque termination value>".to_string()
    }
}

/// Silence the default panic printer for the internal unwind tokens.
/// Installed once, at runtime startup.
pub(crate) fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            if payload.is::<UnwindSignal>() || payload.is::<TaskExit>() {
                return;
            }
            previous(info);
        }));
    });
}
