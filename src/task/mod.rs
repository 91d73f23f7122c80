//! Tasks and the task scheduler.
//!
//! A task is a lightweight, independently schedulable unit of execution.
//! Under the threaded model every task is permanently bound to one native
//! thread and the OS interleaves them; under the cooperative model tasks
//! are serialized by a run token so that exactly one executes at a time
//! and control changes hands only at blocking calls.
//!
//! The scheduler also hosts the stop-the-world scan protocol: suspending
//! every task but the caller, scanning each stack exactly once while the
//! world is stopped, and resuming them only after the global roots have
//! been scanned.

pub mod futex;
pub mod pmutex;
pub mod semaphore;

#[cfg(test)]
mod tests;

pub use futex::Futex;
pub use pmutex::{PMutex, PMutexGuard};
pub use semaphore::Semaphore;

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::gc::{AddressRange, GlobalRoots, RootVisitor};
use crate::unwind::{self, FrameStack, TaskExit};

use futex::WaitSlot;

/// Unique task identifier.
///
/// The number itself is not significant and wraps at capacity exhaustion;
/// uniqueness is advisory and used for debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Scheduling model materialized for a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingModel {
    /// Every task runs on its own native thread, preemptively scheduled
    /// by the OS.
    Threaded,
    /// Exactly one task runs at a time; a task yields only at blocking
    /// calls.
    Cooperative,
}

#[cfg(not(feature = "cooperative"))]
const DEFAULT_MODEL: SchedulingModel = SchedulingModel::Threaded;
#[cfg(feature = "cooperative")]
const DEFAULT_MODEL: SchedulingModel = SchedulingModel::Cooperative;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Stack size for spawned tasks.
    pub stack_size: usize,
    /// Prefix for native thread names.
    pub name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stack_size: 2 * 1024 * 1024,
            name_prefix: "xuanji-task".to_string(),
        }
    }
}

/// One schedulable unit of execution.
pub struct Task {
    /// Identifier, monotonically assigned.
    id: TaskId,
    /// Native thread handle, present once the hosting thread runs.
    thread: Mutex<Option<thread::Thread>>,
    /// Semaphore pairing pause() with resume(). A resume credit may
    /// arrive before the matching pause and must not be lost.
    pause_sem: Semaphore,
    /// Two-phase GC rendezvous semaphore: posted once to admit scanning,
    /// once to release the task afterwards. Separate from pause_sem
    /// because the task may be paused for unrelated reasons.
    gc_sem: Semaphore,
    /// A stop-the-world pause has been requested and not yet honored.
    gc_pending: AtomicBool,
    /// The task is inside its scan rendezvous; suppresses nested
    /// safepoint handling.
    in_gc_pause: AtomicBool,
    /// The wait slot this task is currently parked on, if any, so a
    /// stop-the-world request can wake it out of a blocking wait.
    wait_slot: Mutex<Option<Arc<WaitSlot>>>,
    /// Highest stack address, probed when the hosting thread starts.
    stack_top: AtomicUsize,
    /// Stack probe taken at the most recent yield point.
    last_sp: AtomicUsize,
    /// Deferred-cleanup frames, innermost last. Mutated only by the
    /// task's own call frames.
    frames: Mutex<FrameStack>,
    /// False for the main task adopted at startup.
    spawned: bool,
    sched: Weak<Scheduler>,
}

impl Task {
    fn new(id: TaskId, spawned: bool, sched: Weak<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            id,
            thread: Mutex::new(None),
            pause_sem: Semaphore::new(),
            gc_sem: Semaphore::new(),
            gc_pending: AtomicBool::new(false),
            in_gc_pause: AtomicBool::new(false),
            wait_slot: Mutex::new(None),
            stack_top: AtomicUsize::new(0),
            last_sp: AtomicUsize::new(0),
            frames: Mutex::new(FrameStack::new()),
            spawned,
            sched,
        })
    }

    /// The task's identifier.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Resume the task.
    ///
    /// Legal before the task reaches its pause: the credit accumulates
    /// and the next pause() returns immediately. Under the cooperative
    /// model the resumed task re-enters the run queue by contending for
    /// the run token.
    pub fn resume(&self) {
        trace!(task = %self.id, "resume");
        self.pause_sem.post();
    }

    #[inline]
    pub(crate) fn frames(&self) -> &Mutex<FrameStack> {
        &self.frames
    }

    #[inline]
    pub(crate) fn is_spawned(&self) -> bool {
        self.spawned
    }

    /// Request a stop-the-world pause: set the pending flag and wake the
    /// task out of a blocking wait if it is parked in one. A running task
    /// honors the flag at its next safepoint instead.
    fn request_gc_pause(&self) {
        self.gc_pending.store(true, Ordering::SeqCst);
        if let Some(slot) = self.wait_slot.lock().as_ref() {
            slot.wake();
        }
    }

    fn record_sp(&self) {
        self.last_sp.store(stack_probe(), Ordering::SeqCst);
    }

    /// Scannable stack range from `sp` up to the recorded stack top.
    fn stack_range_from(&self, sp: usize) -> AddressRange {
        let top = self.stack_top.load(Ordering::SeqCst);
        AddressRange {
            start: sp.min(top),
            end: sp.max(top),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("spawned", &self.spawned)
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Return the task bound to the calling native thread.
///
/// Every thread that touches the runtime must be a task; an unbound
/// caller is an invariant violation and fatal.
pub fn current() -> Arc<Task> {
    match try_current() {
        Some(task) => task,
        None => unwind::runtime_fatal("unknown current task"),
    }
}

/// Like [`current`], but returns None on an unbound thread.
pub fn try_current() -> Option<Arc<Task>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Pause the current task until another task resumes it.
///
/// If a resume credit is already outstanding the call returns
/// immediately.
pub fn pause() {
    let task = current();
    trace!(task = %task.id, "pause");
    task.record_sp();
    let sched = task.sched.upgrade();
    let cooperative = matches!(
        sched.as_deref().map(|s| s.model),
        Some(SchedulingModel::Cooperative)
    );
    if cooperative {
        sched.as_deref().unwrap().run_token.post();
    }
    task.pause_sem.wait();
    if cooperative {
        sched.as_deref().unwrap().run_token.wait();
    }
}

/// Pause the current task for at least `duration`.
///
/// Sleeps on a private futex so the wait stays interruptible by a
/// stop-the-world request; the loop re-checks the deadline after every
/// wakeup.
pub fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let deadline = Instant::now() + duration;
    let futex = Futex::new();
    let sched = try_current().and_then(|t| t.sched.upgrade());
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        match &sched {
            Some(sched) => sched.block_on(&futex, 0, Some(deadline - now)),
            None => futex.wait_until(0, deadline - now),
        }
    }
}

/// Voluntarily yield the processor.
///
/// Under the cooperative model the run token is released and re-acquired
/// so another runnable task may take over. Under the threaded model the
/// OS scheduler already interleaves tasks and there is nothing useful to
/// do.
pub fn yield_now() {
    let task = current();
    let Some(sched) = task.sched.upgrade() else {
        return;
    };
    if sched.model == SchedulingModel::Cooperative {
        task.record_sp();
        sched.run_token.post();
        thread::yield_now();
        sched.run_token.wait();
    }
}

/// Poll for a pending stop-the-world pause and, if one is requested,
/// perform the scan rendezvous before returning.
///
/// Every blocking point in the substrate polls implicitly; long-running
/// task code is expected to be instrumented with explicit polls.
pub fn safepoint() {
    let Some(task) = try_current() else {
        return;
    };
    if task.in_gc_pause.load(Ordering::SeqCst) {
        return;
    }
    if !task.gc_pending.swap(false, Ordering::SeqCst) {
        return;
    }
    let Some(sched) = task.sched.upgrade() else {
        return;
    };
    task.in_gc_pause.store(true, Ordering::SeqCst);
    sched.gc_pause(&task);
    task.in_gc_pause.store(false, Ordering::SeqCst);
}

/// Register the slot the current task is about to park on. Returns false
/// on an unbound thread.
pub(crate) fn register_wait_slot(slot: &Arc<WaitSlot>) -> bool {
    match try_current() {
        Some(task) => {
            task.record_sp();
            *task.wait_slot.lock() = Some(slot.clone());
            true
        }
        None => false,
    }
}

pub(crate) fn clear_wait_slot() {
    if let Some(task) = try_current() {
        *task.wait_slot.lock() = None;
    }
}

pub(crate) fn current_gc_pending() -> bool {
    try_current().map_or(false, |task| task.gc_pending.load(Ordering::SeqCst))
}

/// Unbind the calling thread from `task` if it is the one bound. Used
/// when a runtime is torn down on its founding thread.
pub(crate) fn unbind_current_if(task: &Arc<Task>) {
    CURRENT.with(|c| {
        let mut current = c.borrow_mut();
        if current.as_ref().is_some_and(|t| Arc::ptr_eq(t, task)) {
            *current = None;
        }
    });
}

/// An entry in the task arena's intrusive live list.
struct LiveEntry {
    task: Arc<Task>,
    next: Option<usize>,
}

/// Arena of live tasks. The live list is index-linked through the arena
/// slots; a task is in the list if and only if it has started and has not
/// yet exited.
struct TaskArena {
    slots: Vec<Option<LiveEntry>>,
    free: Vec<usize>,
    head: Option<usize>,
    len: usize,
}

impl TaskArena {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            len: 0,
        }
    }

    fn insert(&mut self, task: Arc<Task>) {
        let entry = LiveEntry {
            task,
            next: self.head,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(entry);
                index
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.head = Some(index);
        self.len += 1;
    }

    /// Unlink a task by identity. Linear scan along the live list.
    fn remove(&mut self, task: &Arc<Task>) -> bool {
        let mut link = self.head;
        let mut prev: Option<usize> = None;
        while let Some(index) = link {
            let (found, next) = {
                let entry = self.slots[index]
                    .as_ref()
                    .expect("live list points at an empty slot");
                (Arc::ptr_eq(&entry.task, task), entry.next)
            };
            if found {
                match prev {
                    Some(prev_index) => {
                        self.slots[prev_index]
                            .as_mut()
                            .expect("live list points at an empty slot")
                            .next = next;
                    }
                    None => self.head = next,
                }
                self.slots[index] = None;
                self.free.push(index);
                self.len -= 1;
                return true;
            }
            prev = Some(index);
            link = next;
        }
        false
    }

    fn iter(&self) -> TaskIter<'_> {
        TaskIter {
            arena: self,
            cursor: self.head,
        }
    }
}

struct TaskIter<'a> {
    arena: &'a TaskArena,
    cursor: Option<usize>,
}

impl<'a> Iterator for TaskIter<'a> {
    type Item = &'a Arc<Task>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let entry = self.arena.slots[index]
            .as_ref()
            .expect("live list points at an empty slot");
        self.cursor = entry.next;
        Some(&entry.task)
    }
}

/// Task registry and scheduler.
///
/// Creates tasks, removes them on exit and provides the pause/resume
/// primitives every higher-level blocking operation is built on. Also
/// drives the stop-the-world scan protocol.
pub struct Scheduler {
    model: SchedulingModel,
    config: SchedulerConfig,
    /// Live-task arena. Holding this lock blocks task creation and exit,
    /// which is exactly what the stop-the-world phase needs.
    tasks: PMutex<TaskArena>,
    next_id: AtomicUsize,
    /// Countdown of tasks that still have to finish their stack scan;
    /// the scanner joins on it like a wait group.
    scan_done: Futex,
    /// Stack scanning is never parallel: the mark phase does not support
    /// concurrent marking.
    stack_scan_lock: PMutex<()>,
    /// Root visitor of the scan in progress.
    scan_visitor: Mutex<Option<Arc<dyn RootVisitor>>>,
    /// Registered global root ranges.
    globals: GlobalRoots,
    /// Cooperative model only: the right to run. Held by the running
    /// task, released at every yield point.
    run_token: Semaphore,
    /// Back-reference handed to tasks so they can reach their scheduler.
    weak: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with the model selected for this artifact.
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Self::with_model(DEFAULT_MODEL, config)
    }

    /// Create a scheduler with an explicit scheduling model.
    pub fn with_model(model: SchedulingModel, config: SchedulerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            model,
            config,
            tasks: PMutex::new(TaskArena::new()),
            next_id: AtomicUsize::new(0),
            scan_done: Futex::new(),
            stack_scan_lock: PMutex::new(()),
            scan_visitor: Mutex::new(None),
            globals: GlobalRoots::new(),
            run_token: Semaphore::new(),
            weak: weak.clone(),
        })
    }

    /// The scheduling model this scheduler materializes.
    #[inline]
    pub fn model(&self) -> SchedulingModel {
        self.model
    }

    /// Registered global root ranges, scanned during every
    /// stop-the-world phase.
    #[inline]
    pub fn global_roots(&self) -> &GlobalRoots {
        &self.globals
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len
    }

    /// Look up a live task by identifier.
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks
            .lock()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Bind the calling thread as a task without an explicit start call.
    ///
    /// Used for the main task at runtime startup and for embedder threads
    /// that need to enter the runtime. Under the cooperative model the
    /// adopted task holds the run token.
    pub fn adopt_current_thread(&self) -> Arc<Task> {
        if try_current().is_some() {
            unwind::runtime_fatal("thread is already bound to a task");
        }
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let task = Task::new(id, false, self.weak.clone());
        *task.thread.lock() = Some(thread::current());
        task.stack_top.store(stack_probe(), Ordering::SeqCst);
        task.record_sp();
        self.tasks.lock().insert(task.clone());
        CURRENT.with(|c| *c.borrow_mut() = Some(task.clone()));
        debug!(task = %id, "adopted current thread");
        task
    }

    /// Start a new task running `entry`.
    ///
    /// The task is linked into the registry only once native thread
    /// creation has fully succeeded, so a stop-the-world phase never
    /// observes a half-started task. Thread creation failure is fatal.
    pub fn start<F>(&self, entry: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let task = Task::new(id, true, self.weak.clone());
        trace!(task = %id, "start");

        // Hold the registry lock across thread creation so exit
        // bookkeeping and stop-the-world scans order cleanly against the
        // insert.
        let mut arena = self.tasks.lock();
        let builder = thread::Builder::new()
            .name(format!("{}-{}", self.config.name_prefix, id.0))
            .stack_size(self.config.stack_size);
        let spawned = builder.spawn({
            let sched = self.weak.upgrade().expect("scheduler is alive during start");
            let task = task.clone();
            let entry: Box<dyn FnOnce() + Send> = Box::new(entry);
            move || task_main(sched, task, entry)
        });
        match spawned {
            Ok(handle) => {
                *task.thread.lock() = Some(handle.thread().clone());
                arena.insert(task);
            }
            Err(err) => {
                drop(arena);
                unwind::runtime_fatal(&format!("could not start task: {err}"));
            }
        }
        id
    }

    /// Remove an exited task from the registry. A missing task is an
    /// invariant violation.
    fn task_exited(&self, task: &Arc<Task>) {
        trace!(task = %task.id, "exit");
        let found = self.tasks.lock().remove(task);
        if !found {
            unwind::runtime_fatal("exited task was not in the registry");
        }
    }

    /// Block the current task on `futex` while it holds `expected`,
    /// releasing the run token for the duration under the cooperative
    /// model.
    pub(crate) fn block_on(&self, futex: &Futex, expected: u32, timeout: Option<Duration>) {
        if self.model == SchedulingModel::Cooperative {
            if let Some(task) = try_current() {
                task.record_sp();
            }
            self.run_token.post();
            match timeout {
                None => futex.wait(expected),
                Some(timeout) => futex.wait_until(expected, timeout),
            }
            self.run_token.wait();
        } else {
            match timeout {
                None => futex.wait(expected),
                Some(timeout) => futex.wait_until(expected, timeout),
            }
        }
    }

    /// Stop the world and scan every live task's stack plus the global
    /// roots through `visitor`.
    ///
    /// The caller must be a task; its own stack is scanned too. No task
    /// starts, exits or resumes until the scan completes.
    pub fn gc_scan(&self, visitor: Arc<dyn RootVisitor>) {
        let current = current();
        debug!(task = %current.id, "stop-the-world scan");

        // Block task creation and exit for the entire phase.
        let arena = self.tasks.lock();

        match self.model {
            SchedulingModel::Cooperative => {
                // With at most one runnable task, every other live task is
                // parked at a yield point that recorded its stack extent;
                // scan the extents directly.
                let _scan = self.stack_scan_lock.lock();
                visitor.visit_range(current.stack_range_from(stack_probe()));
                for task in arena.iter() {
                    if Arc::ptr_eq(task, &current) {
                        continue;
                    }
                    let sp = task.last_sp.load(Ordering::SeqCst);
                    if sp != 0 {
                        visitor.visit_range(task.stack_range_from(sp));
                    }
                }
                self.globals.scan(&*visitor);
            }
            SchedulingModel::Threaded => {
                *self.scan_visitor.lock() = Some(visitor.clone());

                // Request a pause from every other live task.
                let mut others: u32 = 0;
                for task in arena.iter() {
                    if !Arc::ptr_eq(task, &current) {
                        others += 1;
                        task.request_gc_pause();
                    }
                }

                // The number of stack scans to wait for; the initial
                // wait-group add.
                self.scan_done.store(others);

                // Scan our own stack first.
                {
                    let _scan = self.stack_scan_lock.lock();
                    visitor.visit_range(current.stack_range_from(stack_probe()));
                }

                // First rendezvous: release each paused task so it scans
                // its own stack.
                for task in arena.iter() {
                    if !Arc::ptr_eq(task, &current) {
                        task.gc_sem.post();
                    }
                }

                // Join on the countdown.
                loop {
                    let val = self.scan_done.load();
                    if val == 0 {
                        break;
                    }
                    self.scan_done.wait(val);
                }

                // Scan the globals while the world is still stopped.
                self.globals.scan(&*visitor);

                // Second rendezvous: resume normal execution.
                for task in arena.iter() {
                    if !Arc::ptr_eq(task, &current) {
                        task.gc_sem.post();
                    }
                }

                *self.scan_visitor.lock() = None;
            }
        }

        drop(arena);
        debug!(task = %current.id, "scan complete");
    }

    /// The non-scanner side of the stop-the-world protocol, run from a
    /// safepoint on the paused task's own thread.
    pub(crate) fn gc_pause(&self, task: &Arc<Task>) {
        trace!(task = %task.id, "gc pause");

        // First rendezvous: wait for the signal to start scanning.
        task.gc_sem.wait();

        // Scan a single stack at a time; the mark phase does not support
        // parallel scanning.
        {
            let _scan = self.stack_scan_lock.lock();
            let visitor = self.scan_visitor.lock().clone();
            if let Some(visitor) = visitor {
                visitor.visit_range(task.stack_range_from(stack_probe()));
            }
        }

        // Wait-group done: the last task to finish wakes the scanner.
        if self.scan_done.add(-1) == 0 {
            self.scan_done.wake(1);
        }

        // Second rendezvous: wait until the mark phase has finished.
        task.gc_sem.wait();
        trace!(task = %task.id, "gc resume");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("model", &self.model)
            .field("tasks", &self.task_count())
            .finish()
    }
}

/// Body of a spawned task's hosting thread.
fn task_main(sched: Arc<Scheduler>, task: Arc<Task>, entry: Box<dyn FnOnce() + Send>) {
    task.stack_top.store(stack_probe(), Ordering::SeqCst);
    task.record_sp();
    CURRENT.with(|c| *c.borrow_mut() = Some(task.clone()));
    trace!(task = %task.id, "running");

    if sched.model == SchedulingModel::Cooperative {
        sched.run_token.wait();
    }

    match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => {}
        Err(payload) => {
            if payload.downcast_ref::<TaskExit>().is_some() {
                trace!(task = %task.id, "early exit");
            } else {
                // A Rust panic escaped the task entry with no cleanup
                // frame left to intercept it.
                let text = unwind::payload_text(payload.as_ref());
                unwind::runtime_fatal(&format!("task panicked: {text}"));
            }
        }
    }

    if sched.model == SchedulingModel::Cooperative {
        sched.run_token.post();
    }
    sched.task_exited(&task);
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// Approximate the current stack pointer with the address of a local.
#[inline(never)]
fn stack_probe() -> usize {
    let marker = 0u32;
    std::ptr::addr_of!(marker) as usize
}
