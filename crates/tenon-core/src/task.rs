//! Task structure and execution state
//!
//! A [`Task`] is a stack of [`Coroutine`] frames. The bottom frame is the
//! root submitted to the executor; frames above it are children pushed with
//! [`Action::Await`]. Only the top frame runs. When it finishes, the frame
//! below is resumed with either [`Wake::Child`] or, if the child failed,
//! through [`Coroutine::handle_error`].
//!
//! Tasks are moved by value (`Box<Task>`) between the ready queue, the
//! worker resuming them and the wait registry, so a task can only ever be
//! resumed by the one thread currently holding it.

use crate::error::TaskError;
use crate::registry::{IoSource, SourceToken, WaitRegistry};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Scheduling state of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, eligible to run
    Ready,
    /// Being resumed by a worker
    Running,
    /// Parked in the wait registry
    Waiting,
    /// Completed, failed or cancelled
    Finished,
}

/// Why the top frame is being resumed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Wake {
    /// First resume of this frame
    Start,
    /// The frame yielded last time
    Yielded,
    /// The condition the frame suspended on was observed
    Ready,
    /// A child frame finished successfully
    Child,
}

/// Reason why a task is suspended
///
/// Tells the wait registry which condition must hold before the task is
/// made ready again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// Wait until the source is readable
    Readable {
        /// Registered source
        source: SourceToken,
        /// Give up with [`TaskError::TimedOut`] at this instant
        deadline: Option<Instant>,
    },

    /// Wait until the source is writable
    Writable {
        /// Registered source
        source: SourceToken,
        /// Give up with [`TaskError::TimedOut`] at this instant
        deadline: Option<Instant>,
    },

    /// Sleep until a specific time
    Sleep {
        /// When to wake up
        until: Instant,
    },
}

impl SuspendReason {
    /// Deadline after which the wait fires regardless of readiness
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            SuspendReason::Readable { deadline, .. } | SuspendReason::Writable { deadline, .. } => {
                *deadline
            }
            SuspendReason::Sleep { until } => Some(*until),
        }
    }
}

/// What a coroutine asks the worker to do after one resume
pub enum Action {
    /// Run again as soon as possible (goes to the back of the ready queue)
    Yield,
    /// Park until the condition holds
    Suspend(SuspendReason),
    /// Run a child to completion, then resume this frame
    Await(Box<dyn Coroutine>),
    /// This frame is done
    Finish(Result<(), TaskError>),
}

impl Action {
    /// Finish successfully
    pub fn done() -> Self {
        Action::Finish(Ok(()))
    }

    /// Finish with an error
    pub fn fail(err: impl Into<TaskError>) -> Self {
        Action::Finish(Err(err.into()))
    }

    /// Sleep for a duration
    pub fn sleep(duration: Duration) -> Self {
        Action::Suspend(SuspendReason::Sleep {
            until: Instant::now() + duration,
        })
    }

    /// Sleep until an instant
    pub fn sleep_until(until: Instant) -> Self {
        Action::Suspend(SuspendReason::Sleep { until })
    }

    /// Await a child coroutine
    pub fn await_child<C: Coroutine>(child: C) -> Self {
        Action::Await(Box::new(child))
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Yield => f.write_str("Yield"),
            Action::Suspend(reason) => f.debug_tuple("Suspend").field(reason).finish(),
            Action::Await(child) => f.debug_tuple("Await").field(&child.name()).finish(),
            Action::Finish(result) => f.debug_tuple("Finish").field(result).finish(),
        }
    }
}

/// A resumable unit of cooperative work
///
/// `resume` must return promptly: blocking inside it blocks a whole worker.
/// Anything that would block is expressed as [`Action::Suspend`].
pub trait Coroutine: Send + 'static {
    /// Advance until the next yield, suspension or completion
    fn resume(&mut self, cx: &mut Context<'_>) -> Action;

    /// Called instead of `resume` when a child failed or a wait timed out
    fn handle_error(&mut self, error: TaskError, _cx: &mut Context<'_>) -> Action {
        Action::Finish(Err(error))
    }

    /// Release resources; the frame is dropped without being resumed again
    fn cancel(&mut self) {}

    /// Name used in logs
    fn name(&self) -> &'static str {
        "task"
    }
}

/// Coroutine backed by a closure
pub struct FnCoroutine<F> {
    f: F,
    name: &'static str,
}

/// Wrap a closure as a coroutine
pub fn from_fn<F>(f: F) -> FnCoroutine<F>
where
    F: FnMut(&mut Context<'_>) -> Action + Send + 'static,
{
    FnCoroutine { f, name: "fn" }
}

impl<F> FnCoroutine<F> {
    /// Set the log name
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl<F> Coroutine for FnCoroutine<F>
where
    F: FnMut(&mut Context<'_>) -> Action + Send + 'static,
{
    fn resume(&mut self, cx: &mut Context<'_>) -> Action {
        (self.f)(cx)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Per-resume view of the task and executor handed to a coroutine
pub struct Context<'a> {
    task_id: TaskId,
    worker_id: usize,
    wake: Wake,
    registry: &'a Arc<WaitRegistry>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        task_id: TaskId,
        worker_id: usize,
        wake: Wake,
        registry: &'a Arc<WaitRegistry>,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            wake,
            registry,
        }
    }

    /// Task being resumed
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Worker thread doing the resume
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Why this resume happened
    pub fn wake(&self) -> Wake {
        self.wake
    }

    /// Register an I/O source for readiness waits
    ///
    /// The returned [`IoSource`] owns the source and deregisters it on drop.
    pub fn register<S>(&self, source: S) -> io::Result<IoSource<S>>
    where
        S: mio::event::Source,
    {
        WaitRegistry::register(self.registry, source)
    }
}

/// Shared task counters, updated on every state transition
#[derive(Debug, Default)]
pub struct TaskStats {
    pub(crate) spawned: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) ready: AtomicUsize,
    pub(crate) running: AtomicUsize,
    pub(crate) waiting: AtomicUsize,
    /// Tasks created and not yet finished
    pub(crate) live: AtomicUsize,
}

impl TaskStats {
    fn gauge(&self, state: TaskState) -> Option<&AtomicUsize> {
        match state {
            TaskState::Ready => Some(&self.ready),
            TaskState::Running => Some(&self.running),
            TaskState::Waiting => Some(&self.waiting),
            TaskState::Finished => None,
        }
    }

    /// Tasks that are ready, running or waiting
    ///
    /// Read from one counter, so a task moving between states is never
    /// missed.
    pub fn in_flight(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Final result of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The root frame finished successfully
    Completed,
    /// The root frame finished with an error
    Failed(TaskError),
    /// Shutdown dropped the task before it finished
    Cancelled,
}

impl Outcome {
    /// Whether the task completed successfully
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }

    /// Whether the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

enum Resumption {
    Resume(Wake),
    Error(TaskError),
}

/// Result of running a task for one scheduling turn
pub(crate) enum Step {
    Finished(Result<(), TaskError>),
    Yield,
    Suspend(SuspendReason),
}

/// A lightweight cooperative task
pub struct Task {
    /// Unique identifier
    id: TaskId,

    /// Name of the root coroutine
    name: &'static str,

    /// Coroutine stack, root at index 0
    frames: Vec<Box<dyn Coroutine>>,

    /// Current state
    state: TaskState,

    /// How the top frame is entered next
    next: Resumption,

    /// Number of scheduling turns taken
    turns: u64,

    /// Executor-wide counters
    stats: Arc<TaskStats>,

    /// Outcome channel of the task handle
    completion: Option<Sender<Outcome>>,
}

impl Task {
    /// Create a task in the ready state
    pub(crate) fn new(
        root: Box<dyn Coroutine>,
        stats: Arc<TaskStats>,
        completion: Option<Sender<Outcome>>,
    ) -> Self {
        stats.spawned.fetch_add(1, Ordering::Relaxed);
        stats.live.fetch_add(1, Ordering::AcqRel);
        stats.ready.fetch_add(1, Ordering::AcqRel);
        Self {
            id: TaskId::new(),
            name: root.name(),
            frames: vec![root],
            state: TaskState::Ready,
            next: Resumption::Resume(Wake::Start),
            turns: 0,
            stats,
            completion,
        }
    }

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Name of the root coroutine
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Number of frames on the coroutine stack
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Number of scheduling turns taken so far
    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Move to a new state, keeping the gauges in step
    pub(crate) fn set_state(&mut self, state: TaskState) {
        if self.state == state {
            return;
        }
        if let Some(gauge) = self.stats.gauge(state) {
            gauge.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(gauge) = self.stats.gauge(self.state) {
            gauge.fetch_sub(1, Ordering::AcqRel);
        }
        if state == TaskState::Finished {
            self.stats.live.fetch_sub(1, Ordering::AcqRel);
        }
        self.state = state;
    }

    /// Resume the top frame normally on the next turn
    pub(crate) fn set_wake(&mut self, wake: Wake) {
        self.next = Resumption::Resume(wake);
    }

    /// Enter the top frame through `handle_error` on the next turn
    pub(crate) fn set_error(&mut self, error: TaskError) {
        self.next = Resumption::Error(error);
    }

    /// Run frames until the task yields, suspends or the root finishes
    ///
    /// Panics raised by a frame are caught here and unwind that frame
    /// as a failed continuation.
    pub(crate) fn step(&mut self, registry: &Arc<WaitRegistry>, worker_id: usize) -> Step {
        self.turns += 1;
        let id = self.id;

        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Step::Finished(Ok(()));
            };
            let next = std::mem::replace(&mut self.next, Resumption::Resume(Wake::Yielded));
            let wake = match next {
                Resumption::Resume(wake) => wake,
                Resumption::Error(_) => Wake::Ready,
            };
            let mut cx = Context::new(id, worker_id, wake, registry);

            let mut panicked = false;
            let action = panic::catch_unwind(AssertUnwindSafe(|| match next {
                Resumption::Resume(_) => frame.resume(&mut cx),
                Resumption::Error(err) => frame.handle_error(err, &mut cx),
            }))
            .unwrap_or_else(|payload| {
                panicked = true;
                let message = panic_message(payload.as_ref());
                log::error!("{} ({}) panicked: {}", id, frame_name(&self.frames), message);
                Action::Finish(Err(TaskError::Panicked(message)))
            });

            match action {
                Action::Yield => {
                    self.next = Resumption::Resume(Wake::Yielded);
                    return Step::Yield;
                }
                Action::Suspend(reason) => {
                    self.next = Resumption::Resume(Wake::Ready);
                    return Step::Suspend(reason);
                }
                Action::Await(child) => {
                    log::trace!("{} awaiting child {}", id, child.name());
                    self.frames.push(child);
                    self.next = Resumption::Resume(Wake::Start);
                }
                Action::Finish(result) => {
                    if let Some(mut frame) = self.frames.pop() {
                        // A panicking frame never finished on its own terms
                        if panicked {
                            let _ = panic::catch_unwind(AssertUnwindSafe(|| frame.cancel()));
                        }
                    }
                    if self.frames.is_empty() {
                        return Step::Finished(result);
                    }
                    self.next = match result {
                        Ok(()) => Resumption::Resume(Wake::Child),
                        Err(err) => Resumption::Error(err),
                    };
                }
            }
        }
    }

    /// Record the final outcome and release the task
    pub(crate) fn finish(mut self: Box<Self>, result: Result<(), TaskError>) {
        let outcome = match result {
            Ok(()) => Outcome::Completed,
            Err(err) => Outcome::Failed(err),
        };
        self.complete(outcome);
    }

    fn complete(&mut self, outcome: Outcome) {
        if self.state == TaskState::Finished {
            return;
        }
        self.set_state(TaskState::Finished);
        let counter = match &outcome {
            Outcome::Completed => &self.stats.completed,
            Outcome::Failed(_) => &self.stats.failed,
            Outcome::Cancelled => &self.stats.cancelled,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        if let Some(tx) = self.completion.take() {
            // Nobody listening is fine: the handle was dropped
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for Task {
    /// A task dropped before finishing is cancelled: frames release their
    /// resources top-down and the handle observes [`Outcome::Cancelled`].
    fn drop(&mut self) {
        if self.state == TaskState::Finished {
            return;
        }
        for frame in self.frames.iter_mut().rev() {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| frame.cancel()));
        }
        self.frames.clear();
        log::debug!("{} ({}) cancelled", self.id, self.name);
        self.complete(Outcome::Cancelled);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("depth", &self.frames.len())
            .finish()
    }
}

fn frame_name(frames: &[Box<dyn Coroutine>]) -> &'static str {
    frames.last().map(|f| f.name()).unwrap_or("?")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle for awaiting a Task's outcome
pub struct TaskHandle {
    task_id: TaskId,
    outcome: Receiver<Outcome>,
}

impl TaskHandle {
    /// Create a handle and the sender the task reports through
    pub(crate) fn channel(completion: &mut Option<Sender<Outcome>>) -> Receiver<Outcome> {
        let (tx, rx) = channel::bounded(1);
        *completion = Some(tx);
        rx
    }

    pub(crate) fn new(task_id: TaskId, outcome: Receiver<Outcome>) -> Self {
        Self { task_id, outcome }
    }

    /// Get the task ID
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Block until the task finishes
    pub fn join(self) -> Outcome {
        self.outcome.recv().unwrap_or(Outcome::Cancelled)
    }

    /// Block until the task finishes or the timeout elapses
    pub fn join_timeout(&self, timeout: Duration) -> Option<Outcome> {
        match self.outcome.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Outcome::Cancelled),
        }
    }

    /// Outcome if the task already finished
    pub fn try_outcome(&self) -> Option<Outcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Outcome::Cancelled),
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("task_id", &self.task_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn registry() -> Arc<WaitRegistry> {
        Arc::new(WaitRegistry::new().unwrap())
    }

    fn task_with_handle(root: Box<dyn Coroutine>) -> (Box<Task>, TaskHandle, Arc<TaskStats>) {
        let stats = Arc::new(TaskStats::default());
        let mut tx = None;
        let rx = TaskHandle::channel(&mut tx);
        let task = Box::new(Task::new(root, stats.clone(), tx));
        let handle = TaskHandle::new(task.id(), rx);
        (task, handle, stats)
    }

    struct Counter {
        remaining: u32,
    }

    impl Coroutine for Counter {
        fn resume(&mut self, _cx: &mut Context<'_>) -> Action {
            if self.remaining == 0 {
                return Action::done();
            }
            self.remaining -= 1;
            Action::Yield
        }
    }

    #[test]
    fn test_task_id_uniqueness() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_task_creation_counts_as_ready() {
        let (task, _handle, stats) = task_with_handle(Box::new(Counter { remaining: 0 }));
        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(stats.ready.load(Ordering::Relaxed), 1);
        assert_eq!(stats.spawned.load(Ordering::Relaxed), 1);
        assert_eq!(task.depth(), 1);
    }

    #[test]
    fn test_yield_then_finish() {
        let registry = registry();
        let (mut task, handle, stats) = task_with_handle(Box::new(Counter { remaining: 2 }));

        assert!(matches!(task.step(&registry, 0), Step::Yield));
        assert!(matches!(task.step(&registry, 0), Step::Yield));
        match task.step(&registry, 0) {
            Step::Finished(Ok(())) => task.finish(Ok(())),
            _ => panic!("expected finish"),
        }

        assert_eq!(handle.join(), Outcome::Completed);
        assert_eq!(stats.completed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_child_runs_before_parent_resumes() {
        let registry = registry();
        let child_done = Arc::new(AtomicBool::new(false));
        let flag = child_done.clone();
        let mut spawned = false;

        let parent = from_fn(move |cx| {
            if !spawned {
                spawned = true;
                let flag = flag.clone();
                return Action::await_child(from_fn(move |_| {
                    flag.store(true, Ordering::SeqCst);
                    Action::done()
                }));
            }
            assert_eq!(cx.wake(), Wake::Child);
            Action::done()
        });

        let (mut task, handle, _) = task_with_handle(Box::new(parent));
        match task.step(&registry, 0) {
            Step::Finished(result) => task.finish(result),
            _ => panic!("expected the whole stack to finish in one turn"),
        }
        assert!(child_done.load(Ordering::SeqCst));
        assert_eq!(handle.join(), Outcome::Completed);
    }

    #[test]
    fn test_child_error_reaches_parent_handler() {
        struct Parent {
            started: bool,
            seen: Option<TaskError>,
        }

        impl Coroutine for Parent {
            fn resume(&mut self, _cx: &mut Context<'_>) -> Action {
                if !self.started {
                    self.started = true;
                    return Action::await_child(from_fn(|_| Action::fail(TaskError::failed("boom"))));
                }
                Action::done()
            }

            fn handle_error(&mut self, error: TaskError, _cx: &mut Context<'_>) -> Action {
                self.seen = Some(error.clone());
                Action::Finish(Err(TaskError::failed(format!("wrapped: {}", error))))
            }
        }

        let registry = registry();
        let (mut task, handle, stats) = task_with_handle(Box::new(Parent {
            started: false,
            seen: None,
        }));
        match task.step(&registry, 0) {
            Step::Finished(result) => task.finish(result),
            _ => panic!("expected finish"),
        }
        assert_eq!(
            handle.join(),
            Outcome::Failed(TaskError::failed("wrapped: boom"))
        );
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panic_becomes_failure() {
        let registry = registry();
        let (mut task, handle, _) = task_with_handle(Box::new(from_fn(|_| panic!("kaboom"))));
        match task.step(&registry, 0) {
            Step::Finished(result) => task.finish(result),
            _ => panic!("expected finish"),
        }
        assert_eq!(
            handle.join(),
            Outcome::Failed(TaskError::Panicked("kaboom".to_string()))
        );
    }

    #[test]
    fn test_dropped_task_reports_cancelled() {
        struct Guarded(Arc<AtomicBool>);

        impl Coroutine for Guarded {
            fn resume(&mut self, _cx: &mut Context<'_>) -> Action {
                Action::Yield
            }

            fn cancel(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let (task, handle, stats) = task_with_handle(Box::new(Guarded(released.clone())));
        drop(task);

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(handle.join(), Outcome::Cancelled);
        assert_eq!(stats.cancelled.load(Ordering::Relaxed), 1);
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_state_gauges_follow_transitions() {
        let (mut task, _handle, stats) = task_with_handle(Box::new(Counter { remaining: 0 }));
        task.set_state(TaskState::Running);
        assert_eq!(stats.ready.load(Ordering::Relaxed), 0);
        assert_eq!(stats.running.load(Ordering::Relaxed), 1);
        task.set_state(TaskState::Waiting);
        assert_eq!(stats.running.load(Ordering::Relaxed), 0);
        assert_eq!(stats.waiting.load(Ordering::Relaxed), 1);
        task.finish(Ok(()));
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_in_flight_never_drops_during_transitions() {
        let (mut task, _handle, stats) = task_with_handle(Box::new(Counter { remaining: 0 }));
        let done = Arc::new(AtomicBool::new(false));

        let flipper = {
            let done = done.clone();
            std::thread::spawn(move || {
                for _ in 0..100_000 {
                    task.set_state(TaskState::Running);
                    task.set_state(TaskState::Waiting);
                    task.set_state(TaskState::Ready);
                }
                done.store(true, Ordering::SeqCst);
                task
            })
        };
        while !done.load(Ordering::SeqCst) {
            assert_eq!(stats.in_flight(), 1);
        }

        let task = flipper.join().unwrap();
        task.finish(Ok(()));
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_panicking_child_is_cancelled() {
        struct Fragile(Arc<AtomicBool>);

        impl Coroutine for Fragile {
            fn resume(&mut self, _cx: &mut Context<'_>) -> Action {
                panic!("child gave up");
            }

            fn cancel(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        struct Parent {
            child: Option<Fragile>,
            seen: Arc<parking_lot::Mutex<Option<TaskError>>>,
        }

        impl Coroutine for Parent {
            fn resume(&mut self, _cx: &mut Context<'_>) -> Action {
                match self.child.take() {
                    Some(child) => Action::await_child(child),
                    None => Action::done(),
                }
            }

            fn handle_error(&mut self, error: TaskError, _cx: &mut Context<'_>) -> Action {
                *self.seen.lock() = Some(error);
                Action::done()
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let registry = registry();
        let (mut task, handle, _) = task_with_handle(Box::new(Parent {
            child: Some(Fragile(released.clone())),
            seen: seen.clone(),
        }));
        match task.step(&registry, 0) {
            Step::Finished(result) => task.finish(result),
            _ => panic!("expected finish"),
        }

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(
            *seen.lock(),
            Some(TaskError::Panicked("child gave up".to_string()))
        );
        assert_eq!(handle.join(), Outcome::Completed);
    }

    #[test]
    fn test_handle_try_outcome_pending() {
        let (task, handle, _) = task_with_handle(Box::new(Counter { remaining: 1 }));
        assert!(handle.try_outcome().is_none());
        assert!(handle.join_timeout(Duration::from_millis(5)).is_none());
        drop(task);
        assert_eq!(handle.try_outcome(), Some(Outcome::Cancelled));
    }
}
