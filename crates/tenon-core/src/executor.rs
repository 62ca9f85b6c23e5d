//! Executor: owns the workers, the ready queue and the wait registry
//!
//! The executor is an explicit instance with an explicit lifecycle:
//!
//! ```text
//! Created --start--> Running --stop--> Draining --> Stopped
//!    \________________stop_______________/
//! ```
//!
//! `Stopped` is terminal. Submissions are accepted while `Created` (they
//! run once started) and `Running`, and rejected with
//! [`ExecutorError::Stopped`] from the moment `stop` begins.

use crate::error::ExecutorError;
use crate::queue::ReadyQueue;
use crate::registry::WaitRegistry;
use crate::task::{Coroutine, Task, TaskHandle, TaskStats};
use crate::worker::{self, Worker};
use crossbeam_deque::{Stealer, Worker as CWorker};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound used when no explicit `max_workers` is configured
const DEFAULT_MAX_WORKERS: usize = 256;

/// How yielded tasks are requeued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Every runnable task goes through the single global FIFO
    #[default]
    Fifo,
    /// Yielded tasks stay on the worker's local deque; idle workers steal
    WorkStealing,
}

/// Executor tunables
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads (None = number of CPUs)
    pub workers: Option<usize>,

    /// Cap applied to `workers`
    pub max_workers: usize,

    /// Ready queue fairness
    pub policy: QueuePolicy,

    /// Run the wait registry pass on a dedicated `tenon-poller` thread
    pub dedicated_poller: bool,

    /// Longest an idle worker blocks before re-checking for work
    pub idle_wait: Duration,

    /// Resumes between non-blocking registry passes on a busy worker
    pub event_interval: u32,

    /// How long `stop` waits for workers to finish their current resume
    pub drain_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_workers: DEFAULT_MAX_WORKERS,
            policy: QueuePolicy::Fifo,
            dedicated_poller: false,
            idle_wait: Duration::from_millis(50),
            event_interval: 61,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl ExecutorConfig {
    /// Default configuration with a fixed worker count
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..Self::default()
        }
    }

    /// Effective number of worker threads
    pub fn worker_count(&self) -> usize {
        let requested = match self.workers {
            Some(0) | None => num_cpus::get(),
            Some(n) => n,
        };
        requested.clamp(1, self.max_workers.max(1))
    }
}

/// Lifecycle of an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorStatus {
    /// Constructed, workers not started
    Created = 0,
    /// Workers running
    Running = 1,
    /// `stop` in progress
    Draining = 2,
    /// Terminal
    Stopped = 3,
}

impl ExecutorStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutorStatus::Created,
            1 => ExecutorStatus::Running,
            2 => ExecutorStatus::Draining,
            _ => ExecutorStatus::Stopped,
        }
    }
}

/// Executor statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorStats {
    /// Tasks ever submitted
    pub spawned: u64,
    /// Tasks that completed successfully
    pub completed: u64,
    /// Tasks that finished with an error
    pub failed: u64,
    /// Tasks dropped by shutdown
    pub cancelled: u64,
    /// Tasks queued
    pub ready: usize,
    /// Tasks being resumed
    pub running: usize,
    /// Tasks parked in the wait registry
    pub waiting: usize,
}

impl ExecutorStats {
    /// Tasks that are ready, running or waiting
    pub fn in_flight(&self) -> usize {
        self.ready + self.running + self.waiting
    }
}

/// State shared between the executor handle and its threads
pub(crate) struct Shared {
    pub(crate) queue: ReadyQueue,
    pub(crate) registry: Arc<WaitRegistry>,
    pub(crate) stats: Arc<TaskStats>,
    pub(crate) config: ExecutorConfig,
    status: AtomicU8,
}

impl Shared {
    /// Make a task runnable
    pub(crate) fn schedule(&self, task: Box<Task>) {
        self.queue.push(task);
        self.registry.notify();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.status() == ExecutorStatus::Running
    }

    fn status(&self) -> ExecutorStatus {
        ExecutorStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ExecutorStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

/// Multi-threaded cooperative task executor
pub struct Executor {
    shared: Arc<Shared>,

    /// Worker threads
    workers: Mutex<Vec<Worker>>,

    /// Dedicated registry thread, if configured
    poller: Mutex<Option<thread::JoinHandle<()>>>,

    /// Submissions hold this shared; the transition to Draining holds it
    /// exclusively so no submission slips in after the queue is drained
    gate: RwLock<()>,

    /// Serializes `start` and `stop`
    lifecycle: Mutex<()>,
}

impl Executor {
    /// Create an executor; no threads are started until [`Executor::start`]
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let registry = Arc::new(WaitRegistry::new()?);
        Ok(Self {
            shared: Arc::new(Shared {
                queue: ReadyQueue::new(),
                registry,
                stats: Arc::new(TaskStats::default()),
                config,
                status: AtomicU8::new(ExecutorStatus::Created as u8),
            }),
            workers: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
            gate: RwLock::new(()),
            lifecycle: Mutex::new(()),
        })
    }

    /// Create an executor with a fixed worker count
    pub fn with_workers(workers: usize) -> Result<Self, ExecutorError> {
        Self::new(ExecutorConfig::with_workers(workers))
    }

    /// Submit a root coroutine
    pub fn submit<C: Coroutine>(&self, root: C) -> Result<TaskHandle, ExecutorError> {
        self.submit_boxed(Box::new(root))
    }

    /// Submit an already boxed root coroutine
    pub fn submit_boxed(&self, root: Box<dyn Coroutine>) -> Result<TaskHandle, ExecutorError> {
        let _gate = self.gate.read();
        self.accepting()?;
        Ok(self.spawn_root(root))
    }

    /// Submit a root coroutine, handing it back if it is refused
    ///
    /// Lets the caller release whatever the coroutine owns in its own way
    /// instead of having it dropped.
    pub fn try_submit<C: Coroutine>(&self, root: C) -> Result<TaskHandle, (C, ExecutorError)> {
        let _gate = self.gate.read();
        if let Err(err) = self.accepting() {
            return Err((root, err));
        }
        Ok(self.spawn_root(Box::new(root)))
    }

    fn accepting(&self) -> Result<(), ExecutorError> {
        match self.shared.status() {
            ExecutorStatus::Created | ExecutorStatus::Running => Ok(()),
            ExecutorStatus::Draining | ExecutorStatus::Stopped => Err(ExecutorError::Stopped),
        }
    }

    fn spawn_root(&self, root: Box<dyn Coroutine>) -> TaskHandle {
        let mut completion = None;
        let outcome = TaskHandle::channel(&mut completion);
        let task = Box::new(Task::new(root, self.shared.stats.clone(), completion));
        let handle = TaskHandle::new(task.id(), outcome);

        log::trace!("submitted {} ({})", task.id(), task.name());
        self.shared.schedule(task);
        handle
    }

    /// Start the worker threads
    ///
    /// May be called once. Fails with [`ExecutorError::AlreadyStarted`] on a
    /// second call and [`ExecutorError::Stopped`] after `stop`.
    pub fn start(&self) -> Result<(), ExecutorError> {
        let _lifecycle = self.lifecycle.lock();
        match self.shared.status() {
            ExecutorStatus::Created => {}
            ExecutorStatus::Running => return Err(ExecutorError::AlreadyStarted),
            ExecutorStatus::Draining | ExecutorStatus::Stopped => {
                return Err(ExecutorError::Stopped)
            }
        }

        let count = self.shared.config.worker_count();
        let locals: Vec<CWorker<Box<Task>>> = (0..count).map(|_| CWorker::new_fifo()).collect();
        let stealers: Arc<[Stealer<Box<Task>>]> = locals.iter().map(|w| w.stealer()).collect();

        self.shared.set_status(ExecutorStatus::Running);

        let spawned = self.spawn_threads(locals, stealers);
        if let Err(err) = spawned {
            log::error!("failed to start executor: {}", err);
            let _ = self.shutdown();
            return Err(err.into());
        }

        log::info!(
            "executor started with {} worker(s), {:?} policy",
            count,
            self.shared.config.policy
        );
        Ok(())
    }

    fn spawn_threads(
        &self,
        locals: Vec<CWorker<Box<Task>>>,
        stealers: Arc<[Stealer<Box<Task>>]>,
    ) -> std::io::Result<()> {
        let mut workers = self.workers.lock();
        for (id, local) in locals.into_iter().enumerate() {
            workers.push(Worker::spawn(
                id,
                self.shared.clone(),
                local,
                stealers.clone(),
            )?);
        }
        drop(workers);

        if self.shared.config.dedicated_poller {
            *self.poller.lock() = Some(worker::spawn_poller(self.shared.clone())?);
        }
        Ok(())
    }

    /// Stop the executor
    ///
    /// Rejects further submissions, lets every worker finish its current
    /// resume, then cancels whatever is still queued or parked. Blocks for
    /// at most the configured drain timeout; workers still busy after that
    /// are detached and reported through [`ExecutorError::DrainTimeout`].
    /// Calling `stop` again returns `Ok(())`.
    pub fn stop(&self) -> Result<(), ExecutorError> {
        let _lifecycle = self.lifecycle.lock();
        self.shutdown()
    }

    fn shutdown(&self) -> Result<(), ExecutorError> {
        let previous = {
            let _gate = self.gate.write();
            let previous = self.shared.status();
            match previous {
                ExecutorStatus::Created | ExecutorStatus::Running => {
                    self.shared.set_status(ExecutorStatus::Draining);
                }
                ExecutorStatus::Draining | ExecutorStatus::Stopped => return Ok(()),
            }
            previous
        };
        log::info!("executor draining");

        let timeout = self.shared.config.drain_timeout;
        let mut abandoned = 0;
        if previous == ExecutorStatus::Running {
            self.shared.queue.notify_all();
            self.shared.registry.wake();

            let deadline = Instant::now() + timeout;
            for mut worker in self.workers.lock().drain(..) {
                if !worker.join(deadline) {
                    log::warn!("worker {} did not finish within {:?}", worker.id(), timeout);
                    abandoned += 1;
                }
            }
            if let Some(poller) = self.poller.lock().take() {
                if !worker::join_until(poller, deadline) {
                    log::warn!("poller did not finish within {:?}", timeout);
                }
            }
        }

        // Dropping unfinished tasks cancels them
        let queued = self.shared.queue.drain();
        let parked = self.shared.registry.drain();
        let cancelled = queued.len() + parked.len();
        drop(queued);
        drop(parked);

        self.shared.set_status(ExecutorStatus::Stopped);
        log::info!("executor stopped ({} task(s) cancelled)", cancelled);

        if abandoned > 0 {
            return Err(ExecutorError::DrainTimeout { timeout, abandoned });
        }
        Ok(())
    }

    /// Wait until no task is ready, running or waiting
    ///
    /// Returns false on timeout.
    pub fn wait_tasks_finished(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.shared.stats.in_flight() > 0 {
            if start.elapsed() > timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Get executor statistics
    pub fn stats(&self) -> ExecutorStats {
        let stats = &self.shared.stats;
        ExecutorStats {
            spawned: stats.spawned.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            ready: stats.ready.load(Ordering::Relaxed),
            running: stats.running.load(Ordering::Relaxed),
            waiting: stats.waiting.load(Ordering::Relaxed),
        }
    }

    /// Number of worker threads this executor runs (or will run)
    pub fn worker_count(&self) -> usize {
        self.shared.config.worker_count()
    }

    /// Current lifecycle status
    pub fn status(&self) -> ExecutorStatus {
        self.shared.status()
    }

    /// Configuration in effect
    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// The wait registry tasks of this executor park on
    pub fn registry(&self) -> &Arc<WaitRegistry> {
        &self.shared.registry
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("executor drop: {}", err);
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("status", &self.status())
            .field("workers", &self.worker_count())
            .field("stats", &self.stats())
            .finish()
    }
}
