//! Worker thread that executes Tasks
//!
//! Each worker is a single-threaded cooperative loop: find a ready task,
//! resume it once, route the result. Finished tasks report through their
//! completion channel, yielded tasks go back to the ready queue and
//! suspended tasks are parked in the wait registry.
//!
//! While there is nothing to run, one idle worker drives the wait
//! registry's readiness and timer pass; the others park on the ready queue.
//! Busy workers run a non-blocking pass every `event_interval` resumes so
//! readiness is observed even under load.

use crate::executor::{QueuePolicy, Shared};
use crate::task::{Step, Task, TaskState};
use crossbeam_deque::{Steal, Stealer, Worker as CWorker};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Handle to a running worker thread
pub(crate) struct Worker {
    /// Worker ID
    id: usize,

    /// Worker thread handle
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker thread
    ///
    /// The local deque is created by the caller so its stealer can be
    /// handed to the sibling workers before any of them start.
    pub(crate) fn spawn(
        id: usize,
        shared: Arc<Shared>,
        local: CWorker<Box<Task>>,
        stealers: Arc<[Stealer<Box<Task>>]>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("tenon-worker-{}", id))
            .spawn(move || {
                WorkerLoop {
                    id,
                    shared,
                    local,
                    stealers,
                    since_poll: 0,
                }
                .run()
            })?;

        Ok(Self {
            id,
            handle: Some(handle),
        })
    }

    /// Get the worker ID
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Join the thread, giving up at `deadline`
    ///
    /// Returns false if the thread was still running and has been detached.
    pub(crate) fn join(&mut self, deadline: Instant) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        join_until(handle, deadline)
    }
}

/// Join a thread with a deadline, detach if stuck.
pub(crate) fn join_until(handle: thread::JoinHandle<()>, deadline: Instant) -> bool {
    loop {
        if handle.is_finished() {
            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
            return true;
        }
        if Instant::now() >= deadline {
            drop(handle);
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

struct WorkerLoop {
    id: usize,
    shared: Arc<Shared>,
    local: CWorker<Box<Task>>,
    stealers: Arc<[Stealer<Box<Task>>]>,
    since_poll: u32,
}

impl WorkerLoop {
    fn run(mut self) {
        log::debug!("worker {} started", self.id);

        while self.shared.is_running() {
            match self.find_work() {
                Some(task) => {
                    self.run_task(task);
                    self.maybe_poll();
                }
                None => self.idle(),
            }
        }

        let mut cancelled = 0;
        while let Some(task) = self.local.pop() {
            drop(task);
            cancelled += 1;
        }
        log::debug!(
            "worker {} shutting down ({} local task(s) cancelled)",
            self.id,
            cancelled
        );
    }

    /// Resume a task once and route the result
    fn run_task(&mut self, mut task: Box<Task>) {
        task.set_state(TaskState::Running);

        match task.step(&self.shared.registry, self.id) {
            Step::Finished(result) => {
                match &result {
                    Ok(()) => log::trace!("{} ({}) completed", task.id(), task.name()),
                    Err(err) => log::debug!("{} ({}) failed: {}", task.id(), task.name(), err),
                }
                task.finish(result);
            }
            Step::Yield => {
                // Dropping an unfinished task cancels it
                if self.shared.is_running() {
                    self.requeue(task);
                }
            }
            Step::Suspend(reason) => {
                if !self.shared.is_running() {
                    return;
                }
                log::trace!("{} suspended on {:?}", task.id(), reason);
                if let Some(task) = self.shared.registry.park(task, reason) {
                    self.requeue(task);
                }
            }
        }
    }

    fn requeue(&self, mut task: Box<Task>) {
        match self.shared.config.policy {
            QueuePolicy::Fifo => self.shared.schedule(task),
            QueuePolicy::WorkStealing => {
                task.set_state(TaskState::Ready);
                self.local.push(task);
            }
        }
    }

    /// Find work: local pop, then the injector, then steal
    fn find_work(&self) -> Option<Box<Task>> {
        if let Some(task) = self.local.pop() {
            return Some(task);
        }

        match self.shared.config.policy {
            QueuePolicy::Fifo => self.shared.queue.pop(),
            QueuePolicy::WorkStealing => self
                .shared
                .queue
                .pop_batch(&self.local)
                .or_else(|| self.steal_from_others()),
        }
    }

    /// Steal from other workers
    fn steal_from_others(&self) -> Option<Box<Task>> {
        use rand::Rng;

        if self.stealers.len() < 2 {
            return None;
        }

        // Randomly select a victim
        let mut rng = rand::thread_rng();
        let start = rng.gen_range(0..self.stealers.len());

        for i in 0..self.stealers.len() {
            let index = (start + i) % self.stealers.len();
            if index == self.id {
                continue;
            }
            loop {
                match self.stealers[index].steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn maybe_poll(&mut self) {
        if self.shared.config.dedicated_poller {
            return;
        }
        self.since_poll += 1;
        if self.since_poll >= self.shared.config.event_interval {
            self.since_poll = 0;
            self.poll(Duration::ZERO);
        }
    }

    /// Run the registry pass; false if another thread holds it
    fn poll(&self, max_wait: Duration) -> bool {
        let queue = &self.shared.queue;
        let Some(woken) = self.shared.registry.poll(max_wait, || !queue.is_empty()) else {
            return false;
        };
        if self.shared.is_running() {
            for task in woken {
                self.shared.schedule(task);
            }
        }
        true
    }

    fn idle(&mut self) {
        let idle_wait = self.shared.config.idle_wait;
        if !self.shared.config.dedicated_poller && self.poll(idle_wait) {
            self.since_poll = 0;
            return;
        }
        self.shared.queue.park(idle_wait);
    }
}

/// Run the registry pass on its own thread until shutdown
pub(crate) fn spawn_poller(shared: Arc<Shared>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("tenon-poller".to_string())
        .spawn(move || {
            log::debug!("poller started");
            while shared.is_running() {
                let Some(woken) = shared.registry.poll(shared.config.idle_wait, || false) else {
                    thread::sleep(shared.config.idle_wait);
                    continue;
                };
                if !shared.is_running() {
                    break;
                }
                for task in woken {
                    shared.schedule(task);
                }
            }
            log::debug!("poller shutting down");
        })
}
