//! Global ready queue shared by all workers

use crate::task::{Task, TaskState};
use crossbeam_deque::{Injector, Steal, Worker as CWorker};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::time::Duration;

/// FIFO injector plus a parking spot for idle workers
pub(crate) struct ReadyQueue {
    injector: Injector<Box<Task>>,
    lock: Mutex<()>,
    cond: Condvar,
    parked: AtomicUsize,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            injector: Injector::new(),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    /// Enqueue a task and wake one parked worker
    pub(crate) fn push(&self, mut task: Box<Task>) {
        task.set_state(TaskState::Ready);
        self.injector.push(task);

        atomic::fence(Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_one();
        }
    }

    /// Take the oldest task
    pub(crate) fn pop(&self) -> Option<Box<Task>> {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Move a batch into `local` and return one task from it
    pub(crate) fn pop_batch(&self, local: &CWorker<Box<Task>>) -> Option<Box<Task>> {
        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }

    /// Block until a push or `timeout`
    pub(crate) fn park(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.parked.fetch_add(1, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
        if self.injector.is_empty() {
            self.cond.wait_for(&mut guard, timeout);
        }
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake every parked worker
    pub(crate) fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Remove every queued task
    pub(crate) fn drain(&self) -> Vec<Box<Task>> {
        let mut tasks = Vec::new();
        while let Some(task) = self.pop() {
            tasks.push(task);
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{from_fn, Action, TaskStats};
    use std::sync::Arc;
    use std::time::Instant;

    fn task(stats: &Arc<TaskStats>) -> Box<Task> {
        Box::new(Task::new(
            Box::new(from_fn(|_| Action::done())),
            stats.clone(),
            None,
        ))
    }

    #[test]
    fn test_fifo_order() {
        let stats = Arc::new(TaskStats::default());
        let queue = ReadyQueue::new();
        let first = task(&stats);
        let second = task(&stats);
        let (a, b) = (first.id(), second.id());
        queue.push(first);
        queue.push(second);

        assert!(!queue.is_empty());
        assert_eq!(queue.pop().map(|t| t.id()), Some(a));
        assert_eq!(queue.pop().map(|t| t.id()), Some(b));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_park_returns_on_timeout() {
        let queue = ReadyQueue::new();
        let start = Instant::now();
        queue.park(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_park_skipped_when_nonempty() {
        let stats = Arc::new(TaskStats::default());
        let queue = ReadyQueue::new();
        queue.push(task(&stats));
        let start = Instant::now();
        queue.park(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_push_wakes_parked_worker() {
        let stats = Arc::new(TaskStats::default());
        let queue = Arc::new(ReadyQueue::new());
        let q = queue.clone();
        let parker = std::thread::spawn(move || {
            let start = Instant::now();
            q.park(Duration::from_secs(5));
            start.elapsed()
        });

        while queue.parked.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        queue.push(task(&stats));
        assert!(parker.join().unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn test_drain_cancels_on_drop() {
        let stats = Arc::new(TaskStats::default());
        let queue = ReadyQueue::new();
        queue.push(task(&stats));
        queue.push(task(&stats));
        drop(queue.drain());
        assert!(queue.is_empty());
        assert_eq!(stats.in_flight(), 0);
    }
}
