//! Wait registry: parked tasks and the conditions that wake them
//!
//! Two kinds of conditions are tracked:
//!
//! - **Readiness** of registered I/O sources, observed through one shared
//!   `mio::Poll`. Sources are registered edge-triggered for both directions
//!   once, when an [`IoSource`] is created. An event that arrives while no
//!   task waits on that direction is remembered as a sticky flag and
//!   consumed by the next waiter, so an edge is never lost between a
//!   `WouldBlock` and the suspension that follows it.
//! - **Deadlines**, kept in a min-heap: plain sleeps, and timeouts attached
//!   to readiness waits.
//!
//! A parked `Box<Task>` lives in exactly one place (a source slot or the
//! heap). Whichever pass takes it out hands it back to the caller, which is
//! what makes every wait fire exactly once. A timeout entry for a readiness
//! wait only names the wait by id; if the readiness fired first the id no
//! longer matches and the entry is skipped.

use crate::error::TaskError;
use crate::task::{Action, SuspendReason, Task, TaskState, Wake};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token reserved for the poller's waker
const WAKER: Token = Token(0);

/// Capacity of the event buffer filled by one poll
const EVENTS_CAPACITY: usize = 1024;

/// Identifies a source registered with the wait registry
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SourceToken(usize);

impl SourceToken {
    /// Raw token value
    pub fn as_usize(self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

struct IoWaiter {
    wait_id: u64,
    task: Box<Task>,
}

/// Readiness state of one registered source
#[derive(Default)]
struct SourceSlot {
    readable: bool,
    writable: bool,
    reader: Option<IoWaiter>,
    writer: Option<IoWaiter>,
}

impl SourceSlot {
    fn flag_mut(&mut self, direction: Direction) -> &mut bool {
        match direction {
            Direction::Read => &mut self.readable,
            Direction::Write => &mut self.writable,
        }
    }

    fn waiter_mut(&mut self, direction: Direction) -> &mut Option<IoWaiter> {
        match direction {
            Direction::Read => &mut self.reader,
            Direction::Write => &mut self.writer,
        }
    }

    /// Wake the waiter for `direction`, or remember the edge
    fn fire(&mut self, direction: Direction, woken: &mut Vec<Box<Task>>) {
        match self.waiter_mut(direction).take() {
            Some(mut waiter) => {
                waiter.task.set_wake(Wake::Ready);
                woken.push(waiter.task);
            }
            None => *self.flag_mut(direction) = true,
        }
    }
}

enum TimerKind {
    /// A sleeping task
    Sleep(Box<Task>),
    /// Timeout of a readiness wait
    Deadline {
        source: SourceToken,
        direction: Direction,
        wait_id: u64,
    },
}

/// Entry in the timer heap
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    kind: TimerKind,
}

// Reverse ordering for min-heap (earliest deadline first, then insertion order)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct PollState {
    poll: Poll,
    events: Events,
}

/// Parks suspended tasks and hands them back once their condition holds
pub struct WaitRegistry {
    /// Only one thread runs the readiness pass at a time
    poller: Mutex<PollState>,
    /// Registration handle shared with `IoSource`s
    registry: Registry,
    /// Interrupts a blocking poll
    waker: Waker,
    /// Set while some thread is blocked in `poll`
    polling: AtomicBool,
    /// Registered sources by token
    sources: Mutex<FxHashMap<usize, SourceSlot>>,
    next_token: AtomicUsize,
    /// Sleeps and readiness deadlines
    timers: Mutex<BinaryHeap<TimerEntry>>,
    next_seq: AtomicU64,
}

impl WaitRegistry {
    /// Create a registry with its own readiness poller
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        Ok(Self {
            poller: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            }),
            registry,
            waker,
            polling: AtomicBool::new(false),
            sources: Mutex::new(FxHashMap::default()),
            next_token: AtomicUsize::new(WAKER.0 + 1),
            timers: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(1),
        })
    }

    /// Register a source for read and write readiness
    pub fn register<S: Source>(this: &Arc<Self>, mut source: S) -> io::Result<IoSource<S>> {
        let token = this.next_token.fetch_add(1, AtomicOrdering::Relaxed);
        this.sources.lock().insert(token, SourceSlot::default());

        if let Err(err) = this.registry.register(
            &mut source,
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            this.sources.lock().remove(&token);
            return Err(err);
        }

        log::trace!("registered source {}", token);
        Ok(IoSource {
            source,
            token: SourceToken(token),
            registry: Arc::clone(this),
        })
    }

    /// Park a task until `reason` holds
    ///
    /// Returns the task back when the condition already holds (a remembered
    /// readiness edge, a deadline in the past, or a source that is gone);
    /// the caller must then schedule it.
    pub(crate) fn park(&self, mut task: Box<Task>, reason: SuspendReason) -> Option<Box<Task>> {
        let now = Instant::now();
        match reason {
            SuspendReason::Sleep { until } => {
                if until <= now {
                    task.set_wake(Wake::Ready);
                    return Some(task);
                }
                task.set_state(TaskState::Waiting);
                self.push_timer(until, TimerKind::Sleep(task));
                None
            }
            SuspendReason::Readable { source, deadline } => {
                self.park_io(task, source, Direction::Read, deadline, now)
            }
            SuspendReason::Writable { source, deadline } => {
                self.park_io(task, source, Direction::Write, deadline, now)
            }
        }
    }

    fn park_io(
        &self,
        mut task: Box<Task>,
        source: SourceToken,
        direction: Direction,
        deadline: Option<Instant>,
        now: Instant,
    ) -> Option<Box<Task>> {
        if deadline.is_some_and(|d| d <= now) {
            task.set_error(TaskError::TimedOut);
            return Some(task);
        }

        let mut sources = self.sources.lock();
        let Some(slot) = sources.get_mut(&source.0) else {
            drop(sources);
            task.set_error(TaskError::Io {
                kind: io::ErrorKind::NotConnected,
                message: format!("source {} is not registered", source.0),
            });
            return Some(task);
        };

        let flag = slot.flag_mut(direction);
        if *flag {
            *flag = false;
            drop(sources);
            task.set_wake(Wake::Ready);
            return Some(task);
        }

        let wait_id = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        task.set_state(TaskState::Waiting);
        let displaced = slot
            .waiter_mut(direction)
            .replace(IoWaiter { wait_id, task });
        drop(sources);

        if let Some(displaced) = displaced {
            log::warn!(
                "{} displaced from {:?} wait on source {}",
                displaced.task.id(),
                direction,
                source.0
            );
        }

        if let Some(deadline) = deadline {
            self.push_timer(
                deadline,
                TimerKind::Deadline {
                    source,
                    direction,
                    wait_id,
                },
            );
        }
        None
    }

    fn push_timer(&self, deadline: Instant, kind: TimerKind) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut timers = self.timers.lock();
        let earliest = timers.peek().map_or(true, |e| deadline < e.deadline);
        timers.push(TimerEntry {
            deadline,
            seq,
            kind,
        });
        drop(timers);

        // A blocked poller computed its timeout from the old head
        if earliest {
            self.notify();
        }
    }

    /// Interrupt a blocked poll, if any
    pub(crate) fn notify(&self) {
        atomic::fence(AtomicOrdering::SeqCst);
        if self.polling.load(AtomicOrdering::SeqCst) {
            self.wake();
        }
    }

    /// Unconditionally interrupt the next or current poll
    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            log::warn!("failed to wake poller: {}", err);
        }
    }

    /// Run one readiness + timer pass
    ///
    /// Blocks for at most `max_wait`, less if a deadline is due sooner, and
    /// not at all when `has_work` reports queued tasks. Returns `None` when
    /// another thread is already polling; otherwise the tasks whose
    /// conditions fired, in no particular order.
    pub(crate) fn poll(
        &self,
        max_wait: Duration,
        has_work: impl Fn() -> bool,
    ) -> Option<Vec<Box<Task>>> {
        let mut state = self.poller.try_lock()?;

        self.polling.store(true, AtomicOrdering::SeqCst);
        atomic::fence(AtomicOrdering::SeqCst);

        let mut timeout = max_wait;
        if let Some(next) = self.next_deadline() {
            timeout = timeout.min(next.saturating_duration_since(Instant::now()));
        }
        if has_work() {
            timeout = Duration::ZERO;
        }

        let PollState { poll, events } = &mut *state;
        if let Err(err) = poll.poll(events, Some(timeout)) {
            if err.kind() != io::ErrorKind::Interrupted {
                log::warn!("readiness poll failed: {}", err);
            }
        }
        self.polling.store(false, AtomicOrdering::SeqCst);

        let mut woken = Vec::new();
        {
            let mut sources = self.sources.lock();
            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                // Events for sources dropped since the poll are stale
                let Some(slot) = sources.get_mut(&token.0) else {
                    continue;
                };
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    slot.fire(Direction::Read, &mut woken);
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    slot.fire(Direction::Write, &mut woken);
                }
            }
        }
        drop(state);

        self.fire_timers(Instant::now(), &mut woken);
        Some(woken)
    }

    fn fire_timers(&self, now: Instant, woken: &mut Vec<Box<Task>>) {
        let mut due = Vec::new();
        {
            let mut timers = self.timers.lock();
            while timers.peek().is_some_and(|e| e.deadline <= now) {
                if let Some(entry) = timers.pop() {
                    due.push(entry.kind);
                }
            }
        }

        for kind in due {
            match kind {
                TimerKind::Sleep(mut task) => {
                    task.set_wake(Wake::Ready);
                    woken.push(task);
                }
                TimerKind::Deadline {
                    source,
                    direction,
                    wait_id,
                } => {
                    let mut sources = self.sources.lock();
                    let Some(slot) = sources.get_mut(&source.0) else {
                        continue;
                    };
                    let waiter = slot.waiter_mut(direction);
                    if waiter.as_ref().is_some_and(|w| w.wait_id == wait_id) {
                        if let Some(mut waiter) = waiter.take() {
                            waiter.task.set_error(TaskError::TimedOut);
                            woken.push(waiter.task);
                        }
                    }
                }
            }
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock().peek().map(|e| e.deadline)
    }

    /// Remove every parked task, for cancellation at shutdown
    pub(crate) fn drain(&self) -> Vec<Box<Task>> {
        let mut tasks = Vec::new();
        {
            let mut sources = self.sources.lock();
            for slot in sources.values_mut() {
                tasks.extend(slot.reader.take().map(|w| w.task));
                tasks.extend(slot.writer.take().map(|w| w.task));
            }
        }
        {
            let mut timers = self.timers.lock();
            for entry in timers.drain() {
                if let TimerKind::Sleep(task) = entry.kind {
                    tasks.push(task);
                }
            }
        }
        tasks
    }

    /// Number of registered sources
    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Number of pending timer entries, including stale readiness deadlines
    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }
}

/// An I/O source registered with a [`WaitRegistry`]
///
/// Owns the source. Dropping it deregisters the source and frees its slot.
pub struct IoSource<S: Source> {
    source: S,
    token: SourceToken,
    registry: Arc<WaitRegistry>,
}

impl<S: Source> IoSource<S> {
    /// Token identifying this source in suspend reasons
    pub fn token(&self) -> SourceToken {
        self.token
    }

    /// Borrow the source
    pub fn get_ref(&self) -> &S {
        &self.source
    }

    /// Mutably borrow the source
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Suspend until readable
    pub fn readable(&self, deadline: Option<Instant>) -> Action {
        Action::Suspend(SuspendReason::Readable {
            source: self.token,
            deadline,
        })
    }

    /// Suspend until writable
    pub fn writable(&self, deadline: Option<Instant>) -> Action {
        Action::Suspend(SuspendReason::Writable {
            source: self.token,
            deadline,
        })
    }
}

impl<S: Source> Deref for IoSource<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.source
    }
}

impl<S: Source> DerefMut for IoSource<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: Source> Drop for IoSource<S> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.registry.deregister(&mut self.source) {
            log::trace!("deregistering source {}: {}", self.token.0, err);
        }
        let slot = self.registry.sources.lock().remove(&self.token.0);
        // Waiters still parked here are cancelled outside the lock
        drop(slot);
    }
}

impl<S: Source + std::fmt::Debug> std::fmt::Debug for IoSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSource")
            .field("token", &self.token)
            .field("source", &self.source)
            .finish()
    }
}
