//! Integration tests for the executor: scheduling, waits and shutdown

use crossbeam::channel;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tenon_core::{
    from_fn, Action, Context, Coroutine, Executor, ExecutorConfig, ExecutorError, IoSource,
    Outcome, QueuePolicy, TaskError, Wake,
};

fn config(workers: usize) -> ExecutorConfig {
    ExecutorConfig {
        idle_wait: Duration::from_millis(5),
        drain_timeout: Duration::from_secs(2),
        ..ExecutorConfig::with_workers(workers)
    }
}

fn started(config: ExecutorConfig) -> Executor {
    let executor = Executor::new(config).unwrap();
    executor.start().unwrap();
    executor
}

/// Yields `turns` times, tracking how many workers are inside `resume`
struct Instrumented {
    turns: u32,
    inside: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

impl Coroutine for Instrumented {
    fn resume(&mut self, _cx: &mut Context<'_>) -> Action {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        std::hint::spin_loop();
        self.inside.fetch_sub(1, Ordering::SeqCst);

        if self.turns == 0 {
            return Action::done();
        }
        self.turns -= 1;
        Action::Yield
    }
}

fn sleeper(duration: Duration) -> impl Coroutine {
    let mut slept = false;
    from_fn(move |_| {
        if !slept {
            slept = true;
            return Action::sleep(duration);
        }
        Action::done()
    })
}

#[test]
fn test_every_task_reaches_an_outcome() {
    let executor = started(config(4));
    let handles: Vec<_> = (0..500)
        .map(|i| {
            let mut left = i % 5;
            executor
                .submit(from_fn(move |_| {
                    if left == 0 {
                        return Action::done();
                    }
                    left -= 1;
                    Action::Yield
                }))
                .unwrap()
        })
        .collect();

    for handle in handles {
        assert_eq!(
            handle.join_timeout(Duration::from_secs(10)),
            Some(Outcome::Completed)
        );
    }
    assert!(executor.wait_tasks_finished(Duration::from_secs(1)));
    assert_eq!(executor.stats().completed, 500);
    executor.stop().unwrap();
}

#[test]
fn test_task_never_resumed_concurrently() {
    for policy in [QueuePolicy::Fifo, QueuePolicy::WorkStealing] {
        let executor = started(ExecutorConfig {
            policy,
            ..config(4)
        });

        let mut samples = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..64 {
            let inside = Arc::new(AtomicUsize::new(0));
            let max_seen = Arc::new(AtomicUsize::new(0));
            handles.push(
                executor
                    .submit(Instrumented {
                        turns: 200,
                        inside: inside.clone(),
                        max_seen: max_seen.clone(),
                    })
                    .unwrap(),
            );
            samples.push(max_seen);
        }

        for handle in handles {
            assert!(handle.join().is_completed());
        }
        for max_seen in samples {
            assert_eq!(max_seen.load(Ordering::SeqCst), 1, "{:?}", policy);
        }
        executor.stop().unwrap();
    }
}

#[test]
fn test_thousand_timers_finish_together() {
    let executor = started(config(4));
    let start = Instant::now();

    let handles: Vec<_> = (0..1000)
        .map(|_| executor.submit(sleeper(Duration::from_millis(10))).unwrap())
        .collect();
    for handle in handles {
        assert!(handle.join().is_completed());
    }

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(10));
    assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    executor.stop().unwrap();
}

#[test]
fn test_dedicated_poller_fires_timers() {
    let executor = started(ExecutorConfig {
        dedicated_poller: true,
        ..config(2)
    });
    let handles: Vec<_> = (0..50)
        .map(|_| executor.submit(sleeper(Duration::from_millis(5))).unwrap())
        .collect();
    for handle in handles {
        assert!(handle.join().is_completed());
    }
    executor.stop().unwrap();
}

#[test]
fn test_stop_with_tasks_in_flight() {
    let executor = started(config(2));

    let mut handles = Vec::new();
    for _ in 0..100 {
        handles.push(executor.submit(sleeper(Duration::from_secs(60))).unwrap());
    }
    for _ in 0..100 {
        handles.push(executor.submit(from_fn(|_| Action::Yield)).unwrap());
    }
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    executor.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));

    let stats = executor.stats();
    assert_eq!(stats.in_flight(), 0, "{:?}", stats);
    for handle in handles {
        assert_eq!(handle.join(), Outcome::Cancelled);
    }
}

#[test]
fn test_stop_twice_is_stop_once() {
    let executor = started(config(2));
    executor.submit(sleeper(Duration::from_secs(60))).unwrap();

    executor.stop().unwrap();
    let first = executor.stats();
    executor.stop().unwrap();
    assert_eq!(executor.stats(), first);
}

#[test]
fn test_stop_from_another_thread() {
    let executor = Arc::new(started(config(2)));
    let remote = executor.clone();
    thread::spawn(move || remote.stop().unwrap())
        .join()
        .unwrap();
    assert!(matches!(
        executor.submit(from_fn(|_| Action::done())),
        Err(ExecutorError::Stopped)
    ));
}

#[test]
fn test_child_error_propagates_through_executor() {
    let executor = started(config(2));
    let mut awaited = false;
    let handle = executor
        .submit(from_fn(move |cx| {
            if !awaited {
                awaited = true;
                return Action::await_child(sleeper(Duration::from_millis(1)));
            }
            assert_eq!(cx.wake(), Wake::Child);
            Action::await_child(from_fn(|_| Action::fail(TaskError::failed("child"))))
        }))
        .unwrap();
    assert_eq!(handle.join(), Outcome::Failed(TaskError::failed("child")));
    executor.stop().unwrap();
}

#[test]
fn test_panicking_task_does_not_kill_worker() {
    let executor = started(config(1));
    let bad = executor.submit(from_fn(|_| panic!("bad task"))).unwrap();
    assert!(matches!(bad.join(), Outcome::Failed(TaskError::Panicked(_))));

    let good = executor.submit(from_fn(|_| Action::done())).unwrap();
    assert!(good.join().is_completed());
    executor.stop().unwrap();
}

/// Reads whatever arrives first, failing if nothing does before the deadline
struct ReadOnce {
    stream: Option<mio::net::TcpStream>,
    source: Option<IoSource<mio::net::TcpStream>>,
    deadline: Instant,
    wakes: Vec<Wake>,
    out: channel::Sender<(Vec<u8>, Vec<Wake>)>,
}

impl Coroutine for ReadOnce {
    fn resume(&mut self, cx: &mut Context<'_>) -> Action {
        self.wakes.push(cx.wake());
        if let Some(stream) = self.stream.take() {
            match cx.register(stream) {
                Ok(source) => self.source = Some(source),
                Err(err) => return Action::fail(err),
            }
        }
        let Some(source) = self.source.as_mut() else {
            return Action::fail(TaskError::failed("no source"));
        };

        let mut buf = [0u8; 64];
        match source.read(&mut buf) {
            Ok(n) => {
                let _ = self.out.send((buf[..n].to_vec(), self.wakes.clone()));
                Action::done()
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                source.readable(Some(self.deadline))
            }
            Err(err) => Action::fail(err),
        }
    }
}

fn socket_pair() -> (std::net::TcpStream, mio::net::TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (client, mio::net::TcpStream::from_std(server))
}

#[test]
fn test_read_wait_resumes_on_readiness() {
    let executor = started(config(2));
    let (mut client, server) = socket_pair();
    let (tx, rx) = channel::bounded(1);

    let handle = executor
        .submit(ReadOnce {
            stream: Some(server),
            source: None,
            deadline: Instant::now() + Duration::from_secs(10),
            wakes: Vec::new(),
            out: tx,
        })
        .unwrap();

    thread::sleep(Duration::from_millis(30));
    client.write_all(b"hello").unwrap();

    assert!(handle.join().is_completed());
    let (bytes, wakes) = rx.recv().unwrap();
    assert_eq!(bytes, b"hello");
    assert_eq!(wakes.first(), Some(&Wake::Start));
    assert!(wakes[1..].iter().all(|w| *w == Wake::Ready));
    executor.stop().unwrap();
}

#[test]
fn test_read_wait_times_out() {
    let executor = started(config(2));
    let (_client, server) = socket_pair();
    let (tx, rx) = channel::bounded(1);

    let start = Instant::now();
    let handle = executor
        .submit(ReadOnce {
            stream: Some(server),
            source: None,
            deadline: Instant::now() + Duration::from_millis(30),
            wakes: Vec::new(),
            out: tx,
        })
        .unwrap();

    assert_eq!(handle.join(), Outcome::Failed(TaskError::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(rx.try_recv().is_err());
    assert_eq!(executor.registry().source_count(), 0);
    executor.stop().unwrap();
}

#[test]
fn test_work_stealing_spreads_load() {
    let executor = started(ExecutorConfig {
        policy: QueuePolicy::WorkStealing,
        ..config(4)
    });
    let seen = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let seen = seen.clone();
            let mut turns = 50;
            executor
                .submit(from_fn(move |cx| {
                    seen.fetch_or(1 << cx.worker_id(), Ordering::Relaxed);
                    if turns == 0 {
                        return Action::done();
                    }
                    turns -= 1;
                    Action::Yield
                }))
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.join().is_completed());
    }
    assert!(seen.load(Ordering::Relaxed).count_ones() >= 1);
    assert_eq!(executor.stats().completed, 64);
    executor.stop().unwrap();
}

#[test]
fn test_drop_stops_executor() {
    let executor = started(config(1));
    let handle = executor.submit(sleeper(Duration::from_secs(60))).unwrap();
    drop(executor);
    assert_eq!(handle.join(), Outcome::Cancelled);
}
