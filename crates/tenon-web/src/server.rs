//! Accept loop tying a connection provider to a connection handler

use crate::handler::ConnectionHandler;
use crate::provider::ConnectionProvider;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

/// Lifecycle of a [`Server`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerStatus {
    /// Constructed, not running
    Created = 0,
    /// `run` called, loop not entered yet
    Starting = 1,
    /// Accepting connections
    Running = 2,
    /// `stop` called, loop finishing its current wait
    Stopping = 3,
    /// Loop exited
    Done = 4,
}

impl ServerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerStatus::Created,
            1 => ServerStatus::Starting,
            2 => ServerStatus::Running,
            3 => ServerStatus::Stopping,
            _ => ServerStatus::Done,
        }
    }
}

/// Server lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `run` while another `run` is starting up
    #[error("server already starting")]
    AlreadyStarting,

    /// `run` while the loop is running
    #[error("server already started")]
    AlreadyStarted,

    /// `run` after the server stopped
    #[error("server stopped")]
    Stopped,

    /// Spawning the accept thread failed
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

struct Inner {
    provider: Arc<dyn ConnectionProvider>,
    handler: Arc<dyn ConnectionHandler>,
    status: AtomicU8,
}

impl Inner {
    fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ServerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn transition(&self, from: ServerStatus, to: ServerStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn main_loop(&self) {
        self.transition(ServerStatus::Starting, ServerStatus::Running);
        log::info!("server running");

        while self.status() == ServerStatus::Running {
            let Some((connection, params)) = self.provider.get() else {
                continue;
            };
            if self.status() == ServerStatus::Running {
                self.handler.handle_connection(connection, params);
            } else {
                log::debug!("server already stopped, closing connection");
                self.provider.invalidate(connection.as_ref());
            }
        }

        self.set_status(ServerStatus::Done);
        log::info!("server stopped");
    }
}

/// Runs the accept loop: takes connections from a provider and hands them
/// to a handler while running
///
/// Stopping the server stops accepting; stopping the handler (and with it
/// the connections in progress) is up to the caller.
pub struct Server {
    inner: Arc<Inner>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    lifecycle: Mutex<()>,
}

impl Server {
    /// Create a server; nothing runs until [`Server::run`]
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                handler,
                status: AtomicU8::new(ServerStatus::Created as u8),
            }),
            thread: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Run the accept loop
    ///
    /// With `threaded` the loop runs on a `tenon-accept` thread and this
    /// returns immediately; otherwise it blocks until another thread calls
    /// [`Server::stop`].
    pub fn run(&self, threaded: bool) -> Result<(), ServerError> {
        let lifecycle = self.lifecycle.lock();
        match self.inner.status() {
            ServerStatus::Created => {}
            ServerStatus::Starting => return Err(ServerError::AlreadyStarting),
            ServerStatus::Running => return Err(ServerError::AlreadyStarted),
            ServerStatus::Stopping | ServerStatus::Done => return Err(ServerError::Stopped),
        }
        self.inner.set_status(ServerStatus::Starting);

        if threaded {
            let inner = self.inner.clone();
            let spawned = thread::Builder::new()
                .name("tenon-accept".to_string())
                .spawn(move || inner.main_loop());
            match spawned {
                Ok(handle) => *self.thread.lock() = Some(handle),
                Err(err) => {
                    self.inner.set_status(ServerStatus::Done);
                    return Err(err.into());
                }
            }
        } else {
            drop(lifecycle);
            self.inner.main_loop();
        }
        Ok(())
    }

    /// Stop accepting connections
    ///
    /// Joins the accept thread when the server was run threaded. Safe to
    /// call repeatedly and before `run`.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock();
        match self.inner.status() {
            ServerStatus::Created => return,
            ServerStatus::Starting | ServerStatus::Running => {
                self.inner.set_status(ServerStatus::Stopping);
            }
            ServerStatus::Stopping | ServerStatus::Done => {}
        }

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("accept thread panicked");
            }
        }
    }

    /// Current status
    pub fn status(&self) -> ServerStatus {
        self.inner.status()
    }

    /// The connection handler
    pub fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.inner.handler
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::params::ParameterMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct NoConnections;

    impl ConnectionProvider for NoConnections {
        fn get(&self) -> Option<(Box<dyn Connection>, ParameterMap)> {
            thread::sleep(Duration::from_millis(5));
            None
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        handled: AtomicUsize,
    }

    impl ConnectionHandler for CountingHandler {
        fn handle_connection(&self, _stream: Box<dyn Connection>, _params: ParameterMap) {
            self.handled.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {}
    }

    fn server() -> Server {
        Server::new(Arc::new(NoConnections), Arc::new(CountingHandler::default()))
    }

    #[test]
    fn test_threaded_run_and_stop() {
        let server = server();
        assert_eq!(server.status(), ServerStatus::Created);
        server.run(true).unwrap();
        assert!(matches!(
            server.run(true),
            Err(ServerError::AlreadyStarting | ServerError::AlreadyStarted)
        ));

        server.stop();
        assert_eq!(server.status(), ServerStatus::Done);
        server.stop();
        assert!(matches!(server.run(true), Err(ServerError::Stopped)));
    }

    #[test]
    fn test_stop_before_run_is_noop() {
        let server = server();
        server.stop();
        assert_eq!(server.status(), ServerStatus::Created);
    }

    #[test]
    fn test_blocking_run_returns_after_stop() {
        let server = Arc::new(server());
        let runner = server.clone();
        let loop_thread = thread::spawn(move || runner.run(false));

        while server.status() != ServerStatus::Running {
            thread::sleep(Duration::from_millis(1));
        }
        server.stop();
        loop_thread.join().unwrap().unwrap();
        assert_eq!(server.status(), ServerStatus::Done);
    }
}
