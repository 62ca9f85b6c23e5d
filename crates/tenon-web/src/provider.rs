//! Sources of accepted connections

use crate::connection::Connection;
use crate::params::ParameterMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::thread;
use std::time::Duration;

const LISTENER: Token = Token(0);

/// Hands out accepted connections to the server loop
pub trait ConnectionProvider: Send + Sync + 'static {
    /// Next accepted connection with its parameters
    ///
    /// Waits a bounded time and returns `None` if nothing arrived, so the
    /// caller can re-check whether it should keep running.
    fn get(&self) -> Option<(Box<dyn Connection>, ParameterMap)>;

    /// Shut down a connection that will not be served
    fn invalidate(&self, connection: &dyn Connection) {
        if let Err(err) = connection.shutdown(Shutdown::Both) {
            log::trace!("invalidate: {}", err);
        }
    }
}

struct AcceptPoll {
    poll: Poll,
    events: Events,
}

/// Accepts TCP connections from a non-blocking listener
pub struct TcpConnectionProvider {
    listener: TcpListener,
    poll: Mutex<AcceptPoll>,
    local_addr: SocketAddr,
    params: ParameterMap,
    accept_wait: Duration,
}

impl TcpConnectionProvider {
    /// Bind a listener
    ///
    /// Port 0 picks a free port; see [`TcpConnectionProvider::local_addr`].
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;
        log::info!("listening on {}", local_addr);

        Ok(Self {
            listener,
            poll: Mutex::new(AcceptPoll {
                poll,
                events: Events::with_capacity(16),
            }),
            local_addr,
            params: ParameterMap::new().with("local_addr", local_addr.to_string()),
            accept_wait: Duration::from_millis(100),
        })
    }

    /// How long `get` waits for a connection before returning `None`
    pub fn with_accept_wait(mut self, wait: Duration) -> Self {
        self.accept_wait = wait;
        self
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl ConnectionProvider for TcpConnectionProvider {
    fn get(&self) -> Option<(Box<dyn Connection>, ParameterMap)> {
        let mut state = self.poll.lock();
        let mut waited = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        log::debug!("TCP_NODELAY on {}: {}", peer, err);
                    }
                    log::trace!("accepted {}", peer);
                    let params = self.params.with("peer_addr", peer.to_string());
                    let connection: Box<dyn Connection> = Box::new(stream);
                    return Some((connection, params));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if waited {
                        return None;
                    }
                    let AcceptPoll { poll, events } = &mut *state;
                    if let Err(err) = poll.poll(events, Some(self.accept_wait)) {
                        if err.kind() != io::ErrorKind::Interrupted {
                            log::warn!("listener poll failed: {}", err);
                        }
                    }
                    waited = true;
                }
                Err(err) => {
                    // e.g. out of file descriptors; back off instead of spinning
                    log::warn!("accept failed: {}", err);
                    drop(state);
                    thread::sleep(self.accept_wait);
                    return None;
                }
            }
        }
    }
}

impl std::fmt::Debug for TcpConnectionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnectionProvider")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
