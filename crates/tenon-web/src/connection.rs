//! Byte streams the pipeline can drive

use mio::event::Source;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

/// A non-blocking, readiness-driven byte stream
///
/// Reads and writes must return `WouldBlock` instead of blocking; the
/// pipeline suspends on the wait registry until the stream is ready again.
pub trait Connection: Read + Write + Source + Send + 'static {
    /// Shut down one or both halves
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// Address of the remote end
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Connection for mio::net::TcpStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }
}
