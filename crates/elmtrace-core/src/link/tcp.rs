//! TCP realization of the transport boundary.
//!
//! BlueZ exposes RFCOMM channels as stream sockets, so a TCP stream is the
//! faithful model of the adapter link on the desktop; it is also what the
//! integration tests and the simulated adapter speak.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{LinkListener, LinkProvider, TransportLink};

/// Default timeout for an outbound connection attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for an inbound connection.
const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(10);

/// A connected TCP stream as a [`TransportLink`].
pub struct TcpLink {
    stream: TcpStream,
    peer: String,
}

impl TcpLink {
    /// Wrap an already-connected stream.
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self { stream, peer }
    }
}

impl TransportLink for TcpLink {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(buf)
    }

    fn read_byte(&self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match (&self.stream).read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // shutdown() from another thread surfaces as an error on
                // some platforms and as EOF on others; both mean "gone"
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Listener for inbound links, cancellable from another thread.
///
/// The socket is kept non-blocking and polled so `close()` can unblock a
/// pending `accept` without platform-specific tricks.
pub struct TcpLinkListener {
    listener: TcpListener,
    closed: AtomicBool,
    poll: Duration,
}

impl TcpLinkListener {
    /// Bind to `addr` (use port 0 to let the OS pick).
    pub fn bind(addr: &str, poll: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        tracing::debug!(addr = %listener.local_addr()?, "listening for inbound link");
        Ok(Self {
            listener,
            closed: AtomicBool::new(false),
            poll,
        })
    }

    /// The bound address, useful when binding to an ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl LinkListener for TcpLinkListener {
    fn accept(&self) -> io::Result<Box<dyn TransportLink>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "listener closed",
                ));
            }
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(peer = %addr, "accepted inbound link");
                    return Ok(Box::new(TcpLink::new(stream, addr.to_string())));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(self.poll);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// [`LinkProvider`] over TCP sockets.
#[derive(Debug, Clone)]
pub struct TcpLinkProvider {
    /// Address the passive listener binds to.
    pub listen_addr: String,
    /// Timeout for outbound connection attempts.
    pub connect_timeout: Duration,
    /// Poll interval for the cancellable accept loop.
    pub accept_poll: Duration,
}

impl TcpLinkProvider {
    /// Provider listening on `listen_addr` with default timings.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            accept_poll: DEFAULT_ACCEPT_POLL,
        }
    }
}

impl LinkProvider for TcpLinkProvider {
    fn listen(&self) -> io::Result<Box<dyn LinkListener>> {
        Ok(Box::new(TcpLinkListener::bind(
            &self.listen_addr,
            self.accept_poll,
        )?))
    }

    fn connect(&self, peer: &str) -> io::Result<Box<dyn TransportLink>> {
        let addr = peer
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for peer"))?;
        tracing::debug!(peer = %addr, timeout_ms = self.connect_timeout.as_millis() as u64,
            "dialing outbound link");
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(TcpLink::new(stream, peer.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn close_unblocks_accept() {
        let listener =
            std::sync::Arc::new(TcpLinkListener::bind("127.0.0.1:0", Duration::from_millis(1)).unwrap());
        let l2 = listener.clone();
        let handle = thread::spawn(move || l2.accept().map(|_| ()));
        thread::sleep(Duration::from_millis(20));
        listener.close();
        let res = handle.join().unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn round_trip_over_loopback() {
        let listener = TcpLinkListener::bind("127.0.0.1:0", Duration::from_millis(1)).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let link = listener.accept().unwrap();
            let b = link.read_byte().unwrap().unwrap();
            link.write(&[b + 1]).unwrap();
        });

        let provider = TcpLinkProvider::new("127.0.0.1:0");
        let link = provider.connect(&addr.to_string()).unwrap();
        link.write(&[41]).unwrap();
        assert_eq!(link.read_byte().unwrap(), Some(42));
        server.join().unwrap();
    }

    #[test]
    fn shutdown_unblocks_read() {
        let listener = TcpLinkListener::bind("127.0.0.1:0", Duration::from_millis(1)).unwrap();
        let addr = listener.local_addr().unwrap();

        let provider = TcpLinkProvider::new("127.0.0.1:0");
        let client = thread::spawn(move || provider.connect(&addr.to_string()).unwrap());
        let link = std::sync::Arc::new(listener.accept().unwrap());
        let _peer = client.join().unwrap();

        let l2 = std::sync::Arc::clone(&link);
        let reader = thread::spawn(move || l2.read_byte());
        thread::sleep(Duration::from_millis(20));
        link.shutdown();
        let outcome = reader.join().unwrap();
        // EOF or reset, never a hang
        match outcome {
            Ok(None) => {}
            Ok(Some(b)) => panic!("unexpected byte {b}"),
            Err(_) => {}
        }
    }
}
