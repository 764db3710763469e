//! Transport boundary
//!
//! A [`TransportLink`] is one established bidirectional byte stream to a peer
//! (the adapter or another phone). It carries no protocol knowledge; framing
//! and decoding live in [`crate::protocol`].
//!
//! I/O methods take `&self` so the read and write sides may be driven from
//! different threads while the connection manager's mutex guards only the
//! state and the current-link pointer.

mod serial;
mod tcp;

pub use serial::{SerialLink, SerialLinkProvider};
pub use tcp::{TcpLink, TcpLinkListener, TcpLinkProvider};

use std::io;
use uuid::{uuid, Uuid};

/// RFCOMM service UUID for the ELM327 adapter (standard Serial Port Profile).
pub const ADAPTER_SERVICE_UUID: Uuid = uuid!("00001101-0000-1000-8000-00805F9B34FB");

/// RFCOMM service UUID used when the peer is another phone rather than an
/// adapter. One role is picked per deployment; it is never negotiated.
pub const PEER_PHONE_SERVICE_UUID: Uuid = uuid!("fa87c0d0-afac-11de-8a39-0800200c9a66");

/// Which peer role this deployment talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkRole {
    /// ELM327 OBD-II adapter (SPP).
    #[default]
    Adapter,
    /// Another phone running the same software.
    PeerPhone,
}

impl LinkRole {
    /// The RFCOMM service UUID advertised/dialed for this role.
    pub fn service_uuid(&self) -> Uuid {
        match self {
            LinkRole::Adapter => ADAPTER_SERVICE_UUID,
            LinkRole::PeerPhone => PEER_PHONE_SERVICE_UUID,
        }
    }
}

/// One established byte stream to a peer.
pub trait TransportLink: Send + Sync {
    /// Identity of the remote peer (device name, address or port path).
    fn peer(&self) -> &str;

    /// Write the whole buffer to the peer.
    fn write(&self, buf: &[u8]) -> io::Result<()>;

    /// Blocking read of a single byte.
    ///
    /// Returns `Ok(None)` when the stream is exhausted or the link has been
    /// shut down. `shutdown()` from another thread must unblock a pending
    /// read rather than leave it hanging.
    fn read_byte(&self) -> io::Result<Option<u8>>;

    /// Close both directions. Idempotent.
    fn shutdown(&self);
}

/// Passive side of link establishment.
pub trait LinkListener: Send + Sync {
    /// Block until an inbound connection arrives or the listener is closed.
    ///
    /// A closed listener yields `ErrorKind::Interrupted`.
    fn accept(&self) -> io::Result<Box<dyn TransportLink>>;

    /// Stop accepting. Unblocks a pending `accept`. Idempotent.
    fn close(&self);
}

impl std::fmt::Debug for dyn LinkListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn LinkListener")
    }
}

/// Factory for both establishment paths.
///
/// The connection manager races a passive listener against at most one
/// outbound attempt; this trait lets tests substitute scripted links for the
/// real RFCOMM/TCP transports.
pub trait LinkProvider: Send + Sync {
    /// Create a listener for inbound connections.
    fn listen(&self) -> io::Result<Box<dyn LinkListener>>;

    /// Dial an outbound connection to `peer`. Blocks until the handshake
    /// completes or fails; the provider should bound this with a timeout.
    fn connect(&self, peer: &str) -> io::Result<Box<dyn TransportLink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_uuids_are_distinct() {
        assert_ne!(
            LinkRole::Adapter.service_uuid(),
            LinkRole::PeerPhone.service_uuid()
        );
        assert_eq!(
            LinkRole::Adapter.service_uuid().to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }
}
