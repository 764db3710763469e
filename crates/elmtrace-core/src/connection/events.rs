//! Observer notifications
//!
//! The core pushes events into an mpsc channel and assumes nothing about
//! the thread that consumes them; the UI layer (out of scope here) is the
//! intended receiver.

use serde::{Deserialize, Serialize};

use super::ConnectionState;

/// Notification pushed to the observer on state transitions and data flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A link was established; carries the peer identity.
    DeviceIdentified(String),
    /// Bytes were written to the link (for echo/logging by the UI).
    BytesSent(Vec<u8>),
    /// A framed response arrived; carries the payload and its length.
    BytesReceived(Vec<u8>, usize),
    /// A user-facing message (connection failed, connection lost, ...).
    Notice(String),
}
