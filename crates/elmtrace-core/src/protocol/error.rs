//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the adapter.
///
/// Protocol-level anomalies (non-hex responses, short buffers) are not
/// errors: the framer forwards them and the decoder yields a "no data"
/// value, per the recovery policy of the command layer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Write or framed read attempted with no current link.
    #[error("not connected to adapter")]
    NotConnected,

    /// The active link failed mid-session.
    #[error("device connection was lost")]
    ConnectionLost,

    /// The passive listener could not be created.
    #[error("listen failed: {0}")]
    ListenFailed(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
