//! ELM327 command/response protocol
//!
//! Outbound messages are ASCII command strings terminated by a single
//! carriage return. Inbound responses are arbitrary-length ASCII terminated
//! by the `>` prompt; there is no length prefix, framing is entirely
//! character-driven.

pub mod commands;
mod error;
pub mod framer;

pub use commands::{CommandInvocation, ObdCommand};
pub use error::ProtocolError;

/// Prompt byte marking the end of an adapter response. Never part of the
/// payload handed to callers.
pub const PROMPT: u8 = b'>';

/// Terminator appended to every outbound command.
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Default pause between sending a command and issuing the framed read,
/// accommodating slow adapters.
pub const DEFAULT_RESPONSE_DELAY: std::time::Duration = std::time::Duration::ZERO;
