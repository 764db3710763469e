//! # elmtrace Core Library
//!
//! Talks to ELM327-family OBD-II adapters over a serial-style link.
//!
//! This library provides:
//! - Connection lifecycle management (listen, connect, recover)
//! - The ELM327 command catalog and response decoding
//! - Prompt-terminated response framing and noise stripping
//! - Periodic sampling of live vehicle data
//! - Append-only measurement persistence
//! - A scripted adapter simulator for hardware-free testing
//!
//! ## Example
//!
//! ```rust,ignore
//! use elmtrace_core::prelude::*;
//! use std::time::Duration;
//!
//! let provider = TcpLinkProvider::new("0.0.0.0:35000");
//! let (manager, events) = ConnectionManager::new(provider, ManagerConfig::default());
//! manager.connect("192.168.0.10:35000");
//!
//! let rpm = ObdCommand::EngineRpm.run(&manager, Duration::ZERO)?;
//! println!("{}", rpm.formatted_result());
//! ```

#![warn(missing_docs)]

pub mod connection;
pub mod link;
pub mod protocol;
pub mod sampler;
pub mod sim;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::connection::{
        ConnectionEvent, ConnectionManager, ConnectionState, ManagerConfig,
    };
    pub use crate::link::{
        LinkListener, LinkProvider, LinkRole, SerialLinkProvider, TcpLinkProvider, TransportLink,
    };
    pub use crate::protocol::{CommandInvocation, ObdCommand, ProtocolError};
    pub use crate::sampler::{SampleMode, SamplerConfig, SamplerHandle, SamplerReport};
    pub use crate::storage::SessionLog;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
