//! Connection lifecycle: state machine, manager and observer events.

mod events;
mod manager;

pub use events::ConnectionEvent;
pub use manager::{ConnectionManager, ConnectionState, ManagerConfig};
