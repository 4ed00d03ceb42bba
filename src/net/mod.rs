//! Networking
//!
//! Wire protocol, transports, reconnect backoff, fallback escalation and
//! the connection manager that ties them together.

mod backoff;
mod fallback;
mod manager;
mod protocol;
mod transport;

pub use backoff::*;
pub use fallback::*;
pub use manager::*;
pub use protocol::*;
pub use transport::*;
