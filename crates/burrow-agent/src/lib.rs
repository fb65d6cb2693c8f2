//! Tunnel socket pooling for burrow
//!
//! Each tenant owns one [`TunnelAgent`]: a listener on an ephemeral port that
//! the remote tunnel client dials into, and a bounded pool of the sockets it
//! contributes. Relays borrow sockets through the [`ConnectionSource`]
//! capability.
pub mod agent;
pub mod error;
pub mod socket;
pub mod source;

pub use agent::{AgentConfig, AgentEvent, AgentEvents, TunnelAgent, DEFAULT_MAX_SOCKETS};
pub use error::{is_benign_io_error, AgentError};
pub use socket::TunnelSocket;
pub use source::{AgentStats, ConnectionSource};
