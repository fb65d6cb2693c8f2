//! Public HTTP front door for burrow
//!
//! Resolves tenants from the Host header, relays their traffic through the
//! tenant's client, and serves the control API on the bare domain.
pub mod api;
pub mod host;
pub mod server;
pub mod sniff;

pub use host::{normalize_host, HostResolver};
pub use server::{DispatchServer, ServerConfig, ServerError};
