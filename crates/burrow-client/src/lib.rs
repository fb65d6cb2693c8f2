//! Per-tenant relay for burrow
//!
//! A [`Client`] turns public HTTP requests and upgrade requests into traffic
//! on the tenant's tunnel sockets, and closes itself when the tunnel stays
//! disconnected longer than its grace period.
pub mod client;
pub mod error;
pub mod grace;
pub mod relay;
pub mod upgrade;

pub use client::Client;
pub use error::ClientError;
pub use grace::{GraceTimer, DEFAULT_GRACE_PERIOD};
pub use relay::RelayBody;
pub use upgrade::{PublicStream, UpgradeRequest};
