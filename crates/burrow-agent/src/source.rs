//! Connection source capability
//!
//! A relay never dials the remote tunnel client itself: it asks a source for
//! an already-established socket and hands it back when done. `TunnelAgent`
//! is the production source; tests plug in in-memory ones.

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::AgentError;

/// Point-in-time view of a source's pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub connected_sockets: usize,
}

#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    type Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Obtain one socket for one relay call.
    ///
    /// Resolves immediately with an idle socket when one exists, otherwise
    /// waits in FIFO order for the next one. Fails with
    /// [`AgentError::Closed`] once the source is torn down.
    async fn create_connection(&self) -> Result<Self::Connection, AgentError>;

    /// Return a socket that is still usable after a relay call.
    fn recycle(&self, conn: Self::Connection) {
        drop(conn);
    }

    fn stats(&self) -> AgentStats;

    /// Tear the source down. Must be idempotent.
    fn destroy(&self);
}
