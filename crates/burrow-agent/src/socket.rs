//! Pooled tunnel socket

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::agent::Shared;

/// A raw TCP connection contributed by the remote tunnel client.
///
/// Dropping it closes the connection and releases its slot in the agent's
/// connected-socket count. Once the owning agent is destroyed every read or
/// write fails with `ConnectionAborted`.
pub struct TunnelSocket {
    pub(crate) stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    guard: SocketGuard,
}

impl TunnelSocket {
    pub(crate) fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        id: u64,
        agent: Weak<Shared>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stream,
            peer_addr,
            cancelled: Box::pin(shutdown.clone().cancelled_owned()),
            shutdown,
            guard: SocketGuard { id, agent },
        }
    }

    /// Identifier of this socket within its agent
    pub fn id(&self) -> u64 {
        self.guard.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        self.shutdown.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready()
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel agent destroyed")
}

impl AsyncRead for TunnelSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for TunnelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSocket")
            .field("id", &self.guard.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Releases the socket's slot when the socket goes away
struct SocketGuard {
    id: u64,
    agent: Weak<Shared>,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.agent.upgrade() {
            shared.release(self.id);
        }
    }
}
