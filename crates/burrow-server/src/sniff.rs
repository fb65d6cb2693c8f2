//! First-request sniffing for public connections
//!
//! Upgrade requests are relayed as raw bytes, everything else goes through
//! hyper. To tell them apart the first request head is read off the socket
//! and inspected; the bytes are then replayed in front of the socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use burrow_client::{PublicStream, UpgradeRequest};

/// Largest request head we are willing to buffer while sniffing
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Read from `stream` until one full request head is buffered, the peer
/// stops sending, the head turns out to be malformed, or `MAX_HEAD_SIZE` is
/// reached. Whatever was read is returned; an empty buffer means the peer
/// closed without sending anything.
pub async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD_SIZE => continue,
            _ => return Ok(buf),
        }
    }
}

/// A parsed upgrade request and where its head ends in the buffer
#[derive(Debug)]
pub struct SniffedUpgrade {
    pub request: UpgradeRequest,
    pub host: Option<String>,
    pub head_len: usize,
}

/// Returns the upgrade request at the start of `buf`, if it is one
pub fn parse_upgrade(buf: &[u8]) -> Option<SniffedUpgrade> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        _ => return None,
    };

    let request = UpgradeRequest {
        method: req.method?.to_string(),
        target: req.path?.to_string(),
        version: req.version?,
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    };

    let connection_upgrade = request
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .filter_map(|(_, value)| std::str::from_utf8(value).ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !connection_upgrade || request.header("upgrade").is_none() {
        return None;
    }

    let host = request
        .header("host")
        .and_then(|v| std::str::from_utf8(v).ok())
        .map(str::to_owned);

    Some(SniffedUpgrade {
        request,
        host,
        head_len,
    })
}

/// A stream that yields `prefix` before reading from `inner`
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl PublicStream for PrefixedStream<TcpStream> {
    fn is_open(&self) -> bool {
        self.prefix.has_remaining() || self.inner.is_open()
    }
}
