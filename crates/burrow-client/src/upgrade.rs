//! Raw protocol-upgrade relay
//!
//! Upgrade requests bypass the HTTP client entirely: the request head is
//! written back out byte-for-byte on a tunnel socket and the two connections
//! are spliced for the rest of their lives.

use futures::FutureExt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use burrow_agent::is_benign_io_error;

/// Request head of an inbound upgrade, as it arrived on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    /// Request target exactly as sent (path and query)
    pub target: String,
    /// HTTP/1 minor version
    pub version: u8,
    /// Raw header pairs in arrival order, original casing preserved
    pub headers: Vec<(String, Vec<u8>)>,
}

impl UpgradeRequest {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Serialize the head for the tunnel side, terminated by an empty line
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// The public side of an upgraded connection
pub trait PublicStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Whether the peer can still exchange bytes
    fn is_open(&self) -> bool {
        true
    }
}

impl PublicStream for TcpStream {
    fn is_open(&self) -> bool {
        let mut peek_buf = [0u8; 1];
        match self.peek(&mut peek_buf).now_or_never() {
            Some(Ok(0)) | Some(Err(_)) => false,
            Some(Ok(_)) | None => true,
        }
    }
}

impl PublicStream for DuplexStream {}

pub(crate) fn log_relay_result(result: io::Result<(u64, u64)>) {
    match result {
        Ok((from_public, from_tunnel)) => {
            debug!(from_public, from_tunnel, "Relay finished");
        }
        Err(e) if is_benign_io_error(&e) => debug!(error = %e, "Relay ended by peer"),
        Err(e) => warn!(error = %e, "Relay failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_is_reconstructed_verbatim() {
        let request = UpgradeRequest {
            method: "GET".to_string(),
            target: "/chat?room=1".to_string(),
            version: 1,
            headers: vec![
                ("Host".to_string(), b"demo.example.com".to_vec()),
                ("Upgrade".to_string(), b"websocket".to_vec()),
                ("Connection".to_string(), b"Upgrade".to_vec()),
                ("X-Dup".to_string(), b"a".to_vec()),
                ("x-dup".to_string(), b"b".to_vec()),
            ],
        };

        assert_eq!(
            request.to_bytes(),
            b"GET /chat?room=1 HTTP/1.1\r\n\
              Host: demo.example.com\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              X-Dup: a\r\n\
              x-dup: b\r\n\
              \r\n"
                .to_vec()
        );
        assert_eq!(request.header("upgrade"), Some(&b"websocket"[..]));
    }

    #[tokio::test]
    async fn test_tcp_stream_reports_closed_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        assert!(server.is_open());

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server.readable().await.unwrap();
        assert!(!server.is_open());
    }
}
