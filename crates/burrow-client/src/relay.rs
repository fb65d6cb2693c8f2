//! HTTP relay over a borrowed tunnel socket
//!
//! Uses hyper's HTTP/1 client connection directly on the socket so request
//! and response bodies stream frame by frame. When the exchange is over the
//! connection is taken apart again: the socket goes back to the pool, or on
//! `101 Switching Protocols` gets spliced with the public connection.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http::{header, Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use hyper::client::conn::http1::Parts;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::debug;

use crate::upgrade::log_relay_result;

/// Body type of every response a client produces
pub type RelayBody = BoxBody<Bytes, hyper::Error>;

/// What the request side learned about the exchange, for the connection task
pub(crate) enum Handoff {
    /// The tunnel side switched protocols
    Upgrade(OnUpgrade),
    /// Plain exchange; `reusable` is false when either side asked to close
    /// or the response body was not read to the end
    Release { reusable: bool },
}

/// Response body that tells the connection task how the body ended.
///
/// The tunnel socket may only go back to the pool once the whole response
/// has been read off it; a body dropped early leaves bytes on the wire.
pub(crate) struct ReleaseOnEnd {
    inner: RelayBody,
    reusable: bool,
    handoff: Option<oneshot::Sender<Handoff>>,
}

impl ReleaseOnEnd {
    pub(crate) fn new(inner: RelayBody, reusable: bool, handoff: oneshot::Sender<Handoff>) -> Self {
        Self {
            inner,
            reusable,
            handoff: Some(handoff),
        }
    }

    fn release(&mut self, completed: bool) {
        if let Some(handoff) = self.handoff.take() {
            let _ = handoff.send(Handoff::Release {
                reusable: self.reusable && completed,
            });
        }
    }
}

impl Body for ReleaseOnEnd {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            None => this.release(true),
            Some(Err(_)) => this.release(false),
            Some(Ok(_)) if this.inner.is_end_stream() => this.release(true),
            Some(Ok(_)) => {}
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ReleaseOnEnd {
    fn drop(&mut self) {
        let completed = self.inner.is_end_stream();
        self.release(completed);
    }
}

pub(crate) fn bad_gateway() -> Response<RelayBody> {
    let body = Full::new(Bytes::from_static(b"Bad Gateway"))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    response
}

pub(crate) fn wants_close(version: Version, headers: &http::HeaderMap) -> bool {
    let close_token = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));
    close_token || version < Version::HTTP_11
}

/// Splice a tunnel connection hyper gave back after a 101 with the public
/// side's upgraded stream
pub(crate) async fn splice_upgraded<T>(parts: Parts<TokioIo<T>>, on_upgrade: OnUpgrade)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!(error = %e, "Public side never completed the upgrade");
            return;
        }
    };

    let mut public = TokioIo::new(upgraded);
    let mut tunnel = parts.io.into_inner();
    if !parts.read_buf.is_empty() {
        if let Err(e) = public.write_all(&parts.read_buf).await {
            debug!(error = %e, "Failed to forward buffered tunnel bytes");
            return;
        }
    }

    log_relay_result(tokio::io::copy_bidirectional(&mut public, &mut tunnel).await);
}
