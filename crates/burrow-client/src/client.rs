//! Per-tenant client
//!
//! A `Client` owns one connection source (the tenant's tunnel agent), relays
//! public traffic over sockets borrowed from it, and tears the tenant down
//! once it has gone without any tunnel socket for a full grace window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use burrow_agent::{AgentEvent, AgentEvents, AgentStats, ConnectionSource, TunnelAgent};

use crate::error::ClientError;
use crate::grace::GraceTimer;
use crate::relay::{bad_gateway, splice_upgraded, wants_close, Handoff, RelayBody, ReleaseOnEnd};
use crate::upgrade::{log_relay_result, PublicStream, UpgradeRequest};

pub struct Client<S: ConnectionSource = TunnelAgent> {
    inner: Arc<Inner<S>>,
}

impl<S: ConnectionSource> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S> {
    id: String,
    source: S,
    closing: AtomicBool,
    /// Stops the supervisor (and with it the grace timer)
    shutdown: CancellationToken,
    /// Completion signal for the owner
    done: CancellationToken,
    span: Span,
}

impl<S: ConnectionSource> Client<S> {
    /// Bind a client to its source and start the grace window.
    ///
    /// `events` must be the event stream of `source`.
    pub fn new(
        id: impl Into<String>,
        source: S,
        events: AgentEvents,
        grace_period: Duration,
    ) -> Self {
        let id = id.into();
        let span = info_span!("client", tenant = %id);
        let inner = Arc::new(Inner {
            id,
            source,
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            span: span.clone(),
        });

        tokio::spawn(supervise(inner.clone(), events, grace_period).instrument(span));

        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn stats(&self) -> AgentStats {
        self.inner.source.stats()
    }

    /// Tear the tenant down. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Resolves once the client has closed, for whatever reason
    pub async fn closed(&self) {
        self.inner.done.cancelled().await
    }

    /// Whether both handles refer to the same tenant instance
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Relay one public request through the tunnel.
    ///
    /// Method, target and headers go out unchanged. The tunnel side's status,
    /// headers and body come back unchanged. If no tunnel socket can be had,
    /// or the tunnel side fails before answering, the caller gets a 502.
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<RelayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let span = self.inner.span.clone();
        let method = req.method().clone();
        let uri = req.uri().clone();

        async move {
            match self.relay_request(req).await {
                Ok(response) => {
                    debug!(%method, %uri, status = %response.status(), "Relayed request");
                    response
                }
                Err(e) => {
                    warn!(%method, %uri, error = %e, "Failed to relay request");
                    bad_gateway()
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn relay_request<B>(&self, mut req: Request<B>) -> Result<Response<RelayBody>, ClientError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let public_upgrade = hyper::upgrade::on(&mut req);
        let request_close = wants_close(req.version(), req.headers());

        let socket = self.inner.source.create_connection().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(socket)).await?;

        let (handoff_tx, handoff_rx) = oneshot::channel::<Handoff>();
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                let parts = conn.without_shutdown().await;
                match (parts, handoff_rx.await) {
                    (Ok(parts), Ok(Handoff::Upgrade(on_upgrade))) => {
                        splice_upgraded(parts, on_upgrade).await;
                    }
                    (Ok(parts), Ok(Handoff::Release { reusable: true }))
                        if parts.read_buf.is_empty() =>
                    {
                        inner.source.recycle(parts.io.into_inner());
                    }
                    (Ok(_), _) => debug!("Discarding tunnel socket after relay"),
                    (Err(e), _) => debug!(error = %e, "Tunnel connection ended"),
                }
            }
            .instrument(self.inner.span.clone()),
        );

        let response = sender.send_request(req).await?;
        drop(sender);

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let _ = handoff_tx.send(Handoff::Upgrade(public_upgrade));
            return Ok(response.map(|body| body.boxed()));
        }

        // The socket is released once the public side is done with the body
        let reusable = !request_close && !wants_close(response.version(), response.headers());
        Ok(response.map(|body| ReleaseOnEnd::new(body.boxed(), reusable, handoff_tx).boxed()))
    }

    /// Relay an upgrade request by writing its head verbatim on a tunnel
    /// socket and splicing the two connections.
    ///
    /// If no tunnel socket can be had, or the public peer already went away,
    /// both ends are closed without relaying anything.
    pub async fn handle_upgrade<P>(&self, head: UpgradeRequest, mut public: P)
    where
        P: PublicStream,
    {
        let span = self.inner.span.clone();
        async move {
            let mut tunnel = match self.inner.source.create_connection().await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    debug!(error = %e, "No tunnel socket for upgrade");
                    let _ = public.shutdown().await;
                    return;
                }
            };

            if !public.is_open() {
                debug!("Public side closed before upgrade could be relayed");
                drop(tunnel);
                let _ = public.shutdown().await;
                return;
            }

            debug!(method = %head.method, target = %head.target, "Relaying upgrade");
            if let Err(e) = tunnel.write_all(&head.to_bytes()).await {
                log_relay_result(Err(e));
                let _ = public.shutdown().await;
                return;
            }

            log_relay_result(tokio::io::copy_bidirectional(&mut public, &mut tunnel).await);
        }
        .instrument(span)
        .await
    }
}

impl<S: ConnectionSource> Inner<S> {
    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.source.destroy();
        self.done.cancel();
        info!(parent: &self.span, "Client closed");
    }
}

/// Owns the grace timer and reacts to the source's connectivity edges
async fn supervise<S: ConnectionSource>(
    inner: Arc<Inner<S>>,
    mut events: AgentEvents,
    grace_period: Duration,
) {
    let mut grace = GraceTimer::new(grace_period);
    grace.arm();

    loop {
        // Edges already delivered win over a deadline that passed meanwhile
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(AgentEvent::Online) => {
                    debug!("Tunnel online");
                    grace.cancel();
                }
                Some(AgentEvent::Offline) => {
                    debug!("Tunnel offline, waiting for reconnect");
                    grace.arm();
                }
                Some(AgentEvent::Error(e)) => {
                    warn!(error = %e, "Tunnel agent failed");
                    inner.close();
                    break;
                }
                Some(AgentEvent::Closed) | None => {
                    inner.close();
                    break;
                }
            },
            _ = grace.expired() => {
                info!(grace_ms = grace_period.as_millis() as u64, "No tunnel socket within grace period");
                inner.close();
                break;
            }
        }
    }
}
