//! Per-tenant tunnel socket pool
//!
//! A `TunnelAgent` listens on an ephemeral port for raw TCP connections from
//! one remote tunnel client and lends them out, one per relay call. Sockets
//! that arrive while requests are waiting go straight to the oldest waiter;
//! otherwise they sit in the idle queue until requested or closed by the
//! peer.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::error::{is_benign_io_error, is_transient_accept_error, AgentError};
use crate::socket::TunnelSocket;
use crate::source::{AgentStats, ConnectionSource};

/// Default cap on concurrently connected tunnel sockets per tenant
pub const DEFAULT_MAX_SOCKETS: usize = 10;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tenant this agent serves, used for log context
    pub tenant_id: String,
    pub max_sockets: usize,
    /// Address the tunnel listener binds on; the port is always OS-assigned
    pub bind_addr: IpAddr,
}

impl AgentConfig {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    pub fn with_max_sockets(mut self, max_sockets: usize) -> Self {
        self.max_sockets = max_sockets;
        self
    }

    pub fn with_bind_addr(mut self, bind_addr: IpAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            max_sockets: DEFAULT_MAX_SOCKETS,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Edge-triggered notifications from an agent to its owner
#[derive(Debug)]
pub enum AgentEvent {
    /// Connected count went from 0 to 1
    Online,
    /// Connected count went from 1 to 0
    Offline,
    /// The listener failed and will not accept again
    Error(AgentError),
    /// The agent reached its terminal state
    Closed,
}

pub type AgentEvents = mpsc::UnboundedReceiver<AgentEvent>;

type Waiter = oneshot::Sender<TunnelSocket>;

enum Phase {
    Unstarted,
    Binding,
    Listening { port: u16 },
    Closed,
}

struct IdleSlot {
    id: u64,
    claim: oneshot::Sender<Waiter>,
}

struct PoolState {
    phase: Phase,
    idle: VecDeque<IdleSlot>,
    waiters: VecDeque<Waiter>,
    connected: usize,
}

pub(crate) struct Shared {
    config: AgentConfig,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<AgentEvent>,
    shutdown: CancellationToken,
    next_socket_id: AtomicU64,
    span: Span,
}

#[derive(Clone)]
pub struct TunnelAgent {
    shared: Arc<Shared>,
}

impl TunnelAgent {
    /// Create an unstarted agent together with its event stream
    pub fn new(config: AgentConfig) -> (Self, AgentEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let span = info_span!("tunnel_agent", tenant = %config.tenant_id);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(PoolState {
                phase: Phase::Unstarted,
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                connected: 0,
            }),
            events,
            shutdown: CancellationToken::new(),
            next_socket_id: AtomicU64::new(1),
            span,
        });
        (Self { shared }, rx)
    }

    pub fn tenant_id(&self) -> &str {
        &self.shared.config.tenant_id
    }

    pub fn max_sockets(&self) -> usize {
        self.shared.config.max_sockets
    }

    /// Bind the tunnel listener and start accepting. Returns the bound port.
    pub async fn listen(&self) -> Result<u16, AgentError> {
        {
            let mut state = self.shared.lock_state();
            match state.phase {
                Phase::Unstarted => {}
                Phase::Binding | Phase::Listening { .. } => return Err(AgentError::AlreadyStarted),
                Phase::Closed => return Err(AgentError::Closed),
            }
            state.phase = Phase::Binding;
        }

        let bind_addr = SocketAddr::new(self.shared.config.bind_addr, 0);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(parent: &self.shared.span, %bind_addr, error = %e, "Failed to bind tunnel listener");
                self.shared.close_pool();
                return Err(AgentError::Bind {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                });
            }
        };
        let port = listener.local_addr()?.port();

        {
            let mut state = self.shared.lock_state();
            if matches!(state.phase, Phase::Closed) {
                return Err(AgentError::Closed);
            }
            state.phase = Phase::Listening { port };
        }

        let span = self.shared.span.clone();
        span.in_scope(|| info!(port, "Tunnel listener started"));
        tokio::spawn(self.shared.clone().accept_loop(listener).instrument(span));
        Ok(port)
    }

    /// Borrow one socket for one relay call.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue; sockets skip abandoned requests.
    pub async fn create_connection(&self) -> Result<TunnelSocket, AgentError> {
        let rx = {
            let mut state = self.shared.lock_state();
            if matches!(state.phase, Phase::Closed) {
                return Err(AgentError::Closed);
            }
            let (tx, rx) = oneshot::channel();
            self.shared.dispatch_waiter(&mut state, tx, false);
            rx
        };
        rx.await.map_err(|_| AgentError::Closed)
    }

    /// Put a socket that survived a relay call back into the pool
    pub fn recycle(&self, socket: TunnelSocket) {
        debug!(parent: &self.shared.span, socket = socket.id(), "Recycling tunnel socket");
        self.shared.offer(socket);
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            connected_sockets: self.shared.lock_state().connected,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self.shared.lock_state().phase {
            Phase::Listening { port } => Some(port),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.shared.lock_state().phase, Phase::Unstarted)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.shared.lock_state().phase, Phase::Closed)
    }

    /// Stop listening and end every idle and loaned socket. Idempotent.
    pub fn destroy(&self) {
        self.shared.shutdown.cancel();
        self.shared.close_pool();
    }
}

#[async_trait]
impl ConnectionSource for TunnelAgent {
    type Connection = TunnelSocket;

    async fn create_connection(&self) -> Result<TunnelSocket, AgentError> {
        TunnelAgent::create_connection(self).await
    }

    fn recycle(&self, conn: TunnelSocket) {
        TunnelAgent::recycle(self, conn)
    }

    fn stats(&self) -> AgentStats {
        TunnelAgent::stats(self)
    }

    fn destroy(&self) {
        TunnelAgent::destroy(self)
    }
}

enum IdleOutcome {
    Claimed(Option<Waiter>),
    Readable,
    Closed(Option<std::io::Error>),
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: AgentEvent) {
        // Nobody listening is fine: the owner may already be gone.
        let _ = self.events.send(event);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr),
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Transient accept error on tunnel listener");
                }
                Err(e) => {
                    error!(error = %e, "Tunnel listener failed");
                    self.emit(AgentEvent::Error(AgentError::Io(e)));
                    break;
                }
            }
        }

        self.close_pool();
        debug!("Tunnel listener stopped");
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let mut state = self.lock_state();
        if !matches!(state.phase, Phase::Listening { .. }) {
            return;
        }
        if state.connected >= self.config.max_sockets {
            debug!(
                %peer_addr,
                max_sockets = self.config.max_sockets,
                "Rejecting tunnel socket over the limit"
            );
            return;
        }

        if state.connected == 0 {
            self.emit(AgentEvent::Online);
        }
        state.connected += 1;

        let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            socket = id,
            %peer_addr,
            connected = state.connected,
            "Tunnel socket connected"
        );
        let socket = TunnelSocket::new(
            stream,
            peer_addr,
            id,
            Arc::downgrade(self),
            self.shutdown.clone(),
        );
        let rejected = self.offer_locked(&mut state, socket);
        drop(state);
        drop(rejected);
    }

    /// Called exactly once per admitted socket, when it is dropped
    pub(crate) fn release(&self, id: u64) {
        let mut state = self.lock_state();
        state.idle.retain(|slot| slot.id != id);
        state.connected = state.connected.saturating_sub(1);
        debug!(parent: &self.span, socket = id, connected = state.connected, "Tunnel socket closed");
        if state.connected == 0 {
            self.emit(AgentEvent::Offline);
        }
    }

    fn offer(self: &Arc<Self>, socket: TunnelSocket) {
        let rejected = {
            let mut state = self.lock_state();
            self.offer_locked(&mut state, socket)
        };
        drop(rejected);
    }

    /// Hand a socket to the oldest live waiter, or park it as idle.
    ///
    /// A socket that cannot be pooled is returned so the caller drops it after
    /// releasing the lock; its guard takes the lock again.
    fn offer_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        mut socket: TunnelSocket,
    ) -> Option<TunnelSocket> {
        if matches!(state.phase, Phase::Closed) {
            return Some(socket);
        }

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(socket) {
                Ok(()) => return None,
                Err(returned) => socket = returned,
            }
        }

        let (claim, claimed) = oneshot::channel();
        state.idle.push_back(IdleSlot {
            id: socket.id(),
            claim,
        });
        tokio::spawn(
            self.clone()
                .watch_idle(socket, claimed)
                .instrument(self.span.clone()),
        );
        None
    }

    /// Serve a waiter from the idle queue, or queue it.
    fn dispatch_waiter(&self, state: &mut PoolState, mut waiter: Waiter, front: bool) {
        if matches!(state.phase, Phase::Closed) {
            return;
        }

        while let Some(slot) = state.idle.pop_front() {
            match slot.claim.send(waiter) {
                Ok(()) => return,
                Err(returned) => waiter = returned,
            }
        }

        state.waiters.retain(|w| !w.is_closed());
        if front {
            state.waiters.push_front(waiter);
        } else {
            state.waiters.push_back(waiter);
        }
    }

    /// Own an idle socket until it is claimed or the peer goes away
    async fn watch_idle(
        self: Arc<Self>,
        socket: TunnelSocket,
        mut claimed: oneshot::Receiver<Waiter>,
    ) {
        let mut peek_buf = [0u8; 1];
        let outcome = tokio::select! {
            waiter = &mut claimed => IdleOutcome::Claimed(waiter.ok()),
            peeked = socket.stream.peek(&mut peek_buf) => match peeked {
                Ok(0) => IdleOutcome::Closed(None),
                Ok(_) => IdleOutcome::Readable,
                Err(e) => IdleOutcome::Closed(Some(e)),
            },
        };

        let waiter = match outcome {
            IdleOutcome::Claimed(waiter) => waiter,
            IdleOutcome::Readable => claimed.await.ok(),
            IdleOutcome::Closed(err) => {
                match err {
                    Some(e) if !is_benign_io_error(&e) => {
                        warn!(socket = socket.id(), error = %e, "Idle tunnel socket failed");
                    }
                    Some(e) => debug!(socket = socket.id(), error = %e, "Idle tunnel socket reset"),
                    None => debug!(socket = socket.id(), "Idle tunnel socket closed by peer"),
                }

                let mut state = self.lock_state();
                let id = socket.id();
                let was_idle = state.idle.iter().any(|slot| slot.id == id);
                if was_idle {
                    state.idle.retain(|slot| slot.id != id);
                } else if let Ok(waiter) = claimed.try_recv() {
                    // Claimed while we were noticing the close; give the
                    // request its place back.
                    self.dispatch_waiter(&mut state, waiter, true);
                }
                drop(state);
                drop(socket);
                return;
            }
        };

        match waiter {
            Some(waiter) => {
                if let Err(socket) = waiter.send(socket) {
                    self.offer(socket);
                }
            }
            None => debug!(socket = socket.id(), "Dropping idle tunnel socket on close"),
        }
    }

    fn close_pool(&self) {
        let mut state = self.lock_state();
        if matches!(state.phase, Phase::Closed) {
            return;
        }
        state.phase = Phase::Closed;
        state.idle.clear();
        state.waiters.clear();
        self.emit(AgentEvent::Closed);
        info!(parent: &self.span, "Tunnel agent closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = AgentConfig::new("quiet-otter-12")
            .with_max_sockets(3)
            .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));

        assert_eq!(config.tenant_id, "quiet-otter-12");
        assert_eq!(config.max_sockets, 3);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(AgentConfig::default().max_sockets, DEFAULT_MAX_SOCKETS);
    }

    #[tokio::test]
    async fn test_destroy_before_listen() {
        let (agent, mut events) = TunnelAgent::new(AgentConfig::new("unstarted"));

        agent.destroy();
        agent.destroy();

        assert!(agent.is_closed());
        assert!(matches!(events.recv().await, Some(AgentEvent::Closed)));
        assert!(events.try_recv().is_err());
        assert!(matches!(agent.listen().await, Err(AgentError::Closed)));
    }
}
