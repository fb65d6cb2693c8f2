//! Public HTTP front door
//!
//! Every public connection is sniffed once. Upgrade requests for a known
//! tenant are handed to its client as raw bytes. Everything else is served
//! by hyper: requests whose Host names a tenant are relayed through that
//! tenant's client, requests for the bare domain go to the control API.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use http::{header, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;
use tracing::{debug, error, info};

use burrow_control::ClientManager;

use crate::api::{build_router, ApiState, DEFAULT_LANDING_PAGE};
use crate::host::HostResolver;
use crate::sniff::{parse_upgrade, read_head, PrefixedStream};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] hyper::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Base domain tenants live under; inferred from the Host header if unset
    pub domain: Option<String>,
    /// Advertise `https://` URLs (TLS is terminated upstream)
    pub secure: bool,
    pub landing_page: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            domain: None,
            secure: false,
            landing_page: DEFAULT_LANDING_PAGE.to_string(),
        }
    }
}

struct Dispatcher {
    manager: ClientManager,
    resolver: HostResolver,
    api: Router,
}

pub struct DispatchServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl DispatchServer {
    pub async fn bind(config: ServerConfig, manager: ClientManager) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(config.bind_addr)
                .await
                .map_err(|e| ServerError::BindError {
                    address: config.bind_addr.ip().to_string(),
                    port: config.bind_addr.port(),
                    reason: e.to_string(),
                })?;

        let api = build_router(Arc::new(ApiState {
            manager: manager.clone(),
            secure: config.secure,
            landing_page: config.landing_page.clone(),
        }));

        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher {
                manager,
                resolver: HostResolver::new(config.domain),
                api,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept public connections forever
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr()?,
            domain = self.dispatcher.resolver.domain().unwrap_or("<any>"),
            "Burrow server listening"
        );

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!(%peer_addr, "Accepted public connection");
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatcher.handle_connection(socket).await {
                            debug!(%peer_addr, error = %e, "Public connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept public connection: {}", e);
                }
            }
        }
    }
}

impl Dispatcher {
    async fn handle_connection(self: Arc<Self>, mut socket: TcpStream) -> Result<(), ServerError> {
        let buffered = read_head(&mut socket).await?;
        if buffered.is_empty() {
            return Ok(());
        }

        if let Some(upgrade) = parse_upgrade(&buffered) {
            let Some(host) = upgrade.host.as_deref() else {
                debug!("Dropping upgrade without Host header");
                return Ok(());
            };
            let Some(client) = self
                .resolver
                .tenant_id(host)
                .and_then(|id| self.manager.get_client(&id))
            else {
                debug!(host, "Dropping upgrade for unknown tenant");
                return Ok(());
            };

            let rest = buffered[upgrade.head_len..].to_vec();
            client
                .handle_upgrade(upgrade.request, PrefixedStream::new(rest, socket))
                .await;
            return Ok(());
        }

        let io = TokioIo::new(PrefixedStream::new(buffered, socket));
        let service = service_fn(move |req| {
            let dispatcher = self.clone();
            async move { Ok::<_, Infallible>(dispatcher.route(req).await) }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await?;
        Ok(())
    }

    async fn route(&self, req: Request<Incoming>) -> Response<Body> {
        let Some(host) = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        else {
            return plain_response(StatusCode::BAD_REQUEST, "Host header is required");
        };

        let Some(id) = self.resolver.tenant_id(&host) else {
            return match self.api.clone().oneshot(req.map(Body::new)).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
        };

        match self.manager.get_client(&id) {
            Some(client) => client.handle_request(req).await.map(Body::new),
            None => {
                debug!(tenant = %id, "Request for unknown tenant");
                plain_response(StatusCode::NOT_FOUND, "404")
            }
        }
    }
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}
