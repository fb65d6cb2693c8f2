//! Control API served on the bare domain
//!
//! Endpoints:
//! - `GET /api/status`: aggregate tunnel count
//! - `GET /api/tunnels/{id}/status`: connected sockets of one tenant
//! - `/?new`: create a tenant with a generated id
//! - `/{id}`: create a tenant with the requested id
//! - `/`: redirect to the landing page
//!
//! The tenant-creation routes answer any method.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use burrow_control::{validate_tenant_id, ClientManager, TunnelInfo};

pub const DEFAULT_LANDING_PAGE: &str = "https://localtunnel.github.io/www/";

const INVALID_SUBDOMAIN_MESSAGE: &str =
    "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

pub struct ApiState {
    pub manager: ClientManager,
    pub secure: bool,
    pub landing_page: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub tunnels: usize,
}

#[derive(Debug, Serialize)]
pub struct TunnelStatusResponse {
    pub connected_sockets: usize,
}

#[derive(Debug, Serialize)]
pub struct NewTunnelResponse {
    #[serde(flatten)]
    pub info: TunnelInfo,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/tunnels/{id}/status", get(tunnel_status))
        .route("/", any(landing_or_new))
        .route("/{id}", any(new_with_id))
        .with_state(state)
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        tunnels: state.manager.stats().tunnels,
    })
}

async fn tunnel_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelStatusResponse>, StatusCode> {
    let client = state.manager.get_client(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(TunnelStatusResponse {
        connected_sockets: client.stats().connected_sockets,
    }))
}

async fn landing_or_new(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !query.contains_key("new") {
        return (
            StatusCode::FOUND,
            [(header::LOCATION, state.landing_page.clone())],
        )
            .into_response();
    }

    debug!("Creating tenant with generated id");
    create_tenant(&state, None, &headers).await.into_response()
}

async fn new_with_id(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NewTunnelResponse>, ApiError> {
    if let Err(e) = validate_tenant_id(&id) {
        debug!(tenant = %id, error = %e, "Rejected requested tenant id");
        return Err(api_error(StatusCode::FORBIDDEN, INVALID_SUBDOMAIN_MESSAGE));
    }

    debug!(tenant = %id, "Creating tenant with requested id");
    create_tenant(&state, Some(&id), &headers).await
}

async fn create_tenant(
    state: &ApiState,
    requested_id: Option<&str>,
    headers: &HeaderMap,
) -> Result<Json<NewTunnelResponse>, ApiError> {
    let info = state.manager.new_client(requested_id).await.map_err(|e| {
        warn!(error = %e, "Failed to create tenant");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = if state.secure { "https" } else { "http" };
    let url = format!("{}://{}.{}", scheme, info.id, host);

    info!(tenant = %info.id, port = info.port, %url, "New tunnel");
    Ok(Json(NewTunnelResponse { info, url }))
}
