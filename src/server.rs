//! Hosting HTTP layer (ambient, C8): exposes the aggregated facade over
//! streamable HTTP, plus a `/status` liveness endpoint and `/servers/<name>`
//! passthrough mirrors for single-backend inspection.
//!
//! Grounded in the teacher's `proxy/server.rs` router (`/health` renamed to
//! `/status` per spec.md §6.2, the `/mcp/:id` trio generalized to mounting
//! the whole aggregated server at `/mcp` instead of one backend at a time,
//! and `list_tools`/`list_resources` kept nearly verbatim as the
//! per-backend passthrough mirrors) and the `StreamableHttpService` mounting
//! pattern used elsewhere in the corpus for serving an `rmcp` `ServerHandler`
//! over HTTP (e.g. the `wassette` binary's `main`).

use crate::facade::AggregatedServer;
use crate::types::BackendState;
use crate::Gateway;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
struct HostState {
    gateway: Arc<Gateway>,
}

/// Build the axum router: `/status`, the streamable-HTTP `/mcp` mount, and
/// `/servers/<name>/...` per-backend mirrors.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let state = HostState {
        gateway: gateway.clone(),
    };

    let mcp_service = StreamableHttpService::new(
        move || Ok(AggregatedServer::new(gateway.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status))
        .route("/servers/:name/status", get(backend_status))
        .route("/servers/:name/tools", get(backend_tools))
        .route("/servers/:name/resources", get(backend_resources))
        .nest_service("/mcp", mcp_service)
        .layer(cors)
        .with_state(state)
}

/// `GET /status` — process-wide liveness/activity JSON, per spec.md §6.2.
async fn status(State(state): State<HostState>) -> impl IntoResponse {
    let statuses = state
        .gateway
        .manager
        .status_snapshot(&state.gateway.configs)
        .await;
    let connected = statuses
        .iter()
        .filter(|s| s.state == BackendState::Connected)
        .count();

    Json(serde_json::json!({
        "status": "ok",
        "total_backends": statuses.len(),
        "connected_backends": connected,
        "backends": statuses,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `GET /servers/<name>/status` — one backend's status row, or 404.
async fn backend_status(
    Path(name): Path<String>,
    State(state): State<HostState>,
) -> Result<impl IntoResponse, StatusCode> {
    let statuses = state
        .gateway
        .manager
        .status_snapshot(&state.gateway.configs)
        .await;
    statuses
        .into_iter()
        .find(|s| s.name == name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// `GET /servers/<name>/tools` — that backend's own catalogue, unnamespaced.
/// The single-backend passthrough mirror spec.md §1 calls "a degenerate case
/// of the core."
async fn backend_tools(
    Path(name): Path<String>,
    State(state): State<HostState>,
) -> Result<impl IntoResponse, StatusCode> {
    let backend = state
        .gateway
        .manager
        .backend(&name)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(backend.cached_tools().await))
}

/// `GET /servers/<name>/resources` — mirror of [`backend_tools`] for
/// resources.
async fn backend_resources(
    Path(name): Path<String>,
    State(state): State<HostState>,
) -> Result<impl IntoResponse, StatusCode> {
    let backend = state
        .gateway
        .manager
        .backend(&name)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(backend.cached_resources().await))
}

/// Bind and serve the hosting layer until a graceful-shutdown signal fires.
/// Mirrors the teacher's `start_proxy_server`, generalized to wait on
/// [`shutdown_signal`] instead of running forever.
pub async fn serve(gateway: Arc<Gateway>, port: u16) -> anyhow::Result<()> {
    let app = router(gateway);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("mcp-bridge listening on http://{addr} (status: /status, mcp: /mcp)");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Graceful shutdown on Ctrl+C (SIGINT) and SIGTERM (Unix), per §5
/// "Graceful shutdown" and the original `mcp_server.py`'s signal handling.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
    }
    tracing::info!("shutdown signal received");
}
