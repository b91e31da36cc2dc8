//! Transport adapters (C1): turn a [`crate::config::BackendConfig`] into a
//! live `rmcp` service.
//!
//! Grounded in `connection.rs`'s three `connect_*` methods, split into one
//! module per transport kind since each now needs to expose a
//! `supports_rebuild` capability flag to [`crate::proxy`] rather than being
//! private methods on a single connection type.

pub mod http;
pub mod legacy_sse;
pub mod stdio;

use crate::config::BackendConfig;
use crate::types::TransportType;
use anyhow::Result;
use rmcp::service::RunningService;
use rmcp::RoleClient;

pub type Session = RunningService<RoleClient, ()>;

/// Whether a freshly-opened session can also answer a lightweight
/// `initialize`-only "reinitialise in place" request, or whether recovering
/// from session loss always requires tearing down and reconnecting from
/// scratch. stdio processes support neither (killing and respawning a child
/// is the only recovery path); HTTP/SSE backends generally support a fresh
/// `initialize` over the same transport.
pub fn supports_rebuild(transport: TransportType) -> bool {
    !matches!(transport, TransportType::Stdio)
}

/// Open a session for one backend's configured transport. Matches
/// `McpConnection::connect`'s three-way dispatch over `TransportType`.
pub async fn open(config: &BackendConfig) -> Result<Session> {
    match config.transport_type {
        TransportType::Stdio => stdio::connect(config).await,
        TransportType::Sse => http::connect_sse(config).await,
        TransportType::StreamableHttp => http::connect_streamable(config).await,
    }
}
