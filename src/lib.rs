//! `mcp-bridge`: an aggregating MCP gateway. Connects to a pool of backend
//! MCP servers (stdio, SSE, or streamable HTTP), merges their tool/resource/
//! prompt catalogues under a namespacing scheme, and re-exposes the merge as
//! one MCP server of its own.
//!
//! Grounded in the teacher crate's module layout (`config`, `manager`,
//! `proxy`, `types`, `transport`) with its Tauri-specific `commands`/`mcp`
//! modules replaced by the pieces a headless gateway needs instead:
//! [`aggregator`] (catalogue merge + call routing), [`facade`] (the
//! re-exposed `ServerHandler`), and [`server`] (the HTTP hosting layer).

pub mod aggregator;
pub mod config;
pub mod error;
pub mod facade;
pub mod manager;
pub mod proxy;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

use config::{BackendConfig, BridgeConfig};
use manager::ServerManager;
use std::collections::HashMap;
use std::sync::Arc;

/// The running gateway: the backend pool plus the static config each
/// backend was built from, shared between the facade's MCP handlers and the
/// hosting layer's `/status` endpoint.
///
/// Corresponds to the teacher's `AppState` (manager + config, handed to both
/// the Tauri command layer and the proxy server) with the Tauri-specific
/// config-manager half dropped — this gateway's config is load-once, not
/// editable at runtime.
pub struct Gateway {
    pub manager: Arc<ServerManager>,
    pub configs: Arc<HashMap<String, BackendConfig>>,
}

impl Gateway {
    /// Build a `Gateway` from a loaded config. Does not connect to any
    /// backend yet — call [`Gateway::start`] for that.
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let (manager, backend_configs) = ServerManager::new(config);
        let configs: HashMap<String, BackendConfig> = backend_configs
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        Arc::new(Self {
            manager: Arc::new(manager),
            configs: Arc::new(configs),
        })
    }

    /// Connect every enabled backend and start the health-check loop.
    /// Matches the teacher's setup sequence: initialize the pool, then
    /// spawn the periodic health loop on top of it.
    pub async fn start(self: &Arc<Self>) {
        let configs: Vec<BackendConfig> = self.configs.values().cloned().collect();
        self.manager.start(&configs).await;
        self.manager.spawn_health_loop(self.configs.clone());

        let active = self.manager.active_backends(&self.configs).await;
        tracing::info!(
            "gateway started: {}/{} backends connected",
            active.len(),
            self.configs.len()
        );
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeSettings;

    #[test]
    fn gateway_new_builds_empty_pool_from_empty_config() {
        let config = BridgeConfig {
            servers: vec![],
            bridge: BridgeSettings::default(),
        };
        let gateway = Gateway::new(config);
        assert!(gateway.configs.is_empty());
        assert!(gateway.manager.backend_names().is_empty());
    }
}
