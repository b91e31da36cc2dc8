//! Server manager (C4): owns the pool of [`ManagedBackend`]s, connects them
//! at startup, and runs the periodic health-check loop.
//!
//! Grounded in `original_source/server_manager.py`'s `ServerManager`
//! (`start`, `_connect_server`, `_health_check_loop`,
//! `_perform_health_checks`, `get_active_servers`) for the lifecycle and
//! failure-counting policy, and the teacher's `manager.rs`
//! (`McpManager::initialize`, `health_check_cycle`, `start_health_loop`) for
//! the `tokio::spawn` loop shape and `Arc<Mutex<_>>` wiring idiom.

use crate::config::BridgeConfig;
use crate::proxy::ResilientProxy;
use crate::session::ClientSession;
use crate::types::{BackendState, BackendStatus, Prompt, Resource, Tool};
use crate::{transport, types};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// One pooled backend: its static config, live proxy (once connected), the
/// bookkeeping the health-check loop needs, and its cached capability
/// catalogues. Matches spec.md §3's `ManagedBackend` entity.
pub struct ManagedBackend {
    pub name: String,
    pub priority: u32,
    state: RwLock<BackendState>,
    proxy: RwLock<Option<Arc<ResilientProxy>>>,
    connected_at: RwLock<Option<SystemTime>>,
    last_health_check: RwLock<Option<SystemTime>>,
    last_error: RwLock<Option<String>>,
    failure_count: AtomicU64,
    last_recovery_attempt: RwLock<Option<SystemTime>>,
    tools: RwLock<Vec<Tool>>,
    resources: RwLock<Vec<Resource>>,
    prompts: RwLock<Vec<Prompt>>,
}

impl ManagedBackend {
    fn new(name: String, priority: u32) -> Self {
        Self {
            name,
            priority,
            state: RwLock::new(BackendState::Disconnected),
            proxy: RwLock::new(None),
            connected_at: RwLock::new(None),
            last_health_check: RwLock::new(None),
            last_error: RwLock::new(None),
            failure_count: AtomicU64::new(0),
            last_recovery_attempt: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
        }
    }

    pub async fn state(&self) -> BackendState {
        *self.state.read().await
    }

    pub async fn proxy(&self) -> Option<Arc<ResilientProxy>> {
        self.proxy.read().await.clone()
    }

    /// Cached tool catalogue, populated at connect time. Non-blocking: reads
    /// the snapshot, never issues a remote call — matches spec.md §5's
    /// "catalogue reads are non-blocking."
    pub async fn cached_tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    pub async fn cached_resources(&self) -> Vec<Resource> {
        self.resources.read().await.clone()
    }

    pub async fn cached_prompts(&self) -> Vec<Prompt> {
        self.prompts.read().await.clone()
    }

    /// Clear every cached catalogue. Called whenever the backend leaves
    /// CONNECTED, so a stale snapshot never outlives the session it was
    /// read from — matches §4.4 step 3's "capability-cache freshness is
    /// bound to the session."
    async fn clear_catalogue(&self) {
        self.tools.write().await.clear();
        self.resources.write().await.clear();
        self.prompts.write().await.clear();
    }

    async fn set_state(&self, state: BackendState) {
        let mut guard = self.state.write().await;
        tracing::info!("backend '{}': {:?} -> {:?}", self.name, *guard, state);
        *guard = state;
    }

    /// Build a `Connected` backend with a pre-populated catalogue, without
    /// going through `connect_backend`. Lets the aggregator's merge/route
    /// tests exercise namespace and conflict-resolution logic directly,
    /// without a live session.
    #[cfg(test)]
    pub(crate) fn test_connected(name: &str, priority: u32, tools: Vec<Tool>) -> Self {
        Self {
            name: name.to_string(),
            priority,
            state: RwLock::new(BackendState::Connected),
            proxy: RwLock::new(None),
            connected_at: RwLock::new(None),
            last_health_check: RwLock::new(None),
            last_error: RwLock::new(None),
            failure_count: AtomicU64::new(0),
            last_recovery_attempt: RwLock::new(None),
            tools: RwLock::new(tools),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
        }
    }

    /// Drive a backend's state directly, bypassing the health-check loop
    /// that would normally do it — lets a failover test simulate the
    /// `max_failures`-consecutive-probes transition without a live session.
    #[cfg(test)]
    pub(crate) async fn test_set_state(&self, state: BackendState) {
        self.set_state(state).await;
    }

    #[cfg(test)]
    pub(crate) async fn test_set_tools(&self, tools: Vec<Tool>) {
        *self.tools.write().await = tools;
    }
}

/// Owns every backend pool entry plus the bridge-wide settings (conflict
/// policy, aggregation flags, failover tuning) that the aggregator and
/// facade both read.
pub struct ServerManager {
    backends: HashMap<String, Arc<ManagedBackend>>,
    pub bridge: crate::config::BridgeSettings,
    shutdown: tokio_util::sync::CancellationToken,
}

impl ServerManager {
    pub fn new(config: BridgeConfig) -> (Self, Vec<crate::config::BackendConfig>) {
        let mut backends = HashMap::new();
        let mut configs = Vec::new();
        for backend_config in config.servers {
            if !backend_config.enabled {
                tracing::info!("backend '{}' is disabled, skipping", backend_config.name);
                continue;
            }
            backends.insert(
                backend_config.name.clone(),
                Arc::new(ManagedBackend::new(
                    backend_config.name.clone(),
                    backend_config.priority,
                )),
            );
            configs.push(backend_config);
        }

        (
            Self {
                backends,
                bridge: config.bridge,
                shutdown: tokio_util::sync::CancellationToken::new(),
            },
            configs,
        )
    }

    /// Connect every enabled backend concurrently, bounded by an overall
    /// 30s start deadline — matches `ServerManager.start`'s
    /// `asyncio.wait_for(..., timeout=30.0)`. Individual connect failures
    /// are logged and leave that backend `Failed`, not fatal to the whole
    /// gateway.
    pub async fn start(&self, configs: &[crate::config::BackendConfig]) {
        let tasks: Vec<_> = configs
            .iter()
            .filter_map(|config| {
                let backend = self.backends.get(&config.name)?.clone();
                let config = config.clone();
                Some(tokio::spawn(async move {
                    connect_backend(&backend, &config).await;
                }))
            })
            .collect();

        let join_all = futures::future::join_all(tasks);
        if tokio::time::timeout(Duration::from_secs(30), join_all)
            .await
            .is_err()
        {
            tracing::warn!("server manager start: overall 30s connect deadline exceeded");
        }
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn backend(&self, name: &str) -> Option<Arc<ManagedBackend>> {
        self.backends.get(name).cloned()
    }

    /// Connected backends sorted by ascending priority then name, matching
    /// `get_active_servers` + the aggregator's priority-ordered merge.
    pub async fn active_backends(&self, configs: &HashMap<String, crate::config::BackendConfig>) -> Vec<(Arc<ManagedBackend>, crate::config::BackendConfig)> {
        let mut active = Vec::new();
        for backend in self.backends.values() {
            if backend.state().await == BackendState::Connected {
                if let Some(config) = configs.get(&backend.name) {
                    active.push((backend.clone(), config.clone()));
                }
            }
        }
        active.sort_by(|a, b| a.0.priority.cmp(&b.0.priority).then(a.0.name.cmp(&b.0.name)));
        active
    }

    pub async fn status_snapshot(
        &self,
        configs: &HashMap<String, crate::config::BackendConfig>,
    ) -> Vec<BackendStatus> {
        let mut statuses = Vec::new();
        for backend in self.backends.values() {
            let config = configs.get(&backend.name);
            // Read the cached catalogue rather than issuing a live call per
            // backend per status poll — matches §5's "catalogue reads are
            // non-blocking."
            let (tools, resources, prompts) = (
                backend.cached_tools().await.len(),
                backend.cached_resources().await.len(),
                backend.cached_prompts().await.len(),
            );

            statuses.push(BackendStatus {
                name: backend.name.clone(),
                state: backend.state().await,
                transport_type: config.map(|c| c.transport_type).unwrap_or(types::TransportType::Stdio),
                connected_at: backend
                    .connected_at
                    .read()
                    .await
                    .map(types::format_system_time),
                last_health_check: backend
                    .last_health_check
                    .read()
                    .await
                    .map(types::format_system_time),
                last_error: backend.last_error.read().await.clone(),
                failure_count: backend.failure_count.load(Ordering::Relaxed) as u32,
                tools_count: tools,
                resources_count: resources,
                prompts_count: prompts,
                priority: backend.priority,
            });
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Spawn the periodic health-check loop (30s cadence, matching
    /// `_health_check_loop`'s sleep cadence), probing each connected
    /// backend with a `timeout_ms`-bounded `ping`, and attempting recovery
    /// of non-connected backends once `recovery_interval_ms` has elapsed
    /// since the last attempt.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        configs: Arc<HashMap<String, crate::config::BackendConfig>>,
    ) {
        if !self.bridge.failover.enabled {
            return;
        }
        let manager = self.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                manager.health_check_cycle(&configs).await;
            }
        });
    }

    async fn health_check_cycle(&self, configs: &HashMap<String, crate::config::BackendConfig>) {
        for backend in self.backends.values() {
            let Some(config) = configs.get(&backend.name) else {
                continue;
            };
            match backend.state().await {
                BackendState::Connected => {
                    self.probe_backend(backend, config).await;
                }
                BackendState::Failed | BackendState::Disconnected => {
                    self.maybe_reconnect(backend, config).await;
                }
                _ => {}
            }
        }
    }

    async fn probe_backend(&self, backend: &Arc<ManagedBackend>, config: &crate::config::BackendConfig) {
        let Some(proxy) = backend.proxy().await else {
            return;
        };
        let timeout = Duration::from_millis(config.health_check.timeout_ms);
        let probe = tokio::time::timeout(timeout, proxy.ping()).await;
        *backend.last_health_check.write().await = Some(SystemTime::now());

        match probe {
            Ok(Ok(())) => {
                backend.failure_count.store(0, Ordering::Relaxed);
            }
            Ok(Err(err)) | Err(_) => {
                let message = match probe {
                    Ok(Err(err)) => err.to_string(),
                    _ => "health check timed out".to_string(),
                };
                let failures = backend.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                *backend.last_error.write().await = Some(message.clone());
                tracing::warn!(
                    "backend '{}': health check failed ({}/{}): {}",
                    backend.name,
                    failures,
                    self.bridge.failover.max_failures,
                    message
                );

                if failures >= self.bridge.failover.max_failures as u64 {
                    backend.set_state(BackendState::Failed).await;
                    proxy.clear_session().await;
                    *backend.proxy.write().await = None;
                    backend.clear_catalogue().await;
                }
            }
        }
    }

    async fn maybe_reconnect(&self, backend: &Arc<ManagedBackend>, config: &crate::config::BackendConfig) {
        let recovery_interval = Duration::from_millis(self.bridge.failover.recovery_interval_ms);
        let due = {
            let last = *backend.last_recovery_attempt.read().await;
            match last {
                Some(t) => SystemTime::now().duration_since(t).unwrap_or_default() >= recovery_interval,
                None => true,
            }
        };
        if !due {
            return;
        }
        *backend.last_recovery_attempt.write().await = Some(SystemTime::now());
        connect_backend(backend, config).await;
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for backend in self.backends.values() {
            if let Some(proxy) = backend.proxy().await {
                proxy.clear_session().await;
            }
            backend.clear_catalogue().await;
            backend.set_state(BackendState::Disconnected).await;
        }
        tracing::info!("all backends shut down");
    }
}

/// Convert one backend's freshly-connected session's catalogues into the
/// domain types and store them on the `ManagedBackend`, per §4.4 step 3:
/// "after connect ... call `list_tools` and cache; same for resources and
/// prompts (omit absent capabilities)." A backend that doesn't support a
/// given listing operation simply returns an error here, which is logged
/// and treated the same as an absent capability — an empty cached list.
async fn cache_catalogue(backend: &ManagedBackend, proxy: &ResilientProxy) {
    match proxy.list_tools().await {
        Ok(result) => {
            *backend.tools.write().await =
                result.tools.into_iter().map(convert_tool).collect();
        }
        Err(err) => {
            tracing::debug!("backend '{}': tools not cached: {}", backend.name, err);
        }
    }

    match proxy.list_resources().await {
        Ok(result) => {
            *backend.resources.write().await =
                result.resources.into_iter().map(convert_resource).collect();
        }
        Err(err) => {
            tracing::debug!("backend '{}': resources not cached: {}", backend.name, err);
        }
    }

    match proxy.list_prompts().await {
        Ok(result) => {
            *backend.prompts.write().await =
                result.prompts.into_iter().map(convert_prompt).collect();
        }
        Err(err) => {
            tracing::debug!("backend '{}': prompts not cached: {}", backend.name, err);
        }
    }
}

fn convert_tool(t: rmcp::model::Tool) -> Tool {
    Tool {
        name: t.name.to_string(),
        description: t.description.map(|d| d.to_string()),
        input_schema: serde_json::to_value(&t.input_schema).unwrap_or(serde_json::Value::Null),
    }
}

fn convert_resource(r: rmcp::model::Resource) -> Resource {
    Resource {
        uri: r.uri.to_string(),
        name: Some(r.name.to_string()),
        description: r.description.clone().map(|d| d.to_string()),
        mime_type: r.mime_type.clone().map(|m| m.to_string()),
    }
}

fn convert_prompt(p: rmcp::model::Prompt) -> Prompt {
    Prompt {
        name: p.name.to_string(),
        description: p.description.map(|d| d.to_string()),
        arguments: p
            .arguments
            .unwrap_or_default()
            .into_iter()
            .map(|a| crate::types::PromptArgument {
                name: a.name.to_string(),
                description: a.description.map(|d| d.to_string()),
                required: a.required.unwrap_or(false),
            })
            .collect(),
    }
}

async fn connect_backend(backend: &Arc<ManagedBackend>, config: &crate::config::BackendConfig) {
    backend.set_state(BackendState::Connecting).await;
    backend.clear_catalogue().await;

    let timeout = Duration::from_secs(config.timeout_secs);
    match tokio::time::timeout(timeout, transport::open(config)).await {
        Ok(Ok(session)) => {
            let proxy = Arc::new(ResilientProxy::new(config.clone(), ClientSession::new(session)));
            cache_catalogue(backend, &proxy).await;
            *backend.proxy.write().await = Some(proxy);
            *backend.connected_at.write().await = Some(SystemTime::now());
            *backend.last_error.write().await = None;
            backend.failure_count.store(0, Ordering::Relaxed);
            backend.set_state(BackendState::Connected).await;
            tracing::info!("backend '{}': connected", backend.name);
        }
        Ok(Err(err)) => {
            *backend.last_error.write().await = Some(err.to_string());
            backend.failure_count.fetch_add(1, Ordering::Relaxed);
            backend.set_state(BackendState::Failed).await;
            tracing::warn!("backend '{}': connect failed: {}", backend.name, err);
        }
        Err(_) => {
            *backend.last_error.write().await = Some("connect timed out".to_string());
            backend.failure_count.fetch_add(1, Ordering::Relaxed);
            backend.set_state(BackendState::Failed).await;
            tracing::warn!("backend '{}': connect timed out after {:?}", backend.name, timeout);
        }
    }
}
