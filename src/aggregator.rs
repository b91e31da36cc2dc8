//! Aggregator / router (C5): merges every connected backend's cached
//! catalogue into one namespaced view, and routes an inbound call back to
//! the owning backend.
//!
//! Grounded in `server_manager.py`'s `get_aggregated_tools` /
//! `get_aggregated_resources` / `get_aggregated_prompts` and `call_tool` /
//! `read_resource` / `get_prompt`. The original repeats the same
//! merge-and-route logic three times (once per capability kind); this
//! factors it into one generic function parameterized by
//! [`crate::types::CapabilityKind`], since duplicating a 30-line loop three
//! times is not idiomatic Rust.
//!
//! Both the merge and the route below read [`ManagedBackend`]'s cached
//! catalogues (populated at connect time by [`crate::manager`]) rather than
//! issuing a live `list_*` RPC — per spec.md §5, "catalogue reads are
//! non-blocking," and per §4.4 the cache, not the live session, is the
//! source of truth for what a backend currently exposes.

use crate::config::{BackendConfig, ConflictResolution};
use crate::error::GatewayError;
use crate::manager::{ManagedBackend, ServerManager};
use crate::types::{CapabilityKind, Prompt, Resource, Tool};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// One merged catalogue entry: its exposed (possibly namespaced) identifier
/// and the backend that owns it.
pub struct Merged<T> {
    pub identifier: String,
    pub owner: String,
    pub item: T,
}

type CachedFuture<'a, T> = Pin<Box<dyn Future<Output = Vec<T>> + Send + 'a>>;

/// Build the merged, conflict-resolved catalogue for one capability kind
/// across every active backend, in priority order. This is the single
/// generic function the three `aggregated_*` accessors below call.
async fn merge_catalogue<T>(
    active: &[(Arc<ManagedBackend>, BackendConfig)],
    kind: CapabilityKind,
    conflict_resolution: ConflictResolution,
    default_namespace: bool,
    local_name: impl Fn(&T) -> &str,
    cached: impl Fn(&ManagedBackend) -> CachedFuture<'_, T>,
) -> Result<Vec<Merged<T>>, GatewayError> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();

    for (backend, config) in active {
        let items = cached(backend).await;

        let namespace = config.effective_namespace(kind, default_namespace);
        for item in items {
            let local = local_name(&item).to_string();
            let identifier = match &namespace {
                Some(ns) => format!("{ns}{}{local}", kind.separator()),
                None => local.clone(),
            };

            if seen.contains(&identifier) {
                match conflict_resolution {
                    ConflictResolution::Error => {
                        return Err(GatewayError::Conflict(format!(
                            "identifier '{identifier}' is exposed by more than one backend"
                        )));
                    }
                    // priority/namespace/first all resolve to "first seen
                    // wins" once backends are already priority-sorted.
                    ConflictResolution::Priority
                    | ConflictResolution::Namespace
                    | ConflictResolution::First => continue,
                }
            }

            seen.insert(identifier.clone());
            merged.push(Merged {
                identifier,
                owner: config.name.clone(),
                item,
            });
        }
    }

    Ok(merged)
}

pub async fn aggregated_tools(
    manager: &ServerManager,
    configs: &HashMap<String, BackendConfig>,
) -> Result<Vec<Merged<Tool>>, GatewayError> {
    let active = manager.active_backends(configs).await;
    merge_catalogue(
        &active,
        CapabilityKind::Tool,
        manager.bridge.conflict_resolution,
        manager.bridge.default_namespace,
        |t: &Tool| t.name.as_str(),
        |backend| Box::pin(backend.cached_tools()),
    )
    .await
}

pub async fn aggregated_resources(
    manager: &ServerManager,
    configs: &HashMap<String, BackendConfig>,
) -> Result<Vec<Merged<Resource>>, GatewayError> {
    let active = manager.active_backends(configs).await;
    merge_catalogue(
        &active,
        CapabilityKind::Resource,
        manager.bridge.conflict_resolution,
        manager.bridge.default_namespace,
        |r: &Resource| r.uri.as_str(),
        |backend| Box::pin(backend.cached_resources()),
    )
    .await
}

pub async fn aggregated_prompts(
    manager: &ServerManager,
    configs: &HashMap<String, BackendConfig>,
) -> Result<Vec<Merged<Prompt>>, GatewayError> {
    let active = manager.active_backends(configs).await;
    merge_catalogue(
        &active,
        CapabilityKind::Prompt,
        manager.bridge.conflict_resolution,
        manager.bridge.default_namespace,
        |p: &Prompt| p.name.as_str(),
        |backend| Box::pin(backend.cached_prompts()),
    )
    .await
}

/// Split an inbound identifier on a capability kind's namespace separator.
/// Returns `(Some(namespace), local)` if the separator is present, else
/// `(None, identifier)` — matches `call_tool`/`read_resource`/`get_prompt`'s
/// "parse `.`/`://` to find namespace+local" step.
fn split_identifier(identifier: &str, kind: CapabilityKind) -> (Option<&str>, &str) {
    let sep = kind.separator();
    match identifier.find(sep) {
        Some(idx) => (Some(&identifier[..idx]), &identifier[idx + sep.len()..]),
        None => (None, identifier),
    }
}

/// Find the backend owning an identifier. If a namespace prefix was given,
/// match it against each active backend's effective namespace for this
/// capability kind; otherwise scan active backends in priority order for
/// the first one whose catalogue contains the bare local name. Matches
/// `call_tool`'s two-branch routing.
///
/// The catalogue check reads each backend's cached snapshot rather than
/// issuing a `list_*` RPC, so routing a single call no longer re-lists a
/// backend's whole catalogue. Only once an owner is found does this reach
/// for the backend's live proxy, to perform the actual RPC.
async fn route<T>(
    identifier: &str,
    kind: CapabilityKind,
    active: &[(Arc<ManagedBackend>, BackendConfig)],
    default_namespace: bool,
    local_name: impl Fn(&T) -> &str,
    cached: impl Fn(&ManagedBackend) -> CachedFuture<'_, T>,
) -> Result<(Arc<crate::proxy::ResilientProxy>, String), GatewayError> {
    let (namespace, local) = split_identifier(identifier, kind);

    if let Some(namespace) = namespace {
        for (backend, config) in active {
            if config.effective_namespace(kind, default_namespace).as_deref() == Some(namespace) {
                let items = cached(backend).await;
                if items.iter().any(|item| local_name(item) == local) {
                    let proxy = backend
                        .proxy()
                        .await
                        .ok_or_else(|| GatewayError::Unavailable(config.name.clone()))?;
                    return Ok((proxy, local.to_string()));
                }
            }
        }
        return Err(GatewayError::NotFound(format!(
            "no backend exposes '{identifier}' under namespace '{namespace}'"
        )));
    }

    for (backend, config) in active {
        let items = cached(backend).await;
        if items.iter().any(|item| local_name(item) == local) {
            let proxy = backend
                .proxy()
                .await
                .ok_or_else(|| GatewayError::Unavailable(config.name.clone()))?;
            return Ok((proxy, local.to_string()));
        }
    }

    Err(GatewayError::NotFound(format!(
        "no backend exposes '{identifier}'"
    )))
}

pub async fn call_tool(
    manager: &ServerManager,
    configs: &HashMap<String, BackendConfig>,
    identifier: &str,
    arguments: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<rmcp::model::CallToolResult, GatewayError> {
    let active = manager.active_backends(configs).await;
    let (proxy, local_name) = route(
        identifier,
        CapabilityKind::Tool,
        &active,
        manager.bridge.default_namespace,
        |t: &Tool| t.name.as_str(),
        |backend| Box::pin(backend.cached_tools()),
    )
    .await?;

    proxy
        .call_tool(rmcp::model::CallToolRequestParams {
            name: local_name.into(),
            arguments,
        })
        .await
}

pub async fn read_resource(
    manager: &ServerManager,
    configs: &HashMap<String, BackendConfig>,
    identifier: &str,
) -> Result<rmcp::model::ReadResourceResult, GatewayError> {
    let active = manager.active_backends(configs).await;
    let (proxy, local_uri) = route(
        identifier,
        CapabilityKind::Resource,
        &active,
        manager.bridge.default_namespace,
        |r: &Resource| r.uri.as_str(),
        |backend| Box::pin(backend.cached_resources()),
    )
    .await?;

    proxy
        .read_resource(rmcp::model::ReadResourceRequestParams {
            uri: local_uri,
        })
        .await
}

pub async fn get_prompt(
    manager: &ServerManager,
    configs: &HashMap<String, BackendConfig>,
    identifier: &str,
    arguments: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<rmcp::model::GetPromptResult, GatewayError> {
    let active = manager.active_backends(configs).await;
    let (proxy, local_name) = route(
        identifier,
        CapabilityKind::Prompt,
        &active,
        manager.bridge.default_namespace,
        |p: &Prompt| p.name.as_str(),
        |backend| Box::pin(backend.cached_prompts()),
    )
    .await?;

    proxy
        .get_prompt(rmcp::model::GetPromptRequestParams {
            name: local_name.into(),
            arguments,
        })
        .await
}

pub async fn subscribe_resource(
    manager: &ServerManager,
    configs: &HashMap<String, BackendConfig>,
    identifier: &str,
) -> Result<(), GatewayError> {
    let active = manager.active_backends(configs).await;
    let (proxy, local_uri) = route(
        identifier,
        CapabilityKind::Resource,
        &active,
        manager.bridge.default_namespace,
        |r: &Resource| r.uri.as_str(),
        |backend| Box::pin(backend.cached_resources()),
    )
    .await?;

    proxy
        .subscribe_resource(rmcp::model::SubscribeRequestParams { uri: local_uri })
        .await
}

pub async fn unsubscribe_resource(
    manager: &ServerManager,
    configs: &HashMap<String, BackendConfig>,
    identifier: &str,
) -> Result<(), GatewayError> {
    let active = manager.active_backends(configs).await;
    let (proxy, local_uri) = route(
        identifier,
        CapabilityKind::Resource,
        &active,
        manager.bridge.default_namespace,
        |r: &Resource| r.uri.as_str(),
        |backend| Box::pin(backend.cached_resources()),
    )
    .await?;

    proxy
        .unsubscribe_resource(rmcp::model::UnsubscribeRequestParams { uri: local_uri })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_identifier_handles_tool_namespace() {
        let (ns, local) = split_identifier("files.read_file", CapabilityKind::Tool);
        assert_eq!(ns, Some("files"));
        assert_eq!(local, "read_file");
    }

    #[test]
    fn split_identifier_handles_resource_namespace() {
        let (ns, local) = split_identifier("files://etc/hosts", CapabilityKind::Resource);
        assert_eq!(ns, Some("files"));
        assert_eq!(local, "etc/hosts");
    }

    #[test]
    fn split_identifier_without_namespace_returns_whole_string() {
        let (ns, local) = split_identifier("read_file", CapabilityKind::Tool);
        assert_eq!(ns, None);
        assert_eq!(local, "read_file");
    }

    fn test_backend_config(name: &str, priority: u32) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            enabled: true,
            transport_type: crate::types::TransportType::Stdio,
            command: Some("echo".into()),
            args: vec![],
            url: None,
            env: Default::default(),
            headers: None,
            timeout_secs: 60,
            retry_attempts: 2,
            retry_delay_ms: 10,
            health_check: Default::default(),
            tool_namespace: None,
            resource_namespace: None,
            prompt_namespace: None,
            priority,
            tags: vec![],
        }
    }

    fn test_tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::Value::Null,
        }
    }

    /// S1 — namespace rewrite. A single backend `files` with
    /// `defaultNamespace=true` exposes tool `read_file`; the merged
    /// catalogue must expose it as `files.read_file`, not the bare name.
    #[tokio::test]
    async fn s1_namespace_rewrite_prefixes_identifier() {
        let backend = Arc::new(ManagedBackend::test_connected(
            "files",
            100,
            vec![test_tool("read_file")],
        ));
        let config = test_backend_config("files", 100);
        let active = vec![(backend, config)];

        let merged = merge_catalogue(
            &active,
            CapabilityKind::Tool,
            ConflictResolution::Namespace,
            true,
            |t: &Tool| t.name.as_str(),
            |backend| Box::pin(backend.cached_tools()),
        )
        .await
        .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].identifier, "files.read_file");
        assert_eq!(merged[0].owner, "files");
    }

    /// S2 — priority wins on conflict=first. Backends `a` (priority 10,
    /// tool `x`) and `b` (priority 20, tool `x`), `defaultNamespace=false`,
    /// `conflictResolution=first`. Expected listing: `x` once, owned by
    /// `a`; raising the resolution to `error` turns the same listing into
    /// a conflict.
    #[tokio::test]
    async fn s2_priority_wins_on_conflict_first() {
        let a = Arc::new(ManagedBackend::test_connected("a", 10, vec![test_tool("x")]));
        let b = Arc::new(ManagedBackend::test_connected("b", 20, vec![test_tool("x")]));
        let active = vec![
            (a, test_backend_config("a", 10)),
            (b, test_backend_config("b", 20)),
        ];

        let merged = merge_catalogue(
            &active,
            CapabilityKind::Tool,
            ConflictResolution::First,
            false,
            |t: &Tool| t.name.as_str(),
            |backend| Box::pin(backend.cached_tools()),
        )
        .await
        .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].identifier, "x");
        assert_eq!(merged[0].owner, "a");

        let conflict = merge_catalogue(
            &active,
            CapabilityKind::Tool,
            ConflictResolution::Error,
            false,
            |t: &Tool| t.name.as_str(),
            |backend| Box::pin(backend.cached_tools()),
        )
        .await;

        assert!(matches!(conflict, Err(GatewayError::Conflict(_))));
    }

    /// S6 — health-check driven failover. A backend that drops to `Failed`
    /// (simulating `max_failures` consecutive probe failures) disappears
    /// from `active_backends()` and its catalogue stops contributing to the
    /// aggregated view, without needing a live session to tear down.
    #[tokio::test]
    async fn s6_failed_backend_excluded_from_active_and_aggregation() {
        let bridge_config = crate::config::BridgeConfig {
            servers: vec![test_backend_config("a", 10), test_backend_config("b", 20)],
            bridge: crate::config::BridgeSettings::default(),
        };
        let (manager, backend_configs) = ServerManager::new(bridge_config);
        let configs: HashMap<String, BackendConfig> = backend_configs
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        let backend_a = manager.backend("a").unwrap();
        let backend_b = manager.backend("b").unwrap();
        backend_a
            .test_set_state(crate::types::BackendState::Connected)
            .await;
        backend_b
            .test_set_state(crate::types::BackendState::Connected)
            .await;
        backend_a.test_set_tools(vec![test_tool("ping")]).await;
        backend_b.test_set_tools(vec![test_tool("pong")]).await;

        let active_before = manager.active_backends(&configs).await;
        assert_eq!(active_before.len(), 2);
        let tools_before = aggregated_tools(&manager, &configs).await.unwrap();
        assert_eq!(tools_before.len(), 2);

        // Simulate the health-check loop tearing the backend down after
        // `max_failures` consecutive probe failures.
        backend_b
            .test_set_state(crate::types::BackendState::Failed)
            .await;

        let active_after = manager.active_backends(&configs).await;
        assert_eq!(active_after.len(), 1);
        assert_eq!(active_after[0].0.name, "a");

        let tools_after = aggregated_tools(&manager, &configs).await.unwrap();
        assert_eq!(tools_after.len(), 1);
        assert!(tools_after[0].identifier.ends_with("ping"));
    }
}
