//! Config file loading: JSON parsing, `${VAR}` / `${VAR:default}` expansion,
//! and non-fatal per-backend validation.
//!
//! Grounded in `config_loader.py`'s `expand_env_vars` (recursive
//! str/dict/list walk with the same regex) and
//! `load_bridge_config_from_file` / `validate_server_config` (warnings are
//! logged and the offending backend is dropped, never a hard load failure).
//! The atomic-write-to-disk and `Result`/`Context` idiom is carried from the
//! teacher's `ConfigManager::load`/`save`.

use crate::types::TransportType;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}:]+)(?::([^}]*))?\}").unwrap());

/// Recursively expand `${VAR}` / `${VAR:default}` references in every string
/// value of a JSON tree. Missing variables with no default expand to the
/// empty string and log a warning, mirroring `expand_env_vars`.
pub fn expand_env_vars(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(expand_env_vars_str(&s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(expand_env_vars).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, expand_env_vars(v)))
                .collect(),
        ),
        other => other,
    }
}

fn expand_env_vars_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;
    for caps in ENV_VAR_PATTERN.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        out.push_str(&input[last_end..whole.start()]);
        let var_name = caps.get(1).unwrap().as_str();
        let default = caps.get(2).map(|m| m.as_str());
        match (std::env::var(var_name), default) {
            (Ok(val), _) => out.push_str(&val),
            (Err(_), Some(default)) => out.push_str(default),
            (Err(_), None) => {
                tracing::warn!(
                    "environment variable '{}' is not set and no default was given",
                    var_name
                );
            }
        }
        last_end = whole.end();
    }
    out.push_str(&input[last_end..]);
    out
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Priority,
    Namespace,
    First,
    Error,
}

impl Default for ConflictResolution {
    fn default() -> Self {
        ConflictResolution::Namespace
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_health_timeout_ms() -> u64 {
    5_000
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_priority() -> u32 {
    100
}

/// Per-backend config, matching `config_loader.py`'s `BridgeServerConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub transport_type: TransportType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_namespace: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for TransportType {
    fn default() -> Self {
        TransportType::Stdio
    }
}

/// Effective namespace for one capability kind, per
/// `ManagedServer.get_effective_namespace`: an explicit per-kind override
/// wins, then the backend's own name if `default_namespace` is enabled,
/// else no namespace at all (flat merge).
impl BackendConfig {
    pub fn effective_namespace(
        &self,
        kind: crate::types::CapabilityKind,
        default_namespace: bool,
    ) -> Option<String> {
        let explicit = match kind {
            crate::types::CapabilityKind::Tool => &self.tool_namespace,
            crate::types::CapabilityKind::Resource => &self.resource_namespace,
            crate::types::CapabilityKind::Prompt => &self.prompt_namespace,
        };
        if let Some(ns) = explicit {
            return Some(ns.clone());
        }
        if default_namespace {
            return Some(self.name.clone());
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    #[serde(default = "default_true")]
    pub tools: bool,
    #[serde(default = "default_true")]
    pub resources: bool,
    #[serde(default = "default_true")]
    pub prompts: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
}

fn default_max_failures() -> u32 {
    3
}
fn default_recovery_interval_ms() -> u64 {
    60_000
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: default_max_failures(),
            recovery_interval_ms: default_recovery_interval_ms(),
        }
    }
}

/// Top-level bridge-wide policy, matching `config_loader.py`'s
/// `BridgeConfig` (the inner one, nested under `bridge` in the JSON file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    #[serde(default = "default_true")]
    pub default_namespace: bool,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictResolution::default(),
            default_namespace: true,
            aggregation: AggregationConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

/// Top-level config file shape, per §6.1: `mcpServers` map plus an optional
/// `bridge` settings block.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub servers: Vec<BackendConfig>,
    pub bridge: BridgeSettings,
}

#[derive(Debug, Deserialize)]
struct RawBridgeConfig {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: HashMap<String, serde_json::Value>,
    #[serde(default)]
    bridge: serde_json::Value,
}

/// Non-fatal warnings produced while validating one backend's raw JSON
/// entry, mirroring `validate_server_config`'s return-a-list-of-strings
/// shape rather than raising.
fn validate_backend_value(name: &str, value: &serde_json::Value) -> Vec<String> {
    let mut warnings = Vec::new();
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            warnings.push(format!("server '{name}': entry is not a JSON object"));
            return warnings;
        }
    };

    let transport = obj
        .get("transportType")
        .and_then(|v| v.as_str())
        .unwrap_or("stdio");

    if transport == "stdio" {
        match obj.get("command").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => {}
            _ => warnings.push(format!(
                "server '{name}': stdio transport requires a non-empty 'command'"
            )),
        }
    } else if matches!(transport, "sse" | "streamable_http" | "streamableHttp") {
        match obj.get("url").and_then(|v| v.as_str()) {
            Some(u) if !u.is_empty() => {}
            _ => warnings.push(format!(
                "server '{name}': {transport} transport requires a non-empty 'url'"
            )),
        }
    }

    if let Some(args) = obj.get("args") {
        if !args.is_array() {
            warnings.push(format!("server '{name}': 'args' must be an array"));
        }
    }
    if let Some(env) = obj.get("env") {
        if !env.is_object() {
            warnings.push(format!("server '{name}': 'env' must be an object"));
        }
    }
    if let Some(priority) = obj.get("priority") {
        if !priority.is_u64() {
            warnings.push(format!("server '{name}': 'priority' must be a non-negative integer"));
        }
    }
    if let Some(tags) = obj.get("tags") {
        if !tags.is_array() {
            warnings.push(format!("server '{name}': 'tags' must be an array"));
        }
    }

    warnings
}

impl BridgeConfig {
    /// Load, expand env vars, validate, and drop invalid backend entries
    /// (logging a warning for each) rather than failing the whole load —
    /// matches `load_bridge_config_from_file`'s per-server skip behavior.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let raw_json: serde_json::Value =
            serde_json::from_str(&data).context("failed to parse config file as JSON")?;
        let expanded = expand_env_vars(raw_json);
        let raw: RawBridgeConfig =
            serde_json::from_value(expanded).context("config file does not match expected shape")?;

        if raw.mcp_servers.is_empty() {
            return Err(anyhow::anyhow!("config file has no 'mcpServers' entries"));
        }

        let base_env: HashMap<String, String> = std::env::vars().collect();

        let mut servers = Vec::new();
        for (name, value) in raw.mcp_servers {
            let warnings = validate_backend_value(&name, &value);
            if !warnings.is_empty() {
                for w in &warnings {
                    tracing::warn!("{w}");
                }
                let fatal = warnings
                    .iter()
                    .any(|w| w.contains("requires a non-empty") || w.contains("not a JSON object"));
                if fatal {
                    tracing::warn!("server '{name}': dropping due to invalid configuration");
                    continue;
                }
            }

            let mut backend: BackendConfig = match serde_json::from_value(value) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("server '{name}': failed to parse, dropping: {e}");
                    continue;
                }
            };
            backend.name = name;

            let mut merged_env = base_env.clone();
            merged_env.extend(backend.env.drain());
            backend.env = merged_env;

            servers.push(backend);
        }

        let bridge: BridgeSettings = if raw.bridge.is_null() {
            BridgeSettings::default()
        } else {
            serde_json::from_value(raw.bridge).context("invalid 'bridge' settings block")?
        };

        Ok(BridgeConfig { servers, bridge })
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }

        let mcp_servers: HashMap<&str, &BackendConfig> =
            self.servers.iter().map(|s| (s.name.as_str(), s)).collect();
        let doc = serde_json::json!({
            "mcpServers": mcp_servers,
            "bridge": self.bridge,
        });
        let data = serde_json::to_string_pretty(&doc).context("failed to serialize config")?;
        std::fs::write(path, data).context("failed to write config file")?;
        tracing::info!("saved config to {}", path.display());
        Ok(())
    }
}

/// Resolve a config file path from the CLI, falling back to the
/// `MCP_BRIDGE_CONFIG` environment variable, matching the teacher's
/// "explicit path wins, else a sensible default" idiom.
pub fn resolve_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path
        .or_else(|| std::env::var("MCP_BRIDGE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("mcp-bridge.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_var_with_default() {
        std::env::remove_var("MCP_BRIDGE_TEST_UNSET");
        let out = expand_env_vars_str("${MCP_BRIDGE_TEST_UNSET:fallback}");
        assert_eq!(out, "fallback");
    }

    #[test]
    fn expands_var_from_environment() {
        std::env::set_var("MCP_BRIDGE_TEST_SET", "value123");
        let out = expand_env_vars_str("prefix-${MCP_BRIDGE_TEST_SET}-suffix");
        assert_eq!(out, "prefix-value123-suffix");
        std::env::remove_var("MCP_BRIDGE_TEST_SET");
    }

    #[test]
    fn missing_var_with_no_default_becomes_empty() {
        std::env::remove_var("MCP_BRIDGE_TEST_MISSING");
        let out = expand_env_vars_str("${MCP_BRIDGE_TEST_MISSING}");
        assert_eq!(out, "");
    }

    #[test]
    fn validate_backend_flags_missing_command() {
        let value = serde_json::json!({"transportType": "stdio"});
        let warnings = validate_backend_value("demo", &value);
        assert!(warnings.iter().any(|w| w.contains("requires a non-empty 'command'")));
    }

    #[test]
    fn effective_namespace_prefers_explicit_override() {
        let backend_json = serde_json::json!({
            "command": "echo",
            "toolNamespace": "custom",
        });
        let mut backend: BackendConfig = serde_json::from_value(backend_json).unwrap();
        backend.name = "demo".to_string();
        let ns = backend.effective_namespace(crate::types::CapabilityKind::Tool, true);
        assert_eq!(ns.as_deref(), Some("custom"));
    }

    #[test]
    fn effective_namespace_falls_back_to_name() {
        let backend = BackendConfig {
            name: "demo".into(),
            enabled: true,
            transport_type: TransportType::Stdio,
            command: Some("echo".into()),
            args: vec![],
            url: None,
            env: HashMap::new(),
            headers: None,
            timeout_secs: 60,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            health_check: HealthCheckConfig::default(),
            tool_namespace: None,
            resource_namespace: None,
            prompt_namespace: None,
            priority: 100,
            tags: vec![],
        };
        assert_eq!(
            backend
                .effective_namespace(crate::types::CapabilityKind::Tool, true)
                .as_deref(),
            Some("demo")
        );
        assert_eq!(
            backend.effective_namespace(crate::types::CapabilityKind::Tool, false),
            None
        );
    }
}
