//! Domain types shared across the gateway: capability payloads, transport
//! kind, and backend lifecycle state.
//!
//! Generalized from the teacher's single-backend `types.rs`: `McpStatus` /
//! `McpDetail` were specific to one connection being inspected through a
//! desktop UI and are replaced by `BackendStatus`, since a backend here is
//! one of many pooled by the manager. `Tool` / `Resource` carry over mostly
//! unchanged; `Prompt` is new, since the teacher never aggregated prompts.

use serde::{Deserialize, Serialize};

/// How a backend's child process/connection is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Backend lifecycle state, matching `server_manager.py`'s `ServerStatus`
/// plus the teacher's `Reconnecting` transitional state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Disabled,
}

/// Tool metadata exposed by a backend, as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Resource metadata exposed by a backend, as returned by `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Prompt metadata exposed by a backend, as returned by `prompts/list`. The
/// teacher never surfaced prompts (its UI only showed tools/resources); this
/// is grounded instead in `server_manager.py`'s `get_aggregated_prompts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// The three capability catalogues the aggregator merges. Kept as a single
/// enum (rather than three call sites) so the aggregator's generic merge
/// function can be parameterized on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    /// The separator used when building a namespaced identifier: `.` for
    /// tools/prompts (`namespace.name`), `://` for resources
    /// (`namespace://uri`), matching `server_manager.py`'s
    /// `get_aggregated_*` identifier construction.
    pub fn separator(self) -> &'static str {
        match self {
            CapabilityKind::Tool | CapabilityKind::Prompt => ".",
            CapabilityKind::Resource => "://",
        }
    }
}

/// Point-in-time status snapshot for one managed backend, surfaced by the
/// `/status` endpoint. Replaces the teacher's `McpStatus` (renamed fields,
/// dropped `proxy_url` since a backend is no longer individually proxied at
/// a stable per-id URL — the aggregator owns that routing now).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub state: BackendState,
    pub transport_type: TransportType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub failure_count: u32,
    pub tools_count: usize,
    pub resources_count: usize,
    pub prompts_count: usize,
    pub priority: u32,
}

pub fn format_system_time(time: std::time::SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Utc> = time.into();
    datetime.to_rfc3339()
}
