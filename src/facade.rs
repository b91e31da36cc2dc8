//! Aggregated server facade (C6): one MCP server object whose handlers
//! delegate list/call operations to [`crate::aggregator`].
//!
//! Grounded in `original_source/bridge_server.py::create_bridge_server`
//! (conditional handler registration per `aggregation.{tools,resources,
//! prompts}`, error-to-result translation at the boundary) and the
//! `ServerHandler` shape the corpus uses elsewhere for an MCP gateway
//! (`csa-mcp-hub/src/proxy.rs`'s `ProxyRouter`, the `wassette` binary's
//! `McpServer`): one method per MCP operation, `get_info` advertising
//! capabilities, an explicit `RequestContext<RoleServer>` per call.

use crate::aggregator;
use crate::error::GatewayError;
use crate::Gateway;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, CompleteRequestParams, CompleteResult,
    GetPromptRequestParams, GetPromptResult, Implementation, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam,
    ProtocolVersion, ReadResourceRequestParams, ReadResourceResult, ServerCapabilities,
    ServerInfo, SetLevelRequestParams, SubscribeRequestParams, UnsubscribeRequestParams,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use std::sync::Arc;

/// The gateway's single MCP-facing server object. Cheap to clone — it only
/// holds the `Arc<Gateway>` the CLI already built.
#[derive(Clone)]
pub struct AggregatedServer {
    gateway: Arc<Gateway>,
}

impl AggregatedServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    fn tools_enabled(&self) -> bool {
        self.gateway.manager.bridge.aggregation.tools
    }

    fn resources_enabled(&self) -> bool {
        self.gateway.manager.bridge.aggregation.resources
    }

    fn prompts_enabled(&self) -> bool {
        self.gateway.manager.bridge.aggregation.prompts
    }
}

/// Render a [`GatewayError`] into the single line of text a tool-call or
/// resource-read error result surfaces, per §4.6: "translate to a
/// structured error result visible in the capability's normal content
/// field" rather than raising a bare JSON-RPC exception.
fn error_summary(err: &GatewayError) -> String {
    format!("gateway error: {err}")
}

impl ServerHandler for AggregatedServer {
    fn get_info(&self) -> ServerInfo {
        let mut builder = ServerCapabilities::builder();
        if self.tools_enabled() {
            builder = builder.enable_tools();
        }
        if self.resources_enabled() {
            builder = builder.enable_resources();
        }
        if self.prompts_enabled() {
            builder = builder.enable_prompts();
        }
        builder = builder.enable_logging();

        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: builder.build(),
            server_info: Implementation {
                name: "mcp-bridge".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
            instructions: Some(
                "Aggregating MCP gateway: tools, resources, and prompts from every connected \
                 backend are namespaced and merged into this one server. Use the namespaced \
                 identifier (e.g. `backend.tool_name`) or the bare name if it is unambiguous."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        if !self.tools_enabled() {
            return Ok(ListToolsResult::with_all_items(vec![]));
        }
        match aggregator::aggregated_tools(&self.gateway.manager, &self.gateway.configs).await {
            Ok(merged) => Ok(ListToolsResult::with_all_items(
                merged
                    .into_iter()
                    .map(|m| rmcp::model::Tool {
                        name: m.identifier.into(),
                        description: m.item.description.map(Into::into),
                        input_schema: Arc::new(
                            m.item
                                .input_schema
                                .as_object()
                                .cloned()
                                .unwrap_or_default(),
                        ),
                        annotations: None,
                    })
                    .collect(),
            )),
            Err(err) => {
                tracing::error!("tools/list failed: {err}");
                Ok(ListToolsResult::with_all_items(vec![]))
            }
        }
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if !self.tools_enabled() {
            return Ok(error_result("tool aggregation is disabled"));
        }
        match aggregator::call_tool(
            &self.gateway.manager,
            &self.gateway.configs,
            request.name.as_ref(),
            request.arguments,
        )
        .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::warn!("tools/call '{}' failed: {err}", request.name);
                Ok(error_result(&error_summary(&err)))
            }
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        if !self.resources_enabled() {
            return Ok(ListResourcesResult {
                resources: vec![],
                next_cursor: None,
            });
        }
        match aggregator::aggregated_resources(&self.gateway.manager, &self.gateway.configs).await
        {
            Ok(merged) => Ok(ListResourcesResult {
                resources: merged
                    .into_iter()
                    .map(|m| rmcp::model::Resource {
                        uri: m.identifier,
                        name: m.item.name.unwrap_or_default(),
                        description: m.item.description,
                        mime_type: m.item.mime_type,
                        size: None,
                        annotations: None,
                    })
                    .collect(),
                next_cursor: None,
            }),
            Err(err) => {
                tracing::error!("resources/list failed: {err}");
                Ok(ListResourcesResult {
                    resources: vec![],
                    next_cursor: None,
                })
            }
        }
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        if !self.resources_enabled() {
            return Ok(error_resource_result(&request.uri, "resource aggregation is disabled"));
        }
        match aggregator::read_resource(&self.gateway.manager, &self.gateway.configs, &request.uri)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::warn!("resources/read '{}' failed: {err}", request.uri);
                Ok(error_resource_result(&request.uri, &error_summary(&err)))
            }
        }
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        // Not part of the merged catalogue (§3 invariants only cover
        // tools/resources/prompts); no backend template aggregation yet.
        Ok(ListResourceTemplatesResult {
            resource_templates: vec![],
            next_cursor: None,
        })
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        if !self.prompts_enabled() {
            return Ok(ListPromptsResult::with_all_items(vec![]));
        }
        match aggregator::aggregated_prompts(&self.gateway.manager, &self.gateway.configs).await {
            Ok(merged) => Ok(ListPromptsResult::with_all_items(
                merged
                    .into_iter()
                    .map(|m| rmcp::model::Prompt {
                        name: m.identifier,
                        description: m.item.description,
                        arguments: if m.item.arguments.is_empty() {
                            None
                        } else {
                            Some(
                                m.item
                                    .arguments
                                    .into_iter()
                                    .map(|a| rmcp::model::PromptArgument {
                                        name: a.name,
                                        description: a.description,
                                        required: Some(a.required),
                                    })
                                    .collect(),
                            )
                        },
                    })
                    .collect(),
            )),
            Err(err) => {
                tracing::error!("prompts/list failed: {err}");
                Ok(ListPromptsResult::with_all_items(vec![]))
            }
        }
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        if !self.prompts_enabled() {
            return Ok(error_prompt_result("prompt aggregation is disabled"));
        }
        match aggregator::get_prompt(
            &self.gateway.manager,
            &self.gateway.configs,
            request.name.as_ref(),
            request.arguments,
        )
        .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::warn!("prompts/get '{}' failed: {err}", request.name);
                Ok(error_prompt_result(&error_summary(&err)))
            }
        }
    }

    async fn subscribe(
        &self,
        request: SubscribeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        aggregator::subscribe_resource(&self.gateway.manager, &self.gateway.configs, &request.uri)
            .await
            .map_err(to_mcp_error)
    }

    async fn unsubscribe(
        &self,
        request: UnsubscribeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        aggregator::unsubscribe_resource(
            &self.gateway.manager,
            &self.gateway.configs,
            &request.uri,
        )
        .await
        .map_err(to_mcp_error)
    }

    /// Stubbed to an empty list of completions, per §4.6: the gateway does
    /// not forward `completion/complete` to backends in this core.
    async fn complete(
        &self,
        _request: CompleteRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CompleteResult, McpError> {
        Ok(CompleteResult {
            completion: rmcp::model::CompletionInfo {
                values: vec![],
                total: Some(0),
                has_more: Some(false),
            },
        })
    }

    /// Local log-level hint only — does not reconfigure the process-wide
    /// `tracing` filter, and is not forwarded to backends.
    async fn set_level(
        &self,
        request: SetLevelRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        tracing::info!("client requested logging level {:?}", request.level);
        Ok(())
    }
}

fn error_result(message: &str) -> CallToolResult {
    CallToolResult {
        content: vec![rmcp::model::Content::text(message.to_string())],
        is_error: Some(true),
        structured_content: None,
    }
}

fn error_resource_result(uri: &str, message: &str) -> ReadResourceResult {
    ReadResourceResult {
        contents: vec![rmcp::model::ResourceContents::TextResourceContents {
            uri: uri.to_string(),
            mime_type: Some("text/plain".into()),
            text: message.to_string(),
        }],
    }
}

fn error_prompt_result(message: &str) -> GetPromptResult {
    GetPromptResult {
        description: Some(message.to_string()),
        messages: vec![],
    }
}

fn to_mcp_error(err: GatewayError) -> McpError {
    McpError::internal_error(err.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_result_carries_is_error_flag() {
        let result = error_result("boom");
        assert_eq!(result.is_error, Some(true));
    }

    #[test]
    fn error_resource_result_echoes_uri() {
        let result = error_resource_result("fs://missing", "not found");
        match &result.contents[0] {
            rmcp::model::ResourceContents::TextResourceContents { uri, .. } => {
                assert_eq!(uri, "fs://missing");
            }
            _ => panic!("expected text resource contents"),
        }
    }
}
