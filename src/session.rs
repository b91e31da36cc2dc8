//! Client session (C2): a typed facade over one `rmcp` `RunningService`.
//!
//! Generalized from `connection.rs::execute_request`'s string-keyed method
//! dispatch into one typed method per MCP operation — internal callers
//! ([`crate::proxy`], [`crate::aggregator`]) want `Result<ListToolsResult>`,
//! not a raw `serde_json::Value` they have to re-parse.

use crate::error::GatewayError;
use crate::transport::Session;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, CompleteRequestParams, CompleteResult,
    GetPromptRequestParams, GetPromptResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, ProgressNotificationParams, ReadResourceRequestParams,
    ReadResourceResult, SetLevelRequestParams, SubscribeRequestParams, UnsubscribeRequestParams,
};

/// A connected backend's live session. Thin enough to be rebuilt cheaply
/// when [`crate::proxy`] decides recovery requires a fresh connection.
pub struct ClientSession {
    inner: Session,
}

impl ClientSession {
    pub fn new(inner: Session) -> Self {
        Self { inner }
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, GatewayError> {
        self.inner
            .list_tools(Default::default())
            .await
            .map_err(to_gateway_error)
    }

    pub async fn call_tool(
        &self,
        params: CallToolRequestParams,
    ) -> Result<CallToolResult, GatewayError> {
        self.inner.call_tool(params).await.map_err(to_gateway_error)
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult, GatewayError> {
        self.inner
            .list_resources(Default::default())
            .await
            .map_err(to_gateway_error)
    }

    pub async fn list_resource_templates(
        &self,
    ) -> Result<ListResourceTemplatesResult, GatewayError> {
        self.inner
            .list_resource_templates(Default::default())
            .await
            .map_err(to_gateway_error)
    }

    pub async fn read_resource(
        &self,
        params: ReadResourceRequestParams,
    ) -> Result<ReadResourceResult, GatewayError> {
        self.inner.read_resource(params).await.map_err(to_gateway_error)
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, GatewayError> {
        self.inner
            .list_prompts(Default::default())
            .await
            .map_err(to_gateway_error)
    }

    pub async fn get_prompt(
        &self,
        params: GetPromptRequestParams,
    ) -> Result<GetPromptResult, GatewayError> {
        self.inner.get_prompt(params).await.map_err(to_gateway_error)
    }

    pub async fn complete(&self, params: CompleteRequestParams) -> Result<CompleteResult, GatewayError> {
        self.inner.complete(params).await.map_err(to_gateway_error)
    }

    pub async fn set_level(&self, params: SetLevelRequestParams) -> Result<(), GatewayError> {
        self.inner.set_level(params).await.map_err(to_gateway_error)
    }

    pub async fn subscribe_resource(
        &self,
        params: SubscribeRequestParams,
    ) -> Result<(), GatewayError> {
        self.inner.subscribe(params).await.map_err(to_gateway_error)
    }

    pub async fn unsubscribe_resource(
        &self,
        params: UnsubscribeRequestParams,
    ) -> Result<(), GatewayError> {
        self.inner.unsubscribe(params).await.map_err(to_gateway_error)
    }

    /// Fire-and-forget per §4.2 — caller does not await a retry, only
    /// whether the notification left the wire.
    pub async fn send_progress_notification(
        &self,
        params: ProgressNotificationParams,
    ) -> Result<(), GatewayError> {
        self.inner
            .notify_progress(params)
            .await
            .map_err(to_gateway_error)
    }

    /// Lightweight liveness probe. `rmcp` has no dedicated ping RPC, so
    /// `tools/list` is reused, matching `connection.rs::ping`.
    pub async fn ping(&self) -> Result<(), GatewayError> {
        self.inner
            .list_tools(Default::default())
            .await
            .map(|_| ())
            .map_err(to_gateway_error)
    }

    pub async fn shutdown(self) {
        let _ = self.inner.cancel().await;
    }
}

/// `rmcp::service::ServiceError` doesn't expose a stable discriminant we can
/// match on across versions, so this classifies by the rendered message
/// instead — the same "inspect the text" approach `proxy_server.py` uses
/// for wrapped errors it didn't raise itself.
fn to_gateway_error(err: rmcp::ServiceError) -> GatewayError {
    let message = err.to_string();
    if GatewayError::text_is_session_loss(&message) {
        return GatewayError::protocol(crate::error::CODE_SESSION_NOT_FOUND, message);
    }
    GatewayError::Internal(anyhow::Error::new(err))
}
