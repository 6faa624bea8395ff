//! Tool Client: uniform capability for listing and invoking tools across
//! stdio/HTTP/SSE tool servers (spec §4.6).

pub mod config;
pub mod masking;
pub mod mcp_client;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolClientError;
use crate::llm::Tool;

/// Canonicalized tool-call outcome, replacing the source's duck-typed
/// per-transport result shape with one closed type (spec §9 design notes).
/// Transport failures surface here rather than as an error return (spec
/// §4.6): the only `Err` case is a genuinely invalid request (unknown
/// server, bad config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: serde_json::Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: serde_json::Value) -> Self {
        Self { success: true, content, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, content: serde_json::Value::Null, error: Some(error.into()) }
    }
}

/// Uniform capability for listing and invoking tools across tool servers.
/// Session-scoped only insofar as the caller passes a `session_id` through
/// for logging/masking context; the underlying transports are process-wide
/// and initialize lazily on first use (spec §4.6).
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn list_tools(
        &self,
        session_id: &str,
        server_name: Option<&str>,
    ) -> Result<HashMap<String, Vec<Tool>>, ToolClientError>;

    async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        session_id: &str,
    ) -> ToolResult;
}
