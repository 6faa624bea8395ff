//! LLM Client: uniform chat-style capability with optional native
//! tool-calling and native "thinking" (spec §4, component 5).
//!
//! `ChatRole` is the closed, tagged-variant rendition of the source's
//! dynamically-typed role string (spec §9 design notes).

use std::collections::HashMap;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use tarsy_core::model::TokenUsage;

pub mod http_client;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A parsed tool invocation request, either produced by the ReAct text
/// parser or returned natively by a tool-calling provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub server: String,
    pub tool: String,
    pub arguments_json: String,
}

/// One turn in a conversation. Kept intentionally simpler than a
/// general-purpose chat library's message type (no images/audio) since
/// every turn here is either an instruction, a model response, or a
/// rendered tool observation -- all text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: ChatRole,
    pub content: String,
    /// Present on assistant messages from a native tool-calling provider.
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present on `Tool`-role messages: which call this is the result of.
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into(), tool_calls: None, tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into(), tool_calls: None, tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into(), tool_calls: None, tool_call_id: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// JSON-schema description of one callable tool, as handed to a
/// tool-calling provider or rendered into a ReAct tool catalog.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParametersSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    pub parameters: ParametersSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionTool,
}

impl Tool {
    /// `server.tool` -- the fully-qualified name used by the ReAct `Action:`
    /// line and by native tool-call routing.
    pub fn qualified_name(&self, server: &str) -> String {
        format!("{server}.{}", self.function.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

/// Result of one LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present only for providers that support native "thinking".
    pub thinking: Option<String>,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
}

/// Uniform chat-style capability. A provider that doesn't support native
/// tool-calling simply ignores `tools` and relies on the ReAct controller's
/// text parsing; `supports_native_tools`/`supports_thinking` let a
/// controller pick its strategy without downcasting.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn supports_native_tools(&self) -> bool {
        false
    }

    fn supports_thinking(&self) -> bool {
        false
    }

    async fn chat(
        &self,
        messages: &[LlmMessage],
        tools: Option<&[Tool]>,
    ) -> Result<LlmResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_joins_server_and_tool() {
        let tool = Tool {
            tool_type: "function".into(),
            function: FunctionTool {
                name: "get_pods".into(),
                description: "".into(),
                parameters: ParametersSchema {
                    schema_type: "object".into(),
                    properties: HashMap::new(),
                    required: vec![],
                },
            },
        };
        assert_eq!(tool.qualified_name("kubernetes-server"), "kubernetes-server.get_pods");
    }
}
