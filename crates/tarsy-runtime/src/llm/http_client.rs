//! OpenAI-compatible HTTP `LlmClient` (spec §4, component 5).
//!
//! Speaks the `chat/completions` wire format shared by OpenAI and the
//! growing set of self-hosted/compatible backends (vLLM, Ollama's OpenAI
//! shim, Azure OpenAI, etc.) -- one request/response shape covers all of
//! them, with only the base URL, model name and auth header differing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tarsy_core::model::TokenUsage;

use crate::error::LlmError;
use crate::llm::{ChatRole, FinishReason, LlmClient, LlmMessage, LlmResponse, Tool, ToolCall};

#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_secs: u64,
}

impl OpenAiCompatConfig {
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.openai.com/v1/".into(),
            api_key: Some(api_key.into()),
            model: model.into(),
            max_tokens: None,
            temperature: None,
            timeout_secs: 60,
        }
    }
}

/// Native tool-calling OpenAI-compatible client. Tool calls come back
/// addressed as a single flat function name (`arguments` is a raw JSON
/// string); this client reconstructs the `server.tool` split the rest of
/// the runtime expects from the qualified name the controller handed it
/// in [`Tool::qualified_name`].
pub struct HttpLlmClient {
    http: reqwest::Client,
    config: OpenAiCompatConfig,
}

impl HttpLlmClient {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(LlmError::from)?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.config.api_key {
            if key.is_empty() {
                return Err(LlmError::Auth("missing API key".into()));
            }
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| LlmError::Auth(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    fn supports_native_tools(&self) -> bool {
        true
    }

    async fn chat(&self, messages: &[LlmMessage], tools: Option<&[Tool]>) -> Result<LlmResponse, LlmError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: messages.iter().map(to_wire_message).collect(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            tools: tools.map(|t| t.to_vec()),
            stream: false,
        };

        let response = self
            .http
            .post(self.endpoint("chat/completions"))
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = extract_error_message(&text).unwrap_or(text);
            return Err(match status.as_u16() {
                401 | 403 => LlmError::Auth(message),
                400 => LlmError::InvalidRequest(message),
                _ => LlmError::Provider(format!("HTTP {}: {message}", status.as_u16())),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(LlmError::from)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseFormat {
                message: "no choices in response".into(),
                raw_response: String::new(),
            })?;

        let tool_calls = choice.message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|c| split_qualified_name(c.id, c.function.name, c.function.arguments))
                .collect()
        });

        Ok(LlmResponse {
            text: choice.message.content,
            tool_calls,
            thinking: None,
            finish_reason: match choice.finish_reason.as_str() {
                "stop" => FinishReason::Stop,
                "length" => FinishReason::Length,
                "tool_calls" | "function_call" => FinishReason::ToolCalls,
                _ => FinishReason::Stop,
            },
            usage: parsed.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.prompt_tokens + u.completion_tokens,
            }),
        })
    }
}

fn split_qualified_name(id: String, qualified: String, arguments_json: String) -> ToolCall {
    match qualified.split_once('.') {
        Some((server, tool)) => ToolCall { id, server: server.to_string(), tool: tool.to_string(), arguments_json },
        None => ToolCall { id, server: String::new(), tool: qualified, arguments_json },
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.pointer("/error/message")?.as_str().map(str::to_string)
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

fn to_wire_message(msg: &LlmMessage) -> WireMessage {
    WireMessage {
        role: match msg.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
        .to_string(),
        content: Some(msg.content.clone()),
        tool_calls: msg.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| WireToolCall {
                    id: c.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunctionCall {
                        name: format!("{}.{}", c.server, c.tool),
                        arguments: c.arguments_json.clone(),
                    },
                })
                .collect()
        }),
        tool_call_id: msg.tool_call_id.clone(),
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<RawUsage>,
}

#[derive(Deserialize)]
struct Choice {
    finish_reason: String,
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChoiceToolCall>>,
}

#[derive(Deserialize)]
struct ChoiceToolCall {
    id: String,
    function: ChoiceFunctionCall,
}

#[derive(Deserialize)]
struct ChoiceFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct RawUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_qualified_name_separates_server_and_tool() {
        let call = split_qualified_name("c1".into(), "kubernetes-server.get_pods".into(), "{}".into());
        assert_eq!(call.server, "kubernetes-server");
        assert_eq!(call.tool, "get_pods");
    }

    #[test]
    fn split_qualified_name_falls_back_when_unqualified() {
        let call = split_qualified_name("c1".into(), "get_pods".into(), "{}".into());
        assert_eq!(call.server, "");
        assert_eq!(call.tool, "get_pods");
    }

    #[test]
    fn extract_error_message_reads_openai_shape() {
        let body = r#"{"error":{"message":"invalid api key"}}"#;
        assert_eq!(extract_error_message(body), Some("invalid api key".to_string()));
    }

    #[test]
    fn endpoint_joins_base_url_and_path() {
        let client = HttpLlmClient::new(OpenAiCompatConfig::openai("sk-test", "gpt-4o")).unwrap();
        assert_eq!(client.endpoint("chat/completions"), "https://api.openai.com/v1/chat/completions");
    }
}
