//! MCP-backed `ToolClient`, adapted from rmcp stdio/HTTP/SSE transports.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::{header::AUTHORIZATION, HeaderValue};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use rmcp::model::CallToolRequestParam;
use rmcp::model::Tool as RmcpTool;
use rmcp::service::{DynService, RunningService};
use rmcp::{
    model::{ClientCapabilities, ClientInfo, Implementation, ProtocolVersion},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        SseClientTransport, StreamableHttpClientTransport,
    },
    RoleClient, ServiceExt,
};
use std::convert::TryFrom;
use std::process::Stdio;

use crate::error::ToolClientError;
use crate::llm::{FunctionTool, ParametersSchema, Tool};
use crate::tool::config::{ToolServerConfig, TransportConfig};
use crate::tool::masking::{Masker, MaskingConfig};
use crate::tool::{ToolClient, ToolResult};

type RmcpClient = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

impl TryFrom<RmcpTool> for FunctionTool {
    type Error = ToolClientError;

    fn try_from(r: RmcpTool) -> Result<Self, Self::Error> {
        let tool_name = r.name.into_owned();
        let mut schema_map = serde_json::Map::new();
        for (k, v) in r.input_schema.as_ref().iter() {
            schema_map.insert(k.clone(), v.clone());
        }
        let parameters: ParametersSchema = serde_json::from_value(serde_json::Value::Object(schema_map))
            .map_err(|e| ToolClientError::InvalidConfig(format!("tool `{tool_name}` has an invalid schema: {e}")))?;
        Ok(FunctionTool { name: tool_name, description: r.description.into_owned(), parameters })
    }
}

impl TryFrom<RmcpTool> for Tool {
    type Error = ToolClientError;

    fn try_from(r: RmcpTool) -> Result<Self, Self::Error> {
        Ok(Tool { tool_type: "function".to_string(), function: FunctionTool::try_from(r)? })
    }
}

struct ServerHandle {
    client: RmcpClient,
    masking: Option<MaskingConfig>,
}

/// Lazily-initialized, per-server MCP tool client. Survives the failure of
/// any one server: a transport that never connects just keeps surfacing
/// `ToolResult::failed` for that server's calls.
pub struct McpToolClient {
    configs: HashMap<String, ToolServerConfig>,
    servers: Mutex<HashMap<String, Arc<ServerHandle>>>,
    masker: Mutex<Masker>,
    client_info: Implementation,
}

impl McpToolClient {
    pub fn new(
        configs: Vec<ToolServerConfig>,
        masker: Masker,
        client_info: Implementation,
    ) -> Result<Self, ToolClientError> {
        let mut map = HashMap::new();
        for mut cfg in configs {
            cfg.validate()?;
            map.insert(cfg.name.clone(), cfg);
        }
        Ok(Self {
            configs: map,
            servers: Mutex::new(HashMap::new()),
            masker: Mutex::new(masker),
            client_info,
        })
    }

    async fn connect(&self, server_name: &str) -> Result<Arc<ServerHandle>, ToolClientError> {
        if let Some(existing) = self.servers.lock().get(server_name).cloned() {
            return Ok(existing);
        }

        let cfg = self
            .configs
            .get(server_name)
            .ok_or_else(|| ToolClientError::UnknownServer(server_name.to_string()))?
            .clone();

        let client = start_transport(&cfg.transport, &self.client_info)
            .await
            .map_err(|e| ToolClientError::Transport(format!("{server_name}: {e}")))?;

        let handle = Arc::new(ServerHandle { client, masking: cfg.masking });
        self.servers.lock().insert(server_name.to_string(), handle.clone());
        Ok(handle)
    }
}

async fn start_transport(
    transport: &TransportConfig,
    client_impl: &Implementation,
) -> anyhow::Result<RmcpClient> {
    let client_info = ClientInfo {
        protocol_version: ProtocolVersion::default(),
        capabilities: ClientCapabilities::default(),
        client_info: client_impl.clone(),
    };

    let client = match transport {
        TransportConfig::Sse { url, bearer_token, timeout, .. } => {
            let transport = match bearer_token {
                Some(t) => {
                    let client = reqwest_client_with_bearer(t, *timeout)?;
                    SseClientTransport::start_with_client(
                        client,
                        SseClientConfig { sse_endpoint: url.clone().into(), ..Default::default() },
                    )
                    .await?
                }
                None => SseClientTransport::start(url.as_str()).await?,
            };
            client_info.clone().into_dyn().serve(transport).await?
        }
        TransportConfig::Http { url, bearer_token, timeout, .. } => {
            let transport = match bearer_token {
                Some(t) => {
                    let client = reqwest_client_with_bearer(t, *timeout)?;
                    StreamableHttpClientTransport::with_client(
                        client,
                        StreamableHttpClientTransportConfig { uri: url.clone().into(), ..Default::default() },
                    )
                }
                None => StreamableHttpClientTransport::from_uri(url.clone()),
            };
            client_info.clone().into_dyn().serve(transport).await?
        }
        TransportConfig::Stdio { command, .. }
            if !(which::which(command).is_ok() || std::path::Path::new(&command).exists()) =>
        {
            anyhow::bail!("command not found: {command}");
        }
        TransportConfig::Stdio { command, args, env, .. } => {
            let mut cmd = tokio::process::Command::new(command);
            cmd.args(args).envs(env).stderr(Stdio::inherit()).stdout(Stdio::piped()).stdin(Stdio::piped());
            let transport = rmcp::transport::child_process::TokioChildProcess::new(cmd)?;
            client_info.clone().into_dyn().serve(transport).await?
        }
    };
    Ok(client)
}

fn reqwest_client_with_bearer(token: &str, timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    Ok(reqwest::ClientBuilder::new()
        .default_headers(headers)
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

#[async_trait]
impl ToolClient for McpToolClient {
    async fn list_tools(
        &self,
        _session_id: &str,
        server_name: Option<&str>,
    ) -> Result<HashMap<String, Vec<Tool>>, ToolClientError> {
        let names: Vec<String> = match server_name {
            Some(n) => vec![n.to_string()],
            None => self.configs.keys().cloned().collect(),
        };

        let mut out = HashMap::new();
        for name in names {
            let handle = self.connect(&name).await?;
            let rmcp_tools = handle
                .client
                .peer()
                .list_all_tools()
                .await
                .map_err(|e| ToolClientError::Transport(format!("{name}: {e}")))?;
            let mut tools = Vec::with_capacity(rmcp_tools.len());
            for t in rmcp_tools {
                tools.push(Tool::try_from(t)?);
            }
            out.insert(name, tools);
        }
        Ok(out)
    }

    async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        _session_id: &str,
    ) -> ToolResult {
        let handle = match self.connect(server_name).await {
            Ok(h) => h,
            Err(e) => return ToolResult::failed(e.to_string()),
        };

        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            _ => None,
        };

        let result = handle
            .client
            .peer()
            .call_tool(CallToolRequestParam { name: tool_name.to_string().into(), arguments })
            .await;

        let content = match result {
            Ok(r) => match serde_json::to_value(&r) {
                Ok(v) => v,
                Err(e) => return ToolResult::failed(format!("failed to serialize tool result: {e}")),
            },
            Err(e) => return ToolResult::failed(format!("{server_name}.{tool_name}: {e}")),
        };

        let masked = match &handle.masking {
            Some(config) => self.masker.lock().mask_response(&content, config, server_name),
            None => content,
        };

        ToolResult::ok(masked)
    }
}
