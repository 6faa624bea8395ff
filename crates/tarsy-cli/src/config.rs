//! Deployment configuration: LLM providers, agents, tool servers and chain
//! definitions, loaded as one YAML document (spec §1: configuration loading
//! itself is out of scope of the core, but a composition root has to load
//! something).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tarsy_core::model::ChainDefinition;
use tarsy_runtime::agent_profile::AgentProfile;
use tarsy_runtime::llm::http_client::OpenAiCompatConfig;
use tarsy_runtime::tool::config::ToolServerConfig;
use tarsy_runtime::tool::masking::MaskingPattern;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

impl LlmProviderConfig {
    pub fn resolve(&self) -> OpenAiCompatConfig {
        let api_key = self
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        OpenAiCompatConfig {
            base_url: self.base_url.clone(),
            api_key,
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout_secs: self.timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MaskingLibraryConfig {
    #[serde(default)]
    pub patterns: HashMap<String, MaskingPattern>,
    #[serde(default)]
    pub pattern_groups: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    pub database_url: String,
    pub default_llm_provider: String,
    pub llm_providers: HashMap<String, LlmProviderConfig>,
    pub agents: HashMap<String, AgentProfile>,
    pub chat_agent: AgentProfile,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub masking_library: MaskingLibraryConfig,
    pub chains: Vec<ChainDefinition>,
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: u32,
    #[serde(default = "default_orphan_timeout_secs")]
    pub orphan_timeout_secs: u64,
}

fn default_max_summary_tokens() -> u32 {
    500
}

fn default_orphan_timeout_secs() -> u64 {
    600
}

impl RuntimeConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
        let config: RuntimeConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn find_chain(&self, alert_type: &str) -> Option<&ChainDefinition> {
        self.chains.iter().find(|c| c.matches_alert_type(alert_type))
    }
}
