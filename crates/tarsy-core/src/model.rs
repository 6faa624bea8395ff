//! The chain execution data model (spec §3).
//!
//! Dynamic-typing-flavoured unions from the source system become closed,
//! serde-tagged Rust enums here: `AgentExecutionResult`/`ParallelStageResult`
//! are two branches of one sum type under a single `stage_outputs[name]`
//! slot, status fields are closed enums, not strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::MicroTimestamp;

pub type SessionId = String;
pub type StageExecutionId = String;
pub type InteractionId = String;
pub type ChainId = String;
pub type ChatId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Immutable record of an incoming alert.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ProcessingAlert {
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub timestamp_us: MicroTimestamp,
    pub environment: Option<String>,
    pub runbook_url: Option<String>,
    /// Free-form payload; required to be non-empty at construction time.
    pub alert_data: serde_json::Map<String, serde_json::Value>,
    pub slack_message_fingerprint: Option<String>,
}

impl ProcessingAlert {
    pub fn validate(&self) -> Result<(), String> {
        if self.alert_type.trim().is_empty() {
            return Err("alert_type must not be empty".into());
        }
        if self.alert_data.is_empty() {
            return Err("alert_data must not be empty".into());
        }
        Ok(())
    }
}

/// One agent bound into a `multi_agent` parallel stage.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ParallelAgentConfig {
    pub agent_name: String,
    pub llm_provider: Option<String>,
    pub iteration_strategy: Option<IterationStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IterationStrategy {
    React,
    ReactStage,
    NativeThinking,
    Synthesis,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuccessPolicy {
    All,
    Any,
}

/// How a stage fans out work across agents.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParallelismKind {
    Single { agent_name: String },
    MultiAgent { agents: Vec<ParallelAgentConfig> },
    Replica { agent_name: String, replicas: u32 },
}

/// Post-parallel aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SynthesisConfig {
    pub llm_provider: Option<String>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct StageDefinition {
    pub name: String,
    pub parallelism: ParallelismKind,
    pub iteration_strategy: Option<IterationStrategy>,
    pub llm_provider: Option<String>,
    pub success_policy: SuccessPolicy,
    pub synthesis: Option<SynthesisConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ChatConfig {
    pub llm_provider: Option<String>,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ChainDefinition {
    pub chain_id: ChainId,
    pub alert_types: Vec<String>,
    pub stages: Vec<StageDefinition>,
    pub chat_config: Option<ChatConfig>,
}

impl ChainDefinition {
    pub fn matches_alert_type(&self, alert_type: &str) -> bool {
        self.alert_types.iter().any(|t| t == alert_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentExecutionStatus {
    Completed,
    Failed,
    Partial,
    Cancelled,
    Paused,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0
    }
}

/// Terminal outcome of one agent execution.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AgentExecutionResult {
    pub status: AgentExecutionStatus,
    pub agent_name: String,
    pub timestamp_us: MicroTimestamp,
    pub result_summary: String,
    pub final_analysis: Option<String>,
    pub error_message: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl AgentExecutionResult {
    /// Whether this result should surface to downstream stages via
    /// `ChainContext::previous_stages_results`.
    pub fn is_surfaced(&self) -> bool {
        matches!(self.status, AgentExecutionStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParallelType {
    MultiAgent,
    Replica,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AgentExecutionMetadata {
    pub agent_name: String,
    pub provider: Option<String>,
    pub strategy: IterationStrategy,
    pub status: AgentExecutionStatus,
    pub started_at_us: MicroTimestamp,
    pub completed_at_us: Option<MicroTimestamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ParallelStageMetadata {
    pub parent_stage_execution_id: StageExecutionId,
    pub parallel_type: ParallelType,
    pub success_policy: SuccessPolicy,
    pub started_at_us: MicroTimestamp,
    pub completed_at_us: Option<MicroTimestamp>,
    pub agent_metadatas: Vec<AgentExecutionMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageAggregateStatus {
    Completed,
    Failed,
    Partial,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ParallelStageResult {
    pub stage_name: String,
    pub children: Vec<AgentExecutionResult>,
    pub metadata: ParallelStageMetadata,
    pub status: StageAggregateStatus,
    pub successful_count: u32,
    pub failed_count: u32,
    pub paused_count: u32,
}

/// One slot of `ChainContext.stage_outputs`: either a single-agent result or
/// an aggregated parallel-stage result. Two branches of one sum type, per
/// the tagged-variant guidance for the source's duck-typed union.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Single(AgentExecutionResult),
    Parallel(ParallelStageResult),
}

impl StageOutput {
    /// The representative final analysis for this stage, used when building
    /// prompts for downstream stages (post-synthesis result for parallel
    /// stages, the agent's own result for single-agent stages).
    pub fn representative_analysis(&self) -> Option<&str> {
        match self {
            StageOutput::Single(r) => r.final_analysis.as_deref(),
            StageOutput::Parallel(p) => p
                .children
                .iter()
                .find(|c| c.is_surfaced())
                .and_then(|c| c.final_analysis.as_deref()),
        }
    }

    pub fn is_surfaced(&self) -> bool {
        match self {
            StageOutput::Single(r) => r.is_surfaced(),
            StageOutput::Parallel(p) => matches!(
                p.status,
                StageAggregateStatus::Completed | StageAggregateStatus::Partial
            ),
        }
    }

    pub fn token_usage(&self) -> Option<TokenUsage> {
        match self {
            StageOutput::Single(r) => r.token_usage.clone(),
            StageOutput::Parallel(p) => {
                let mut total = TokenUsage::default();
                let mut any = false;
                for child in &p.children {
                    if let Some(u) = &child.token_usage {
                        total.add(u);
                        any = true;
                    }
                }
                any.then_some(total)
            }
        }
    }
}

/// Per-session mutable chain state. Owned exclusively by the Scheduler:
/// controllers read through [`ChainContext::previous_stages_results`] and
/// never mutate `stage_outputs` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainContext {
    pub alert_type: String,
    pub alert_data: serde_json::Map<String, serde_json::Value>,
    pub session_id: SessionId,
    pub current_stage_name: Option<String>,
    pub runbook_content: Option<String>,
    pub chain_id: ChainId,
    /// Insertion order is execution order.
    pub stage_outputs: Vec<(String, StageOutput)>,
    pub chat_context: Option<ChatContextSnapshot>,
}

impl ChainContext {
    pub fn new(
        alert: &ProcessingAlert,
        session_id: SessionId,
        chain_id: ChainId,
        runbook_content: Option<String>,
    ) -> Self {
        Self {
            alert_type: alert.alert_type.clone(),
            alert_data: alert.alert_data.clone(),
            session_id,
            current_stage_name: None,
            runbook_content,
            chain_id,
            stage_outputs: Vec::new(),
            chat_context: None,
        }
    }

    /// Append-only: only a controlled resume re-entry may replace an
    /// existing slot for the same stage name.
    pub fn append_stage_output(&mut self, stage_name: impl Into<String>, output: StageOutput) {
        self.stage_outputs.push((stage_name.into(), output));
    }

    /// Only COMPLETED (or PARTIAL-surfaced) stages are visible downstream.
    pub fn previous_stages_results(&self) -> Vec<(&str, &StageOutput)> {
        self.stage_outputs
            .iter()
            .filter(|(_, out)| out.is_surfaced())
            .map(|(name, out)| (name.as_str(), out))
            .collect()
    }

    /// `session_total_tokens = Σ stage_total_tokens` over stages with
    /// non-null totals (spec §8 invariant 10, §9 open question resolved:
    /// see `docs` in the repo-level design ledger).
    pub fn total_token_usage(&self) -> Option<TokenUsage> {
        let mut total = TokenUsage::default();
        let mut any = false;
        for (_, out) in &self.stage_outputs {
            if let Some(usage) = out.token_usage() {
                if !usage.is_zero() {
                    total.add(&usage);
                    any = true;
                }
            }
        }
        any.then_some(total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceling,
    Cancelled,
    Paused,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSession {
    pub session_id: SessionId,
    pub chain_id: ChainId,
    pub alert_type: String,
    pub agent_type: String,
    pub status: SessionStatus,
    pub author: String,
    pub started_at_us: MicroTimestamp,
    pub completed_at_us: Option<MicroTimestamp>,
    pub final_analysis: Option<String>,
    pub final_analysis_summary: Option<String>,
    pub error_message: Option<String>,
    pub alert_data: serde_json::Map<String, serde_json::Value>,
    pub slack_message_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub execution_id: StageExecutionId,
    pub session_id: SessionId,
    pub stage_id: String,
    pub stage_index: u32,
    pub stage_name: String,
    pub agent: String,
    pub iteration_strategy: Option<IterationStrategy>,
    pub status: StageStatus,
    pub started_at_us: Option<MicroTimestamp>,
    pub paused_at_us: Option<MicroTimestamp>,
    pub completed_at_us: Option<MicroTimestamp>,
    pub duration_ms: Option<i64>,
    pub stage_output: Option<StageOutput>,
    pub error_message: Option<String>,
    pub parent_execution_id: Option<StageExecutionId>,
}

/// Discriminates LLM vs tool interactions persisted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionDetail {
    Llm {
        provider: String,
        model: String,
        token_usage: Option<TokenUsage>,
    },
    Tool {
        server: String,
        tool: String,
        arguments: serde_json::Value,
        result: Option<serde_json::Value>,
    },
}

/// One atomic, append-only record of an LLM or tool-server call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub interaction_id: InteractionId,
    pub session_id: SessionId,
    pub stage_execution_id: Option<StageExecutionId>,
    pub started_at_us: MicroTimestamp,
    pub completed_at_us: MicroTimestamp,
    pub duration_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub detail: InteractionDetail,
}

impl Interaction {
    /// Spec §8 invariant 2: duration is non-negative, and failures always
    /// carry a non-empty error message.
    pub fn is_well_formed(&self) -> bool {
        self.duration_ms >= 0 && (self.success || self.error_message.is_some())
    }
}

/// A durable, broadcast message attached to a channel (spec §3, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub channel: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub created_at_us: MicroTimestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatContextSnapshot {
    pub alert_type: String,
    pub final_analysis: String,
    pub stage_summaries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: ChatId,
    pub session_id: SessionId,
    pub created_by: String,
    pub created_at_us: MicroTimestamp,
    pub investigation_context: ChatContextSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUserMessage {
    pub message_id: String,
    pub chat_id: ChatId,
    pub stage_execution_id: StageExecutionId,
    pub content: String,
    pub author: String,
    pub created_at_us: MicroTimestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(total: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: total / 2,
            output_tokens: total - total / 2,
            total_tokens: total,
        }
    }

    #[test]
    fn chain_context_only_surfaces_completed_stages() {
        let alert = ProcessingAlert {
            alert_type: "X".into(),
            severity: AlertSeverity::Warning,
            timestamp_us: 0,
            environment: None,
            runbook_url: None,
            alert_data: serde_json::json!({"a": 1}).as_object().unwrap().clone(),
            slack_message_fingerprint: None,
        };
        let mut ctx = ChainContext::new(&alert, "s1".into(), "c1".into(), None);
        ctx.append_stage_output(
            "analysis",
            StageOutput::Single(AgentExecutionResult {
                status: AgentExecutionStatus::Completed,
                agent_name: "KubernetesAgent".into(),
                timestamp_us: 0,
                result_summary: "ok".into(),
                final_analysis: Some("done".into()),
                error_message: None,
                token_usage: Some(usage(10)),
            }),
        );
        ctx.append_stage_output(
            "remediation",
            StageOutput::Single(AgentExecutionResult {
                status: AgentExecutionStatus::Failed,
                agent_name: "RemediationAgent".into(),
                timestamp_us: 0,
                result_summary: "".into(),
                final_analysis: None,
                error_message: Some("boom".into()),
                token_usage: None,
            }),
        );
        let visible = ctx.previous_stages_results();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].0, "analysis");
    }

    #[test]
    fn total_token_usage_skips_stages_without_data() {
        let alert = ProcessingAlert {
            alert_type: "X".into(),
            severity: AlertSeverity::Info,
            timestamp_us: 0,
            environment: None,
            runbook_url: None,
            alert_data: serde_json::json!({"a": 1}).as_object().unwrap().clone(),
            slack_message_fingerprint: None,
        };
        let mut ctx = ChainContext::new(&alert, "s1".into(), "c1".into(), None);
        ctx.append_stage_output(
            "a",
            StageOutput::Single(AgentExecutionResult {
                status: AgentExecutionStatus::Completed,
                agent_name: "A".into(),
                timestamp_us: 0,
                result_summary: "".into(),
                final_analysis: Some("x".into()),
                error_message: None,
                token_usage: Some(usage(5)),
            }),
        );
        ctx.append_stage_output(
            "b",
            StageOutput::Single(AgentExecutionResult {
                status: AgentExecutionStatus::Completed,
                agent_name: "B".into(),
                timestamp_us: 0,
                result_summary: "".into(),
                final_analysis: Some("y".into()),
                error_message: None,
                token_usage: None,
            }),
        );
        let total = ctx.total_token_usage().unwrap();
        assert_eq!(total.total_tokens, 5);
    }
}
