//! Stage Scheduler: drives a chain definition stage by stage, dispatching
//! each stage's agents (single / multi-agent / replica), aggregating
//! parallel results by success policy, and deciding the session's terminal
//! outcome (spec §4.1, §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use tarsy_core::clock::Clock;
use tarsy_core::events::{channels, EventBus};
use tarsy_core::history::HistoryStore;
use tarsy_core::model::{
    AgentExecutionMetadata, AgentExecutionResult, AgentExecutionStatus, ChainContext,
    ChainDefinition, ParallelAgentConfig, ParallelType, ParallelismKind, ParallelStageMetadata,
    ParallelStageResult, SessionId, StageAggregateStatus, StageDefinition, StageExecution,
    StageExecutionId, StageOutput, StageStatus, SuccessPolicy,
};
use tarsy_core::pipeline::InteractionPipeline;
use tarsy_core::state_machine::{CancellationToken, PauseRegistry};

use crate::agent_profile::AgentProfile;
use crate::agent_runner::AgentRunner;
use crate::controllers::synthesis::SynthesisController;
use crate::controllers::{ControllerDeps, IterationController, StageContext};
use crate::llm::{LlmClient, LlmMessage};
use crate::tool::ToolClient;

/// An LLM backend registered under a provider name, paired with the model
/// name recorded on every interaction served through it.
pub struct LlmProvider {
    pub client: Arc<dyn LlmClient>,
    pub model_name: String,
}

/// Terminal outcome of one chain execution. `SessionStatus` has no PARTIAL
/// variant (spec §4.8): a chain that runs to its last stage without a
/// FAILED/CANCELLED/PAUSED stage is session-COMPLETED even if individual
/// stages along the way were PARTIAL.
pub enum SessionOutcome {
    Completed {
        final_analysis: Option<String>,
        final_analysis_summary: Option<String>,
    },
    Failed {
        error_message: String,
    },
    Cancelled,
    Paused {
        stage_execution_id: StageExecutionId,
    },
}

pub struct Scheduler {
    pub agents: HashMap<String, AgentProfile>,
    pub llm_providers: HashMap<String, LlmProvider>,
    pub default_llm_provider: String,
    pub tools: Arc<dyn ToolClient>,
    pub pipeline: Arc<InteractionPipeline>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventBus>,
    pub history: Arc<dyn HistoryStore>,
    pub pause_registry: Arc<PauseRegistry>,
    /// Bound on the post-chain summary (spec §9 open question: a
    /// COMPLETED/PARTIAL stage with a non-empty final_analysis triggers
    /// summarization; failures of the summarizer never change session status).
    pub max_summary_tokens: u32,
}

impl Scheduler {
    pub async fn execute(
        &self,
        chain_def: &ChainDefinition,
        chain: &mut ChainContext,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let channel = channels::session_channel(&session_id);

        for stage_def in &chain_def.stages {
            chain.current_stage_name = Some(stage_def.name.clone());
            let stage_execution_id = self.clock.new_id();
            let started_at = self.clock.now_us();

            let mut stage_exec = StageExecution {
                execution_id: stage_execution_id.clone(),
                session_id: session_id.clone(),
                stage_id: stage_def.name.clone(),
                stage_index: chain.stage_outputs.len() as u32,
                stage_name: stage_def.name.clone(),
                agent: primary_agent_name(stage_def),
                iteration_strategy: stage_def.iteration_strategy,
                status: StageStatus::Pending,
                started_at_us: None,
                paused_at_us: None,
                completed_at_us: None,
                duration_ms: None,
                stage_output: None,
                error_message: None,
                parent_execution_id: None,
            };
            let _ = self.history.create_stage(&stage_exec).await;
            self.publish(&channel, "stage.created", &stage_exec.stage_name, &stage_execution_id).await;

            if cancel.is_canceling() {
                stage_exec.status = StageStatus::Cancelled;
                let _ = self.history.update_stage(&stage_exec).await;
                return SessionOutcome::Cancelled;
            }

            stage_exec.status = StageStatus::Active;
            stage_exec.started_at_us = Some(started_at);
            let _ = self.history.update_stage(&stage_exec).await;
            self.publish(&channel, "stage.started", &stage_exec.stage_name, &stage_execution_id).await;

            let pause = self.pause_registry.register(&stage_execution_id);
            let output = self
                .run_stage(stage_def, chain, &session_id, &stage_execution_id, cancel.clone(), pause)
                .await;

            let completed_at = self.clock.now_us();
            stage_exec.completed_at_us = Some(completed_at);
            stage_exec.duration_ms = Some((completed_at - started_at) / 1000);

            let aggregate_status = stage_aggregate_status(&output);
            match aggregate_status {
                StageAggregateStatus::Paused => {
                    stage_exec.status = StageStatus::Paused;
                    stage_exec.paused_at_us = Some(completed_at);
                    stage_exec.stage_output = Some(output);
                    let _ = self.history.update_stage(&stage_exec).await;
                    self.publish(&channel, "stage.paused", &stage_exec.stage_name, &stage_execution_id).await;
                    return SessionOutcome::Paused { stage_execution_id };
                }
                StageAggregateStatus::Cancelled => {
                    stage_exec.status = StageStatus::Cancelled;
                    stage_exec.stage_output = Some(output);
                    let _ = self.history.update_stage(&stage_exec).await;
                    self.pause_registry.forget(&stage_execution_id);
                    self.publish(&channel, "stage.cancelled", &stage_exec.stage_name, &stage_execution_id).await;
                    return SessionOutcome::Cancelled;
                }
                StageAggregateStatus::Failed => {
                    stage_exec.status = StageStatus::Failed;
                    stage_exec.error_message = stage_error_message(&output);
                    stage_exec.stage_output = Some(output.clone());
                    let _ = self.history.update_stage(&stage_exec).await;
                    self.pause_registry.forget(&stage_execution_id);
                    self.publish(&channel, "stage.failed", &stage_exec.stage_name, &stage_execution_id).await;
                    // Open question (spec §9): a FAILED stage still appends
                    // its metadata to the chain -- it's just never surfaced
                    // downstream (`is_surfaced()` is false for FAILED). The
                    // chain only aborts here if no prior stage produced
                    // usable output; otherwise it carries on, since
                    // `SessionStatus` has no PARTIAL terminal to land on.
                    let had_prior_output = !chain.previous_stages_results().is_empty();
                    let error_message = stage_exec.error_message.clone().unwrap_or_else(|| "stage failed".to_string());
                    chain.append_stage_output(stage_def.name.clone(), output);
                    if !had_prior_output {
                        return SessionOutcome::Failed { error_message };
                    }
                }
                StageAggregateStatus::Completed | StageAggregateStatus::Partial => {
                    stage_exec.status = StageStatus::Completed;
                    stage_exec.stage_output = Some(output.clone());
                    let _ = self.history.update_stage(&stage_exec).await;
                    self.pause_registry.forget(&stage_execution_id);
                    self.publish(&channel, "stage.completed", &stage_exec.stage_name, &stage_execution_id).await;
                    chain.append_stage_output(stage_def.name.clone(), output);
                }
            }
        }

        let final_analysis = chain
            .stage_outputs
            .last()
            .and_then(|(_, out)| out.representative_analysis())
            .map(str::to_string);

        let final_analysis_summary = match &final_analysis {
            Some(text) if !text.trim().is_empty() => self.summarize(text).await,
            _ => None,
        };

        SessionOutcome::Completed { final_analysis, final_analysis_summary }
    }

    async fn run_stage(
        &self,
        stage_def: &StageDefinition,
        chain: &ChainContext,
        session_id: &SessionId,
        stage_execution_id: &StageExecutionId,
        cancel: CancellationToken,
        pause: tarsy_core::state_machine::PauseToken,
    ) -> StageOutput {
        match &stage_def.parallelism {
            ParallelismKind::Single { agent_name } => {
                let result = self
                    .run_one_agent(
                        agent_name,
                        stage_def,
                        None,
                        chain,
                        session_id,
                        stage_execution_id,
                        cancel,
                        Some(pause),
                    )
                    .await;
                StageOutput::Single(result)
            }
            ParallelismKind::MultiAgent { agents } => {
                let results = self
                    .run_parallel(agents.clone(), stage_def, chain, session_id, stage_execution_id, cancel.clone(), pause)
                    .await;
                StageOutput::Parallel(
                    self.aggregate_parallel(stage_def, stage_execution_id, ParallelType::MultiAgent, results, cancel)
                        .await,
                )
            }
            ParallelismKind::Replica { agent_name, replicas } => {
                let agents: Vec<ParallelAgentConfig> = (0..*replicas)
                    .map(|_| ParallelAgentConfig {
                        agent_name: agent_name.clone(),
                        llm_provider: None,
                        iteration_strategy: None,
                    })
                    .collect();
                let results = self
                    .run_parallel(agents, stage_def, chain, session_id, stage_execution_id, cancel.clone(), pause)
                    .await;
                StageOutput::Parallel(
                    self.aggregate_parallel(stage_def, stage_execution_id, ParallelType::Replica, results, cancel)
                        .await,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        agents: Vec<ParallelAgentConfig>,
        stage_def: &StageDefinition,
        chain: &ChainContext,
        session_id: &SessionId,
        stage_execution_id: &StageExecutionId,
        cancel: CancellationToken,
        pause: tarsy_core::state_machine::PauseToken,
    ) -> Vec<(AgentExecutionResult, String)> {
        let tasks = agents.into_iter().map(|agent_cfg| {
            let cancel = cancel.clone();
            let pause = pause.clone();
            async move {
                let provider = agent_cfg.llm_provider.clone();
                let strategy = agent_cfg.iteration_strategy;
                let result = self
                    .run_one_agent(
                        &agent_cfg.agent_name,
                        stage_def,
                        strategy,
                        chain,
                        session_id,
                        stage_execution_id,
                        cancel,
                        Some(pause),
                    )
                    .await;
                (result, provider.unwrap_or_else(|| self.default_llm_provider.clone()))
            }
        });
        futures::future::join_all(tasks).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_agent(
        &self,
        agent_name: &str,
        stage_def: &StageDefinition,
        agent_strategy_override: Option<tarsy_core::model::IterationStrategy>,
        chain: &ChainContext,
        session_id: &SessionId,
        stage_execution_id: &StageExecutionId,
        cancel: CancellationToken,
        pause: Option<tarsy_core::state_machine::PauseToken>,
    ) -> AgentExecutionResult {
        let Some(agent) = self.agents.get(agent_name) else {
            return AgentExecutionResult {
                status: AgentExecutionStatus::Failed,
                agent_name: agent_name.to_string(),
                timestamp_us: self.clock.now_us(),
                result_summary: String::new(),
                final_analysis: None,
                error_message: Some(format!("unknown agent: {agent_name}")),
                token_usage: None,
            };
        };

        let provider = self.resolve_provider(stage_def.llm_provider.as_deref());
        let deps = ControllerDeps {
            llm: provider.client.clone(),
            tools: self.tools.clone(),
            pipeline: self.pipeline.clone(),
            clock: self.clock.clone(),
            llm_provider_name: self.provider_name_for(stage_def.llm_provider.as_deref()),
            llm_model_name: provider.model_name.clone(),
        };
        let runner = AgentRunner::new(self.tools.clone());
        runner
            .run(
                agent,
                chain,
                session_id.clone(),
                stage_execution_id.clone(),
                agent_strategy_override,
                stage_def.iteration_strategy,
                None,
                chain.runbook_content.as_deref(),
                cancel,
                pause,
                &deps,
            )
            .await
    }

    async fn aggregate_parallel(
        &self,
        stage_def: &StageDefinition,
        stage_execution_id: &StageExecutionId,
        parallel_type: ParallelType,
        results: Vec<(AgentExecutionResult, String)>,
        cancel: CancellationToken,
    ) -> ParallelStageResult {
        let started_at_us = results.iter().map(|(r, _)| r.timestamp_us).min().unwrap_or_else(|| self.clock.now_us());
        let completed_at_us = self.clock.now_us();

        let mut children: Vec<AgentExecutionResult> = Vec::with_capacity(results.len());
        let mut agent_metadatas = Vec::with_capacity(results.len());
        let mut successful_count = 0u32;
        let mut failed_count = 0u32;
        let mut paused_count = 0u32;

        for (result, provider) in results {
            match result.status {
                AgentExecutionStatus::Completed => successful_count += 1,
                AgentExecutionStatus::Failed | AgentExecutionStatus::Cancelled => failed_count += 1,
                AgentExecutionStatus::Paused => paused_count += 1,
                AgentExecutionStatus::Partial => {}
            }
            agent_metadatas.push(AgentExecutionMetadata {
                agent_name: result.agent_name.clone(),
                provider: Some(provider),
                strategy: stage_def.iteration_strategy.unwrap_or(tarsy_core::model::IterationStrategy::React),
                status: result.status,
                started_at_us: result.timestamp_us,
                completed_at_us: Some(result.timestamp_us),
            });
            children.push(result);
        }

        let status = if paused_count > 0 {
            StageAggregateStatus::Paused
        } else {
            match stage_def.success_policy {
                SuccessPolicy::All => {
                    if failed_count > 0 {
                        StageAggregateStatus::Failed
                    } else if successful_count as usize == children.len() {
                        StageAggregateStatus::Completed
                    } else {
                        StageAggregateStatus::Partial
                    }
                }
                SuccessPolicy::Any => {
                    if successful_count > 0 {
                        StageAggregateStatus::Completed
                    } else if children.iter().any(|c| c.status == AgentExecutionStatus::Partial) {
                        StageAggregateStatus::Partial
                    } else {
                        StageAggregateStatus::Failed
                    }
                }
            }
        };

        let mut result = ParallelStageResult {
            stage_name: stage_def.name.clone(),
            children,
            metadata: ParallelStageMetadata {
                parent_stage_execution_id: stage_execution_id.clone(),
                parallel_type,
                success_policy: stage_def.success_policy,
                started_at_us,
                completed_at_us: Some(completed_at_us),
                agent_metadatas,
            },
            status,
            successful_count,
            failed_count,
            paused_count,
        };

        if stage_def.synthesis.is_some()
            && matches!(result.status, StageAggregateStatus::Completed | StageAggregateStatus::Partial)
        {
            if let Some(synth) = self
                .run_synthesis(stage_def, stage_execution_id, &result.children, cancel)
                .await
            {
                result.children.insert(0, synth);
            }
        }

        result
    }

    async fn run_synthesis(
        &self,
        stage_def: &StageDefinition,
        stage_execution_id: &StageExecutionId,
        children: &[AgentExecutionResult],
        cancel: CancellationToken,
    ) -> Option<AgentExecutionResult> {
        // Synthesis is a single-turn LLM call over the completed siblings, not
        // a multi-turn agent; it has no tool catalog of its own.
        let synthesis_cfg = stage_def.synthesis.as_ref()?;
        let provider = self.resolve_provider(synthesis_cfg.llm_provider.as_deref());
        let agent = AgentProfile {
            name: "synthesizer".to_string(),
            instructions: String::new(),
            mcp_servers: Vec::new(),
            max_iterations: 1,
            default_strategy: tarsy_core::model::IterationStrategy::Synthesis,
        };
        let empty_catalog = HashMap::new();
        let dummy_chain = ChainContext {
            alert_type: String::new(),
            alert_data: serde_json::Map::new(),
            session_id: String::new(),
            current_stage_name: None,
            runbook_content: None,
            chain_id: String::new(),
            stage_outputs: Vec::new(),
            chat_context: None,
        };
        let ctx = StageContext {
            chain: &dummy_chain,
            agent: &agent,
            catalog: &empty_catalog,
            runbook_content: None,
            session_id: String::new(),
            stage_execution_id: stage_execution_id.clone(),
            cancel,
            pause: None,
            max_iterations: 1,
            synthesis_children: Some(children),
            chat_turn: None,
        };
        let deps = ControllerDeps {
            llm: provider.client.clone(),
            tools: self.tools.clone(),
            pipeline: self.pipeline.clone(),
            clock: self.clock.clone(),
            llm_provider_name: self.provider_name_for(synthesis_cfg.llm_provider.as_deref()),
            llm_model_name: provider.model_name.clone(),
        };
        let controller = SynthesisController;
        Some(controller.run(&ctx, &deps).await)
    }

    fn resolve_provider(&self, override_name: Option<&str>) -> &LlmProvider {
        let name = override_name.unwrap_or(&self.default_llm_provider);
        self.llm_providers
            .get(name)
            .or_else(|| self.llm_providers.get(&self.default_llm_provider))
            .expect("at least the default llm provider must be registered")
    }

    fn provider_name_for(&self, override_name: Option<&str>) -> String {
        override_name.unwrap_or(&self.default_llm_provider).to_string()
    }

    async fn summarize(&self, final_analysis: &str) -> Option<String> {
        let provider = self.resolve_provider(None);
        let conversation = vec![
            LlmMessage::system(format!(
                "Summarize the following root-cause analysis in at most {} tokens worth of prose.",
                self.max_summary_tokens
            )),
            LlmMessage::user(final_analysis.to_string()),
        ];
        match provider.client.chat(&conversation, None).await {
            Ok(response) => response.text,
            Err(e) => {
                tracing::warn!(error = %e, "summarizer failed, session proceeds without a summary");
                None
            }
        }
    }

    async fn publish(&self, channel: &str, kind: &str, stage_name: &str, stage_execution_id: &str) {
        let mut payload = serde_json::Map::new();
        payload.insert("kind".into(), serde_json::Value::String(kind.to_string()));
        payload.insert("stage_name".into(), serde_json::Value::String(stage_name.to_string()));
        payload.insert(
            "stage_execution_id".into(),
            serde_json::Value::String(stage_execution_id.to_string()),
        );
        let _ = self.events.publish(channel, payload).await;
    }
}

fn primary_agent_name(stage_def: &StageDefinition) -> String {
    match &stage_def.parallelism {
        ParallelismKind::Single { agent_name } => agent_name.clone(),
        ParallelismKind::Replica { agent_name, .. } => agent_name.clone(),
        ParallelismKind::MultiAgent { agents } => agents
            .first()
            .map(|a| a.agent_name.clone())
            .unwrap_or_default(),
    }
}

fn stage_aggregate_status(output: &StageOutput) -> StageAggregateStatus {
    match output {
        StageOutput::Single(r) => match r.status {
            AgentExecutionStatus::Completed => StageAggregateStatus::Completed,
            AgentExecutionStatus::Partial => StageAggregateStatus::Partial,
            AgentExecutionStatus::Failed => StageAggregateStatus::Failed,
            AgentExecutionStatus::Cancelled => StageAggregateStatus::Cancelled,
            AgentExecutionStatus::Paused => StageAggregateStatus::Paused,
        },
        StageOutput::Parallel(p) => p.status,
    }
}

fn stage_error_message(output: &StageOutput) -> Option<String> {
    match output {
        StageOutput::Single(r) => r.error_message.clone(),
        StageOutput::Parallel(p) => p
            .children
            .iter()
            .find(|c| c.status == AgentExecutionStatus::Failed)
            .and_then(|c| c.error_message.clone()),
    }
}
