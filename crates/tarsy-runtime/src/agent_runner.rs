//! AgentRunner: resolves an agent's tools, selects its iteration
//! controller, and drives one terminal run (spec §4.2).

use std::collections::HashMap;
use std::sync::Arc;

use tarsy_core::model::{AgentExecutionResult, AgentExecutionStatus, ChainContext, IterationStrategy, SessionId, StageExecutionId};
use tarsy_core::state_machine::{CancellationToken, PauseToken};

use crate::agent_profile::{resolve_strategy, AgentProfile};
use crate::controllers::chat::ChatController;
use crate::controllers::native_thinking::NativeThinkingController;
use crate::controllers::react::ReactController;
use crate::controllers::react_stage::ReactStageController;
use crate::controllers::synthesis::SynthesisController;
use crate::controllers::{ControllerDeps, IterationController, StageContext};
use crate::error::ToolClientError;
use crate::llm::Tool;
use crate::tool::ToolClient;

fn controller_for(strategy: IterationStrategy) -> Box<dyn IterationController> {
    match strategy {
        IterationStrategy::React => Box::new(ReactController),
        IterationStrategy::ReactStage => Box::new(ReactStageController),
        IterationStrategy::NativeThinking => Box::new(NativeThinkingController),
        IterationStrategy::Synthesis => Box::new(SynthesisController),
        IterationStrategy::Chat => Box::new(ChatController),
    }
}

/// One agent execution: resolve tools, pick a controller, run it, always
/// return a terminal result (spec §7: "an agent run always returns a
/// terminal `AgentExecutionResult`; it never raises").
pub struct AgentRunner {
    pub tools: Arc<dyn ToolClient>,
}

#[allow(clippy::too_many_arguments)]
impl AgentRunner {
    pub fn new(tools: Arc<dyn ToolClient>) -> Self {
        Self { tools }
    }

    pub async fn run(
        &self,
        agent: &AgentProfile,
        chain: &ChainContext,
        session_id: SessionId,
        stage_execution_id: StageExecutionId,
        override_strategy: Option<IterationStrategy>,
        stage_default_strategy: Option<IterationStrategy>,
        max_iterations_override: Option<u32>,
        runbook_content: Option<&str>,
        cancel: CancellationToken,
        pause: Option<PauseToken>,
        deps: &ControllerDeps,
    ) -> AgentExecutionResult {
        let catalog = match self.build_catalog(agent, &session_id).await {
            Ok(c) => c,
            Err(e) => {
                return AgentExecutionResult {
                    status: AgentExecutionStatus::Failed,
                    agent_name: agent.name.clone(),
                    timestamp_us: deps.clock.now_us(),
                    result_summary: String::new(),
                    final_analysis: None,
                    error_message: Some(format!("failed to list tools: {e}")),
                    token_usage: None,
                };
            }
        };

        let strategy = resolve_strategy(override_strategy, stage_default_strategy, agent.default_strategy);
        let controller = controller_for(strategy);
        let max_iterations = max_iterations_override.unwrap_or(agent.max_iterations);

        let ctx = StageContext {
            chain,
            agent,
            catalog: &catalog,
            runbook_content,
            session_id,
            stage_execution_id,
            cancel,
            pause,
            max_iterations,
            synthesis_children: None,
            chat_turn: None,
        };

        controller.run(&ctx, deps).await
    }

    async fn build_catalog(
        &self,
        agent: &AgentProfile,
        session_id: &SessionId,
    ) -> Result<HashMap<String, Vec<Tool>>, ToolClientError> {
        let mut catalog = HashMap::new();
        for server in agent.mcp_servers() {
            let listed = self.tools.list_tools(session_id, Some(server)).await?;
            catalog.extend(listed);
        }
        Ok(catalog)
    }
}
