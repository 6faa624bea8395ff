//! Iteration Controllers: the algorithms that drive one agent through turns
//! of LLM <-> tools until a terminal state (spec §4.4).
//!
//! Controllers are pure behaviors keyed by [`tarsy_core::model::IterationStrategy`],
//! never subclasses of an agent type (spec §9 design notes): a controller
//! takes a [`StageContext`] plus [`ControllerDeps`] and returns a terminal
//! `AgentExecutionResult`. It never raises -- every error path in this
//! module folds into one of the status variants.

pub mod chat;
pub mod native_thinking;
pub mod react;
pub mod react_stage;
mod react_parser;
pub mod synthesis;
mod support;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use tarsy_core::clock::Clock;
use tarsy_core::model::{AgentExecutionResult, ChainContext, SessionId, StageExecutionId};
use tarsy_core::pipeline::InteractionPipeline;
use tarsy_core::state_machine::{CancellationToken, PauseToken};

use crate::agent_profile::AgentProfile;
use crate::llm::{LlmClient, Tool};
use crate::tool::ToolClient;

/// Shared capabilities a controller needs, injected rather than reached for
/// as globals (spec §9: explicit dependency injection).
pub struct ControllerDeps {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolClient>,
    pub pipeline: Arc<InteractionPipeline>,
    pub clock: Arc<dyn Clock>,
    /// Recorded on every `InteractionDetail::Llm`; identifies which backend
    /// served the call without the controller needing to downcast `llm`.
    pub llm_provider_name: String,
    pub llm_model_name: String,
}

/// A derived, read-only view over `ChainContext` plus the catalog and agent
/// profile for one stage run. Controllers never mutate `chain`.
pub struct StageContext<'a> {
    pub chain: &'a ChainContext,
    pub agent: &'a AgentProfile,
    pub catalog: &'a HashMap<String, Vec<Tool>>,
    pub runbook_content: Option<&'a str>,
    pub session_id: SessionId,
    pub stage_execution_id: StageExecutionId,
    pub cancel: CancellationToken,
    pub pause: Option<PauseToken>,
    pub max_iterations: u32,
    /// Populated only for a Synthesis run: the terminal results of the
    /// sibling agents from the just-finished parallel stage.
    pub synthesis_children: Option<&'a [AgentExecutionResult]>,
    /// Populated only for a Chat run: the captured investigation context
    /// rendered as text, and the new user question.
    pub chat_turn: Option<(&'a str, &'a str)>,
}

#[async_trait]
pub trait IterationController: Send + Sync {
    async fn run(&self, ctx: &StageContext<'_>, deps: &ControllerDeps) -> AgentExecutionResult;
}
