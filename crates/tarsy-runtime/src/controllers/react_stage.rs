//! ReAct-Stage controller: ReAct, but the prompt instructs the model to
//! conclude the current stage and hand off a summary downstream (spec §4.4).
//! The iteration cap is set by the caller via `StageContext::max_iterations`
//! (typically smaller than plain ReAct's).

use async_trait::async_trait;

use tarsy_core::model::AgentExecutionResult;

use crate::controllers::react::run_react_loop;
use crate::controllers::{ControllerDeps, IterationController, StageContext};

pub const REACT_STAGE_INSTRUCTIONS: &str = "Use the ReAct pattern as above, but you must conclude this \
    stage: once you have enough information, respond with `Final Answer:` followed by a handoff summary \
    that a downstream stage can act on without re-reading the raw tool output.";

pub struct ReactStageController;

#[async_trait]
impl IterationController for ReactStageController {
    async fn run(&self, ctx: &StageContext<'_>, deps: &ControllerDeps) -> AgentExecutionResult {
        run_react_loop(ctx, deps, REACT_STAGE_INSTRUCTIONS).await
    }
}
