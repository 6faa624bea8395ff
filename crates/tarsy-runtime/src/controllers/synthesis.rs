//! Synthesis controller: consolidates a just-finished parallel stage's
//! child results into one `final_analysis` (spec §4.4). Single-turn, not
//! iterative.

use async_trait::async_trait;

use tarsy_core::model::{AgentExecutionResult, AgentExecutionStatus, InteractionDetail};
use tarsy_core::pipeline::HookKind;

use crate::controllers::react::terminal;
use crate::controllers::{ControllerDeps, IterationController, StageContext};
use crate::llm::LlmMessage;

pub struct SynthesisController;

#[async_trait]
impl IterationController for SynthesisController {
    async fn run(&self, ctx: &StageContext<'_>, deps: &ControllerDeps) -> AgentExecutionResult {
        let children = ctx.synthesis_children.unwrap_or(&[]);
        let surfaced: Vec<&AgentExecutionResult> = children.iter().filter(|c| c.is_surfaced()).collect();

        if surfaced.is_empty() {
            return terminal(
                AgentExecutionStatus::Failed,
                ctx,
                deps,
                None,
                Some("no completed child results to synthesize".to_string()),
                None,
            );
        }

        let mut findings = String::new();
        for child in &surfaced {
            if let Some(analysis) = &child.final_analysis {
                findings.push_str(&format!("## {}\n{analysis}\n\n", child.agent_name));
            }
        }

        let conversation = vec![
            LlmMessage::system(
                "Consolidate the following independent findings into one coherent analysis, noting agreement and disagreement.",
            ),
            LlmMessage::user(findings),
        ];

        let result = deps
            .pipeline
            .run(
                HookKind::Llm,
                ctx.session_id.clone(),
                Some(ctx.stage_execution_id.clone()),
                |resp: &crate::llm::LlmResponse| InteractionDetail::Llm {
                    provider: deps.llm_provider_name.clone(),
                    model: deps.llm_model_name.clone(),
                    token_usage: resp.usage.clone(),
                },
                |_err: &crate::error::LlmError| InteractionDetail::Llm {
                    provider: deps.llm_provider_name.clone(),
                    model: deps.llm_model_name.clone(),
                    token_usage: None,
                },
                || deps.llm.chat(&conversation, None),
            )
            .await;

        match result {
            Ok(response) => terminal(
                AgentExecutionStatus::Completed,
                ctx,
                deps,
                response.text,
                None,
                response.usage,
            ),
            Err(e) => terminal(
                AgentExecutionStatus::Failed,
                ctx,
                deps,
                None,
                Some(e.to_string()),
                None,
            ),
        }
    }
}
