//! ReAct controller: text-mediated tool use (spec §4.4).

use async_trait::async_trait;

use tarsy_core::model::{AgentExecutionResult, AgentExecutionStatus, InteractionDetail, TokenUsage};
use tarsy_core::pipeline::HookKind;

use crate::controllers::react_parser::{parse, ParsedTurn};
use crate::controllers::support::{
    accumulate, correction_observation, find_tool, parse_tool_arguments, render_observation,
    tool_not_found_observation,
};
use crate::controllers::{ControllerDeps, IterationController, StageContext};
use crate::prompt;

pub const REACT_INSTRUCTIONS: &str = "Use the ReAct pattern: think step by step, call tools with \
    `Action: server.tool` followed by an `Action Input:` block, and finish with `Final Answer: <analysis>` \
    once you have enough information.";

pub struct ReactController;

#[async_trait]
impl IterationController for ReactController {
    async fn run(&self, ctx: &StageContext<'_>, deps: &ControllerDeps) -> AgentExecutionResult {
        run_react_loop(ctx, deps, REACT_INSTRUCTIONS).await
    }
}

/// The shared ReAct loop: both the plain ReAct controller and the
/// ReAct-Stage controller (spec §4.4) run this, differing only in the
/// strategy instructions baked into the system prompt and in the
/// `max_iterations` the caller configures on `ctx`.
pub(crate) async fn run_react_loop(
    ctx: &StageContext<'_>,
    deps: &ControllerDeps,
    strategy_instructions: &str,
) -> AgentExecutionResult {
    let previous = ctx.chain.previous_stages_results();
    let user_prompt = format!(
        "Investigate alert `{}` using the tools available to you.",
        ctx.chain.alert_type
    );
    let mut conversation = prompt::build_initial_turn(
        &ctx.agent.instructions,
        strategy_instructions,
        &user_prompt,
        ctx.catalog,
        ctx.runbook_content,
        &previous,
    );

    let mut total_tokens: Option<TokenUsage> = None;
    let mut any_tool_success = false;
    let mut last_assistant_text = String::new();

    for _iteration in 0..ctx.max_iterations.max(1) {
        if ctx.cancel.is_canceling() {
            return terminal(
                AgentExecutionStatus::Cancelled,
                ctx,
                deps,
                None,
                Some("cancelled by user".to_string()),
                total_tokens,
            );
        }
        if ctx.pause.as_ref().is_some_and(|p| p.is_pause_requested()) {
            return terminal(AgentExecutionStatus::Paused, ctx, deps, None, None, total_tokens);
        }

        let llm_result = deps
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

        let response = match llm_result {
            Ok(r) => r,
            Err(_) => continue,
        };
        accumulate(&mut total_tokens, &response.usage);
        let text = response.text.unwrap_or_default();
        last_assistant_text = text.clone();

        match parse(&text) {
            ParsedTurn::FinalAnswer { analysis } => {
                return terminal(
                    AgentExecutionStatus::Completed,
                    ctx,
                    deps,
                    Some(analysis),
                    None,
                    total_tokens,
                );
            }
            ParsedTurn::ToolCall { server, tool, input_block } => {
                let observation = match find_tool(ctx.catalog, &server, &tool) {
                    None => {
                        record_unknown_tool(deps, ctx, &server, &tool).await;
                        tool_not_found_observation(&server, &tool)
                    }
                    Some(_) => match parse_tool_arguments(&input_block) {
                        Err(reason) => correction_observation(&reason),
                        Ok(arguments) => {
                            if ctx.cancel.is_canceling() {
                                return terminal(
                                    AgentExecutionStatus::Cancelled,
                                    ctx,
                                    deps,
                                    None,
                                    Some("cancelled by user".to_string()),
                                    total_tokens,
                                );
                            }
                            let result = deps
                                .pipeline
                                .run(
                                    HookKind::ToolCall,
                                    ctx.session_id.clone(),
                                    Some(ctx.stage_execution_id.clone()),
                                    |r: &crate::tool::ToolResult| InteractionDetail::Tool {
                                        server: server.clone(),
                                        tool: tool.clone(),
                                        arguments: arguments.clone(),
                                        result: Some(r.content.clone()),
                                    },
                                    |_: &std::convert::Infallible| unreachable!(),
                                    || async {
                                        Ok::<_, std::convert::Infallible>(
                                            deps.tools
                                                .call_tool(&server, &tool, arguments.clone(), &ctx.session_id)
                                                .await,
                                        )
                                    },
                                )
                                .await
                                .expect("call_tool never returns Err");
                            if result.success {
                                any_tool_success = true;
                            }
                            render_observation(&server, &tool, &result)
                        }
                    },
                };
                conversation = prompt::append_continuation(&conversation, &text, &[observation]);
            }
            ParsedTurn::Malformed => {
                let observation = correction_observation("no recognizable Action or Final Answer");
                conversation = prompt::append_continuation(&conversation, &text, &[observation]);
            }
        }
    }

    if any_tool_success {
        terminal(
            AgentExecutionStatus::Partial,
            ctx,
            deps,
            Some(last_assistant_text),
            None,
            total_tokens,
        )
    } else {
        terminal(
            AgentExecutionStatus::Failed,
            ctx,
            deps,
            None,
            Some("reached maximum iterations".to_string()),
            total_tokens,
        )
    }
}

async fn record_unknown_tool(deps: &ControllerDeps, ctx: &StageContext<'_>, server: &str, tool: &str) {
    let _: Result<(), String> = deps
        .pipeline
        .run(
            HookKind::ToolCall,
            ctx.session_id.clone(),
            Some(ctx.stage_execution_id.clone()),
            |_: &()| unreachable!(),
            |_: &String| InteractionDetail::Tool {
                server: server.to_string(),
                tool: tool.to_string(),
                arguments: serde_json::Value::Null,
                result: None,
            },
            || async { Err(format!("tool not found: {server}.{tool}")) },
        )
        .await;
}

pub(crate) fn terminal(
    status: AgentExecutionStatus,
    ctx: &StageContext<'_>,
    deps: &ControllerDeps,
    final_analysis: Option<String>,
    error_message: Option<String>,
    token_usage: Option<TokenUsage>,
) -> AgentExecutionResult {
    AgentExecutionResult {
        status,
        agent_name: ctx.agent.name.clone(),
        timestamp_us: deps.clock.now_us(),
        result_summary: final_analysis.clone().unwrap_or_default(),
        final_analysis,
        error_message,
        token_usage,
    }
}
