//! Chat controller: post-completion follow-up mode (spec §4.4). Builds its
//! initial conversation from the captured investigation context plus the
//! new user question, then iterates like ReAct until a Final Answer.
//! Cancellation is keyed by the chat execution's `stage_execution_id`
//! rather than a session id (spec §4.9) -- transparent to this controller,
//! which only ever sees the resulting `CancellationToken`.

use async_trait::async_trait;

use tarsy_core::model::{AgentExecutionResult, AgentExecutionStatus, InteractionDetail, TokenUsage};
use tarsy_core::pipeline::HookKind;

use crate::controllers::react::terminal;
use crate::controllers::react_parser::{parse, ParsedTurn};
use crate::controllers::support::{
    accumulate, correction_observation, find_tool, parse_tool_arguments, render_observation,
    tool_not_found_observation,
};
use crate::controllers::{ControllerDeps, IterationController, StageContext};
use crate::prompt;

pub struct ChatController;

#[async_trait]
impl IterationController for ChatController {
    async fn run(&self, ctx: &StageContext<'_>, deps: &ControllerDeps) -> AgentExecutionResult {
        let Some((investigation_context, user_question)) = ctx.chat_turn else {
            return terminal(
                AgentExecutionStatus::Failed,
                ctx,
                deps,
                None,
                Some("chat controller invoked without a chat turn".to_string()),
                None,
            );
        };

        let mut conversation = prompt::build_chat_turn(investigation_context, user_question);
        let mut total_tokens: Option<TokenUsage> = None;
        let mut any_tool_success = false;
        let mut last_text = String::new();

        for _iteration in 0..ctx.max_iterations.max(1) {
            if ctx.cancel.is_canceling() {
                return terminal(AgentExecutionStatus::Cancelled, ctx, deps, None, Some("cancelled by user".into()), total_tokens);
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
            last_text = text.clone();

            match parse(&text) {
                ParsedTurn::FinalAnswer { analysis } => {
                    return terminal(AgentExecutionStatus::Completed, ctx, deps, Some(analysis), None, total_tokens);
                }
                ParsedTurn::ToolCall { server, tool, input_block } => {
                    let observation = match find_tool(ctx.catalog, &server, &tool) {
                        None => tool_not_found_observation(&server, &tool),
                        Some(_) => match parse_tool_arguments(&input_block) {
                            Err(reason) => correction_observation(&reason),
                            Ok(arguments) => {
                                if ctx.cancel.is_canceling() {
                                    return terminal(
                                        AgentExecutionStatus::Cancelled,
                                        ctx,
                                        deps,
                                        None,
                                        Some("cancelled by user".into()),
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
            terminal(AgentExecutionStatus::Partial, ctx, deps, Some(last_text), None, total_tokens)
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
}
