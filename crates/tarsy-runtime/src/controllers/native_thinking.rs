//! Native-Thinking controller: delegates tool selection to a provider's
//! native tool-calling structure instead of text parsing (spec §4.4).

use async_trait::async_trait;

use tarsy_core::model::{AgentExecutionStatus, InteractionDetail, TokenUsage};
use tarsy_core::pipeline::HookKind;

use crate::controllers::react::terminal;
use crate::controllers::support::accumulate;
use crate::controllers::{ControllerDeps, IterationController, StageContext};
use crate::llm::{FinishReason, LlmMessage, Tool};
use crate::prompt;

pub const NATIVE_THINKING_INSTRUCTIONS: &str =
    "Use the tools available to you as needed, then provide your final analysis.";

pub struct NativeThinkingController;

#[async_trait]
impl IterationController for NativeThinkingController {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        deps: &ControllerDeps,
    ) -> tarsy_core::model::AgentExecutionResult {
        let previous = ctx.chain.previous_stages_results();
        let user_prompt = format!(
            "Investigate alert `{}` using the tools available to you.",
            ctx.chain.alert_type
        );
        let mut conversation = prompt::build_initial_turn(
            &ctx.agent.instructions,
            NATIVE_THINKING_INSTRUCTIONS,
            &user_prompt,
            ctx.catalog,
            ctx.runbook_content,
            &previous,
        );
        let flat_tools: Vec<Tool> = ctx
            .catalog
            .iter()
            .flat_map(|(_server, tools)| tools.iter().cloned())
            .collect();

        let mut total_tokens: Option<TokenUsage> = None;
        let mut any_tool_success = false;
        let mut last_text = String::new();

        for _iteration in 0..ctx.max_iterations.max(1) {
            if ctx.cancel.is_canceling() {
                return terminal(AgentExecutionStatus::Cancelled, ctx, deps, None, Some("cancelled by user".into()), total_tokens);
            }
            if ctx.pause.as_ref().is_some_and(|p| p.is_pause_requested()) {
                return terminal(AgentExecutionStatus::Paused, ctx, deps, None, None, total_tokens);
            }

            let tools_for_call = (!flat_tools.is_empty()).then_some(flat_tools.as_slice());
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
                    || deps.llm.chat(&conversation, tools_for_call),
                )
                .await;

            let response = match llm_result {
                Ok(r) => r,
                Err(_) => continue,
            };
            accumulate(&mut total_tokens, &response.usage);

            match response.tool_calls {
                Some(calls) if !calls.is_empty() => {
                    conversation.push(LlmMessage {
                        role: crate::llm::ChatRole::Assistant,
                        content: response.text.clone().unwrap_or_default(),
                        tool_calls: Some(calls.clone()),
                        tool_call_id: None,
                    });
                    for call in &calls {
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
                        let arguments: serde_json::Value =
                            serde_json::from_str(&call.arguments_json).unwrap_or(serde_json::Value::Null);
                        let result = deps
                            .pipeline
                            .run(
                                HookKind::ToolCall,
                                ctx.session_id.clone(),
                                Some(ctx.stage_execution_id.clone()),
                                |r: &crate::tool::ToolResult| InteractionDetail::Tool {
                                    server: call.server.clone(),
                                    tool: call.tool.clone(),
                                    arguments: arguments.clone(),
                                    result: Some(r.content.clone()),
                                },
                                |_: &std::convert::Infallible| unreachable!(),
                                || async {
                                    Ok::<_, std::convert::Infallible>(
                                        deps.tools
                                            .call_tool(&call.server, &call.tool, arguments.clone(), &ctx.session_id)
                                            .await,
                                    )
                                },
                            )
                            .await
                            .expect("call_tool never returns Err");
                        if result.success {
                            any_tool_success = true;
                        }
                        let observation = if result.success {
                            result.content.to_string()
                        } else {
                            format!("error: {}", result.error.as_deref().unwrap_or("unknown error"))
                        };
                        conversation.push(LlmMessage::tool_result(call.id.clone(), observation));
                    }
                }
                _ => {
                    last_text = response.text.unwrap_or_default();
                    if matches!(response.finish_reason, FinishReason::Stop) {
                        return terminal(
                            AgentExecutionStatus::Completed,
                            ctx,
                            deps,
                            Some(last_text),
                            None,
                            total_tokens,
                        );
                    }
                    conversation.push(LlmMessage::assistant(last_text.clone()));
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
