//! Prompt Builder (spec §4.3). Stateless: every function takes its inputs
//! by reference and returns a freshly-built conversation; nothing here
//! mutates its arguments or reads the clock.

use std::collections::HashMap;

use tarsy_core::model::StageOutput;

use crate::llm::{LlmMessage, Tool};

/// Renders a tool catalog (grouped by server) into the text block the ReAct
/// controller's system message embeds, and that its parser's `server.tool`
/// addressing depends on.
pub fn render_tool_catalog(catalog: &HashMap<String, Vec<Tool>>) -> String {
    let mut servers: Vec<&String> = catalog.keys().collect();
    servers.sort();

    let mut out = String::new();
    for server in servers {
        let tools = &catalog[server];
        for tool in tools {
            out.push_str(&format!(
                "- {}: {}\n",
                tool.qualified_name(server),
                tool.function.description
            ));
        }
    }
    out
}

/// Renders the completed prior stages visible to this one, one block per
/// stage, in execution order (spec §4.3: "formatted one per completed prior
/// stage").
pub fn render_previous_stage_summaries(previous: &[(&str, &StageOutput)]) -> String {
    let mut out = String::new();
    for (name, output) in previous {
        if let Some(analysis) = output.representative_analysis() {
            out.push_str(&format!("## Stage: {name}\n{analysis}\n\n"));
        }
    }
    out
}

/// Builds the system message for an initial turn: agent instructions ⊕
/// strategy instructions ⊕ tool catalog ⊕ runbook (if any) ⊕ previous-stage
/// summaries.
pub fn build_initial_system_message(
    agent_instructions: &str,
    strategy_instructions: &str,
    catalog: &HashMap<String, Vec<Tool>>,
    runbook_content: Option<&str>,
    previous_stages: &[(&str, &StageOutput)],
) -> String {
    let mut sections = vec![agent_instructions.to_string(), strategy_instructions.to_string()];

    let tools_block = render_tool_catalog(catalog);
    if !tools_block.is_empty() {
        sections.push(format!("Available tools:\n{tools_block}"));
    }

    if let Some(runbook) = runbook_content {
        sections.push(format!("Runbook:\n{runbook}"));
    }

    let prior_block = render_previous_stage_summaries(previous_stages);
    if !prior_block.is_empty() {
        sections.push(format!("Findings from previous stages:\n{prior_block}"));
    }

    sections.join("\n\n")
}

/// Builds the initial conversation for an agent turn.
pub fn build_initial_turn(
    agent_instructions: &str,
    strategy_instructions: &str,
    user_prompt: &str,
    catalog: &HashMap<String, Vec<Tool>>,
    runbook_content: Option<&str>,
    previous_stages: &[(&str, &StageOutput)],
) -> Vec<LlmMessage> {
    let system = build_initial_system_message(
        agent_instructions,
        strategy_instructions,
        catalog,
        runbook_content,
        previous_stages,
    );
    vec![LlmMessage::system(system), LlmMessage::user(user_prompt)]
}

/// Returns a new conversation with the assistant's prior output and the
/// rendered tool observation(s) appended (spec §4.3 continuation turns).
pub fn append_continuation(
    conversation: &[LlmMessage],
    assistant_output: &str,
    observations: &[String],
) -> Vec<LlmMessage> {
    let mut next = conversation.to_vec();
    next.push(LlmMessage::assistant(assistant_output));
    for observation in observations {
        next.push(LlmMessage::user(observation));
    }
    next
}

/// Builds the initial conversation for a post-completion chat turn: system
/// message declares follow-up mode, user message bundles the captured
/// investigation context and the new question.
pub fn build_chat_turn(investigation_context: &str, user_question: &str) -> Vec<LlmMessage> {
    let system = "You are continuing a completed investigation in follow-up chat mode. \
        Answer the user's question using the investigation context below; if the \
        context is insufficient, say so rather than speculating."
        .to_string();
    let user = format!("Investigation context:\n{investigation_context}\n\nQuestion: {user_question}");
    vec![LlmMessage::system(system), LlmMessage::user(user)]
}

/// Builds the single-turn summarization conversation, bounded by
/// `max_summary_tokens`.
pub fn build_summarization_turn(final_analysis: &str) -> Vec<LlmMessage> {
    let system = "Summarize the following analysis into a short, actionable summary.".to_string();
    vec![LlmMessage::system(system), LlmMessage::user(final_analysis)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_turn_does_not_mutate_inputs() {
        let catalog = HashMap::new();
        let previous = Vec::new();
        let before = "agent instructions".to_string();
        let conversation = build_initial_turn(&before, "react", "go", &catalog, None, &previous);
        assert_eq!(before, "agent instructions");
        assert_eq!(conversation.len(), 2);
    }

    #[test]
    fn continuation_appends_without_mutating_original() {
        let original = vec![LlmMessage::system("sys"), LlmMessage::user("go")];
        let next = append_continuation(&original, "Final Answer: done", &["obs".to_string()]);
        assert_eq!(original.len(), 2);
        assert_eq!(next.len(), 4);
    }

    #[test]
    fn previous_stage_summaries_skip_unsurfaced_stages() {
        let result = tarsy_core::model::AgentExecutionResult {
            status: tarsy_core::model::AgentExecutionStatus::Completed,
            agent_name: "KubernetesAgent".into(),
            timestamp_us: 0,
            result_summary: "ok".into(),
            final_analysis: Some("pods stuck with finalizers".into()),
            error_message: None,
            token_usage: None,
        };
        let output = StageOutput::Single(result);
        let previous = vec![("analysis", &output)];
        let rendered = render_previous_stage_summaries(&previous);
        assert!(rendered.contains("pods stuck with finalizers"));
    }
}
