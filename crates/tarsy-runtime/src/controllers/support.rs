//! Shared helpers for the text-mediated controllers (ReAct, ReAct-Stage,
//! Chat): tool-call input parsing, catalog lookup, observation rendering.

use std::collections::HashMap;

use tarsy_core::model::TokenUsage;

use crate::llm::Tool;
use crate::tool::ToolResult;

/// Parses a ReAct `Action Input:` block as JSON, falling back to YAML --
/// both are accepted per spec §4.4 tier 1.
pub fn parse_tool_arguments(input_block: &str) -> Result<serde_json::Value, String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(input_block) {
        return Ok(value);
    }
    serde_yaml::from_str::<serde_json::Value>(input_block)
        .map_err(|e| format!("could not parse tool input as JSON or YAML: {e}"))
}

pub fn find_tool<'a>(catalog: &'a HashMap<String, Vec<Tool>>, server: &str, tool: &str) -> Option<&'a Tool> {
    catalog.get(server)?.iter().find(|t| t.function.name == tool)
}

pub fn render_observation(server: &str, tool: &str, result: &ToolResult) -> String {
    if result.success {
        format!("Observation ({server}.{tool}): {}", result.content)
    } else {
        format!(
            "Observation ({server}.{tool}): error: {}",
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}

pub fn tool_not_found_observation(server: &str, tool: &str) -> String {
    format!("Observation: Tool not found: {server}.{tool}")
}

pub fn correction_observation(reason: &str) -> String {
    format!(
        "Observation: your previous response was malformed ({reason}). \
         Respond with either a `Final Answer:` or a line-start `Action: server.tool` \
         followed by an `Action Input:` block."
    )
}

pub fn accumulate(total: &mut Option<TokenUsage>, usage: &Option<TokenUsage>) {
    if let Some(u) = usage {
        if !u.is_zero() {
            total.get_or_insert_with(TokenUsage::default).add(u);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_input_block() {
        let parsed = parse_tool_arguments(r#"{"namespace": "stuck-ns"}"#).unwrap();
        assert_eq!(parsed["namespace"], "stuck-ns");
    }

    #[test]
    fn parses_yaml_input_block() {
        let parsed = parse_tool_arguments("namespace: stuck-ns").unwrap();
        assert_eq!(parsed["namespace"], "stuck-ns");
    }
}
