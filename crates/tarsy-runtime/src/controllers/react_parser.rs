//! The ReAct controller's 3-tier response parser (spec §4.4).
//!
//! Precedence, strictly in this order:
//! 1. Final Answer anywhere in the text terminates the loop; any Action is
//!    ignored once a Final Answer is found.
//! 2. A line-start `Action: server.tool` followed later by an `Action Input:`
//!    block is a valid tool call.
//! 3. A mid-line `Action:` is valid only when it directly follows a sentence
//!    boundary (`.`, `!`, `?`, optionally followed by space/backtick/
//!    asterisk); otherwise it is prose, not a command. Matching is
//!    case-sensitive -- lowercase `action:` never triggers a tool call.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTurn {
    FinalAnswer { analysis: String },
    ToolCall { server: String, tool: String, input_block: String },
    Malformed,
}

impl ParsedTurn {
    pub fn is_final_answer(&self) -> bool {
        matches!(self, ParsedTurn::FinalAnswer { .. })
    }

    pub fn has_action(&self) -> bool {
        matches!(self, ParsedTurn::ToolCall { .. })
    }
}

fn final_answer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Final Answer:").unwrap())
}

fn tier1_action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*Action:[ \t]*([A-Za-z0-9_\-]+)\.([A-Za-z0-9_\-]+)[ \t]*$").unwrap())
}

fn tier3_action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[.!?][ `*]*Action:[ \t]*([A-Za-z0-9_\-]+)\.([A-Za-z0-9_\-]+)").unwrap()
    })
}

fn action_input_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)Action Input:[ \t]*\n?(.*)").unwrap())
}

/// Parses one LLM turn per the precedence above.
pub fn parse(text: &str) -> ParsedTurn {
    if let Some(m) = final_answer_re().find(text) {
        let analysis = text[m.end()..].trim().to_string();
        return ParsedTurn::FinalAnswer { analysis };
    }

    if let Some(caps) = tier1_action_re().captures(text) {
        return build_tool_call(text, caps, tier1_action_re().find(text).unwrap().end());
    }

    if let Some(caps) = tier3_action_re().captures(text) {
        let end = tier3_action_re().find(text).unwrap().end();
        return build_tool_call(text, caps, end);
    }

    ParsedTurn::Malformed
}

fn build_tool_call(text: &str, caps: regex::Captures, action_line_end: usize) -> ParsedTurn {
    let server = caps[1].to_string();
    let tool = caps[2].to_string();

    let remainder = &text[action_line_end..];
    match action_input_re().captures(remainder) {
        Some(input_caps) => {
            let input_block = input_caps[1].trim().to_string();
            if input_block.is_empty() {
                ParsedTurn::Malformed
            } else {
                ParsedTurn::ToolCall { server, tool, input_block }
            }
        }
        None => ParsedTurn::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_answer_terminates_and_has_no_action() {
        let parsed = parse("Final Answer: pods stuck with finalizers; remove finalizers.");
        assert!(parsed.is_final_answer());
        assert!(!parsed.has_action());
        match parsed {
            ParsedTurn::FinalAnswer { analysis } => {
                assert_eq!(analysis, "pods stuck with finalizers; remove finalizers.");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn final_answer_takes_priority_over_a_later_action() {
        let parsed = parse("Final Answer: done.\nAction: kubernetes-server.get_pods\nAction Input:\nnamespace: x");
        assert!(parsed.is_final_answer());
    }

    #[test]
    fn tier1_line_start_action_is_parsed() {
        let parsed = parse("Action: kubernetes-server.get_pods\nAction Input:\nnamespace: stuck-ns");
        match parsed {
            ParsedTurn::ToolCall { server, tool, input_block } => {
                assert_eq!(server, "kubernetes-server");
                assert_eq!(tool, "get_pods");
                assert_eq!(input_block, "namespace: stuck-ns");
            }
            _ => panic!("expected a tool call, got {parsed:?}"),
        }
    }

    #[test]
    fn tier3_mid_line_action_after_sentence_boundary_is_parsed() {
        let parsed = parse("I will investigate further. Action: kubernetes-server.get_pods\nAction Input:\nnamespace: x");
        assert!(parsed.has_action());
    }

    #[test]
    fn narrative_action_without_sentence_boundary_is_prose() {
        let parsed = parse("My next Action: kubernetes-server.get_pods is planned, not yet run.");
        assert!(matches!(parsed, ParsedTurn::Malformed));
    }

    #[test]
    fn lowercase_action_is_never_a_command() {
        let parsed = parse("action: kubernetes-server.get_pods\naction input:\nnamespace: x");
        assert!(matches!(parsed, ParsedTurn::Malformed));
    }

    #[test]
    fn tier3_markdown_bold_action_is_parsed() {
        let parsed = parse("checked namespace.**Action: kubectl.check\nAction Input:\nnamespace: x");
        match parsed {
            ParsedTurn::ToolCall { server, tool, input_block } => {
                assert_eq!(server, "kubectl");
                assert_eq!(tool, "check");
                assert_eq!(input_block, "namespace: x");
            }
            _ => panic!("expected a tool call, got {parsed:?}"),
        }
    }

    #[test]
    fn action_without_input_block_is_malformed() {
        let parsed = parse("Action: kubernetes-server.get_pods\nI forgot the input.");
        assert!(matches!(parsed, ParsedTurn::Malformed));
    }
}
