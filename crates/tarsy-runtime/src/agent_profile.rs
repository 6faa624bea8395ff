//! Agent profiles: data, not class hierarchies (spec §9).
//!
//! An agent is `{name, mcp_servers(), max_iterations, default_strategy}`
//! plus free-form instructions text. Controllers are pure behaviors keyed by
//! strategy, never subclasses of an agent type.

use serde::{Deserialize, Serialize};

use tarsy_core::model::IterationStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub instructions: String,
    pub mcp_servers: Vec<String>,
    pub max_iterations: u32,
    pub default_strategy: IterationStrategy,
}

impl AgentProfile {
    pub fn mcp_servers(&self) -> &[String] {
        &self.mcp_servers
    }
}

/// Resolves the effective strategy for one run: override > stage default >
/// agent default (spec §4.2 step 3).
pub fn resolve_strategy(
    override_strategy: Option<IterationStrategy>,
    stage_default: Option<IterationStrategy>,
    agent_default: IterationStrategy,
) -> IterationStrategy {
    override_strategy.or(stage_default).unwrap_or(agent_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_stage_and_agent_defaults() {
        let resolved = resolve_strategy(
            Some(IterationStrategy::NativeThinking),
            Some(IterationStrategy::React),
            IterationStrategy::ReactStage,
        );
        assert_eq!(resolved, IterationStrategy::NativeThinking);
    }

    #[test]
    fn stage_default_wins_over_agent_default() {
        let resolved = resolve_strategy(None, Some(IterationStrategy::React), IterationStrategy::Synthesis);
        assert_eq!(resolved, IterationStrategy::React);
    }

    #[test]
    fn agent_default_used_when_nothing_else_specified() {
        let resolved = resolve_strategy(None, None, IterationStrategy::Chat);
        assert_eq!(resolved, IterationStrategy::Chat);
    }
}
