//! History Service: persistence + queries over sessions/stages/interactions
//! (spec §4.9).

mod sqlite;

pub use sqlite::SqliteHistoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::model::{
    AlertSession, Interaction, SessionId, SessionStatus, StageExecution, StageExecutionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Status,
    AlertType,
    AgentType,
    Author,
    StartedAt,
    DurationMs,
}

impl SortField {
    /// Unknown sort fields fall back to the default silently (spec §4.9).
    pub fn parse_or_default(raw: &str) -> Self {
        match raw {
            "status" => SortField::Status,
            "alert_type" => SortField::AlertType,
            "agent_type" => SortField::AgentType,
            "author" => SortField::Author,
            "started_at_us" | "started_at" => SortField::StartedAt,
            "duration_ms" => SortField::DurationMs,
            _ => SortField::default(),
        }
    }
}

impl Default for SortField {
    fn default() -> Self {
        SortField::StartedAt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl Default for SortOrder {
    /// Default sort is `started_at_us` descending.
    fn default() -> Self {
        SortOrder::Desc
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub agent_type: Option<String>,
    pub alert_type: Option<String>,
    pub author: Option<String>,
    pub free_text: Option<String>,
    pub started_after_us: Option<i64>,
    pub started_before_us: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub const MAX_PAGE_SIZE: u32 = 200;

    /// Spec §8 boundary: `page_size` > max or invalid values are rejected
    /// before any DB read.
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size == 0 || self.page_size > Self::MAX_PAGE_SIZE {
            return Err(format!(
                "page_size must be in 1..={}",
                Self::MAX_PAGE_SIZE
            ));
        }
        Ok(())
    }

    pub fn offset(&self) -> u32 {
        self.page.saturating_sub(1) * self.page_size
    }
}

#[derive(Debug, Clone)]
pub struct SessionListPage {
    pub sessions: Vec<AlertSession>,
    pub total_count: u64,
}

#[derive(Debug, Clone)]
pub struct TokenAggregate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Per-stage and per-session token totals for a detailed session view.
#[derive(Debug, Clone, Default)]
pub struct SessionTokenSummary {
    /// Keyed by `stage_name`; `None` if the stage has no token-bearing
    /// interactions at all (surfaces as `null`, not zero).
    pub per_stage: Vec<(String, Option<TokenAggregate>)>,
    pub session_total: Option<TokenAggregate>,
}

#[derive(Debug, Clone)]
pub struct SessionDetail {
    pub session: AlertSession,
    pub stages: Vec<StageExecution>,
    /// LLM and tool interactions interleaved by timestamp.
    pub timeline: Vec<Interaction>,
    pub token_summary: SessionTokenSummary,
}

/// Persistence + query capability for sessions, stages and interactions.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create_session(&self, session: &AlertSession) -> CoreResult<()>;
    async fn update_session(&self, session: &AlertSession) -> CoreResult<()>;
    async fn get_session(&self, session_id: &SessionId) -> CoreResult<Option<AlertSession>>;

    async fn create_stage(&self, stage: &StageExecution) -> CoreResult<()>;
    async fn update_stage(&self, stage: &StageExecution) -> CoreResult<()>;
    async fn get_stages(&self, session_id: &SessionId) -> CoreResult<Vec<StageExecution>>;

    async fn record_interaction(&self, interaction: &Interaction) -> CoreResult<()>;

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        sort_field: SortField,
        sort_order: SortOrder,
        pagination: &Pagination,
    ) -> CoreResult<SessionListPage>;

    async fn session_detail(&self, session_id: &SessionId) -> CoreResult<Option<SessionDetail>>;

    /// Deletes sessions whose `started_at_us` is older than `cutoff_us`.
    /// CASCADEs to stages/interactions/events/chats via FK constraints.
    /// Returns the number of sessions deleted.
    async fn delete_sessions_older_than(&self, cutoff_us: i64) -> CoreResult<u64>;

    /// Finds non-terminal sessions whose last activity predates `cutoff_us`
    /// and marks them FAILED with [`crate::state_machine::ORPHANED_ERROR_MESSAGE`].
    /// Returns the affected session ids.
    async fn mark_orphaned_sessions(&self, cutoff_us: i64) -> CoreResult<Vec<SessionId>>;
}

pub(crate) fn aggregate_tokens(usages: impl Iterator<Item = crate::model::TokenUsage>) -> Option<TokenAggregate> {
    let mut total = crate::model::TokenUsage::default();
    let mut any = false;
    for usage in usages {
        if !usage.is_zero() {
            total.add(&usage);
            any = true;
        }
    }
    any.then_some(TokenAggregate {
        input_tokens: total.input_tokens,
        output_tokens: total.output_tokens,
        total_tokens: total.total_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sort_field_falls_back_to_default() {
        assert_eq!(SortField::parse_or_default("bogus"), SortField::StartedAt);
        assert_eq!(SortField::parse_or_default("duration_ms"), SortField::DurationMs);
    }

    #[test]
    fn oversized_page_size_is_rejected() {
        let p = Pagination { page: 1, page_size: 10_000 };
        assert!(p.validate().is_err());
    }

    #[test]
    fn aggregate_tokens_skips_zero_entries_and_returns_none_when_all_zero() {
        let usages = vec![crate::model::TokenUsage::default(), crate::model::TokenUsage::default()];
        assert!(aggregate_tokens(usages.into_iter()).is_none());
    }
}
