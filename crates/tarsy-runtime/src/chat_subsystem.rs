//! Chat Subsystem: post-completion follow-up conversations attached to a
//! finished session (spec §4.9's chat extension). Chat creation is
//! idempotent per session -- asking twice returns the same `chat_id` --
//! and cancellation is keyed by the chat's own `stage_execution_id` rather
//! than the session id, so a chat in flight can be cancelled without
//! touching the (already terminal) session.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use tarsy_core::clock::Clock;
use tarsy_core::events::{channels, EventBus};
use tarsy_core::history::HistoryStore;
use tarsy_core::model::{
    AgentExecutionResult, Chat, ChatContextSnapshot, ChatId, ChatUserMessage, SessionId,
    StageExecutionId,
};
use tarsy_core::state_machine::CancellationRegistry;

use crate::agent_profile::AgentProfile;
use crate::controllers::chat::ChatController;
use crate::controllers::{ControllerDeps, IterationController, StageContext};

/// Error surfaces for chat operations that genuinely can't be folded into a
/// terminal `AgentExecutionResult` -- the chat (or its parent session)
/// simply doesn't exist yet.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("session {0} has no chat yet")]
    NoChat(SessionId),
    #[error("session {0} is not in a state that allows starting a chat")]
    SessionNotReady(SessionId),
}

/// Tracks the one chat allowed per session (spec: chat creation is
/// idempotent) and dispatches new user messages through the Chat controller.
pub struct ChatSubsystem {
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventBus>,
    history: Arc<dyn HistoryStore>,
    cancellation: Arc<CancellationRegistry>,
    chat_agent: AgentProfile,
    by_session: Mutex<BTreeMap<SessionId, ChatId>>,
}

impl ChatSubsystem {
    pub fn new(
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventBus>,
        history: Arc<dyn HistoryStore>,
        cancellation: Arc<CancellationRegistry>,
        chat_agent: AgentProfile,
    ) -> Self {
        Self {
            clock,
            events,
            history,
            cancellation,
            chat_agent,
            by_session: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the existing chat for `session_id` if one was already
    /// started, otherwise creates one from the given investigation context
    /// snapshot. Calling this twice for the same session is a no-op on the
    /// second call.
    pub async fn get_or_create_chat(
        &self,
        session_id: &SessionId,
        created_by: &str,
        investigation_context: ChatContextSnapshot,
    ) -> Chat {
        if let Some(existing_id) = self.by_session.lock().get(session_id).cloned() {
            return Chat {
                chat_id: existing_id,
                session_id: session_id.clone(),
                created_by: created_by.to_string(),
                created_at_us: self.clock.now_us(),
                investigation_context,
            };
        }

        let chat_id = self.clock.new_id();
        self.by_session.lock().insert(session_id.clone(), chat_id.clone());
        let chat = Chat {
            chat_id,
            session_id: session_id.clone(),
            created_by: created_by.to_string(),
            created_at_us: self.clock.now_us(),
            investigation_context,
        };
        let _ = self
            .events
            .publish(&channels::session_channel(session_id), chat_created_payload(&chat))
            .await;
        chat
    }

    /// Posts a new user message and drives one Chat controller turn to
    /// completion. Each posted message gets its own `stage_execution_id` so
    /// cancellation (and history) can key on it independently of the chat
    /// itself or the (terminal) parent session.
    pub async fn post_message(
        &self,
        chat: &Chat,
        content: String,
        author: &str,
        deps: &ControllerDeps,
    ) -> (ChatUserMessage, AgentExecutionResult) {
        let stage_execution_id: StageExecutionId = self.clock.new_id();
        let message = ChatUserMessage {
            message_id: self.clock.new_id(),
            chat_id: chat.chat_id.clone(),
            stage_execution_id: stage_execution_id.clone(),
            content: content.clone(),
            author: author.to_string(),
            created_at_us: self.clock.now_us(),
        };

        let cancel = self.cancellation.register(&stage_execution_id);
        let rendered_context = render_context(&chat.investigation_context);
        let empty_catalog = std::collections::HashMap::new();
        let dummy_chain = tarsy_core::model::ChainContext {
            alert_type: chat.investigation_context.alert_type.clone(),
            alert_data: serde_json::Map::new(),
            session_id: chat.session_id.clone(),
            current_stage_name: None,
            runbook_content: None,
            chain_id: String::new(),
            stage_outputs: Vec::new(),
            chat_context: Some(chat.investigation_context.clone()),
        };
        let ctx = StageContext {
            chain: &dummy_chain,
            agent: &self.chat_agent,
            catalog: &empty_catalog,
            runbook_content: None,
            session_id: chat.session_id.clone(),
            stage_execution_id: stage_execution_id.clone(),
            cancel,
            pause: None,
            max_iterations: self.chat_agent.max_iterations,
            synthesis_children: None,
            chat_turn: Some((rendered_context.as_str(), content.as_str())),
        };

        let controller = ChatController;
        let result = controller.run(&ctx, deps).await;
        self.cancellation.forget(&stage_execution_id);
        (message, result)
    }

    /// Cancels an in-flight chat turn. A no-op if the turn already finished
    /// or was never registered.
    pub fn cancel(&self, stage_execution_id: &StageExecutionId) -> bool {
        self.cancellation.request_cancel(stage_execution_id)
    }
}

fn render_context(snapshot: &ChatContextSnapshot) -> String {
    let mut out = format!("Alert type: {}\n\nFinal analysis:\n{}\n", snapshot.alert_type, snapshot.final_analysis);
    for (stage, summary) in &snapshot.stage_summaries {
        out.push_str(&format!("\n## Stage: {stage}\n{summary}\n"));
    }
    out
}

fn chat_created_payload(chat: &Chat) -> serde_json::Map<String, serde_json::Value> {
    let mut payload = serde_json::Map::new();
    payload.insert("kind".into(), serde_json::Value::String("chat.created".into()));
    payload.insert("chat_id".into(), serde_json::Value::String(chat.chat_id.clone()));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_core::clock::FrozenClock;
    use tarsy_core::events::{InMemoryEventStore, NotifyEventBus};

    fn snapshot() -> ChatContextSnapshot {
        ChatContextSnapshot {
            alert_type: "PodCrashLoop".into(),
            final_analysis: "the pod was OOMKilled".into(),
            stage_summaries: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn creating_a_chat_twice_for_the_same_session_is_idempotent() {
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::new(0));
        let store = Arc::new(InMemoryEventStore::new(clock.clone()));
        let events: Arc<dyn EventBus> = Arc::new(NotifyEventBus::new(store, clock.clone()));
        let cancellation = Arc::new(CancellationRegistry::new(clock.clone()));
        let agent = AgentProfile {
            name: "chat".into(),
            instructions: String::new(),
            mcp_servers: Vec::new(),
            max_iterations: 5,
            default_strategy: tarsy_core::model::IterationStrategy::Chat,
        };
        // history not exercised by get_or_create_chat in this test
        struct NoopHistory;
        #[async_trait::async_trait]
        impl HistoryStore for NoopHistory {
            async fn create_session(&self, _s: &tarsy_core::model::AlertSession) -> tarsy_core::error::CoreResult<()> { Ok(()) }
            async fn update_session(&self, _s: &tarsy_core::model::AlertSession) -> tarsy_core::error::CoreResult<()> { Ok(()) }
            async fn get_session(&self, _id: &SessionId) -> tarsy_core::error::CoreResult<Option<tarsy_core::model::AlertSession>> { Ok(None) }
            async fn create_stage(&self, _s: &tarsy_core::model::StageExecution) -> tarsy_core::error::CoreResult<()> { Ok(()) }
            async fn update_stage(&self, _s: &tarsy_core::model::StageExecution) -> tarsy_core::error::CoreResult<()> { Ok(()) }
            async fn get_stages(&self, _id: &SessionId) -> tarsy_core::error::CoreResult<Vec<tarsy_core::model::StageExecution>> { Ok(vec![]) }
            async fn record_interaction(&self, _i: &tarsy_core::model::Interaction) -> tarsy_core::error::CoreResult<()> { Ok(()) }
            async fn list_sessions(
                &self,
                _f: &tarsy_core::history::SessionFilter,
                _sf: tarsy_core::history::SortField,
                _so: tarsy_core::history::SortOrder,
                _p: &tarsy_core::history::Pagination,
            ) -> tarsy_core::error::CoreResult<tarsy_core::history::SessionListPage> {
                Ok(tarsy_core::history::SessionListPage { sessions: vec![], total_count: 0 })
            }
            async fn session_detail(&self, _id: &SessionId) -> tarsy_core::error::CoreResult<Option<tarsy_core::history::SessionDetail>> { Ok(None) }
            async fn delete_sessions_older_than(&self, _cutoff_us: i64) -> tarsy_core::error::CoreResult<u64> { Ok(0) }
            async fn mark_orphaned_sessions(&self, _cutoff_us: i64) -> tarsy_core::error::CoreResult<Vec<SessionId>> { Ok(vec![]) }
        }
        let history: Arc<dyn HistoryStore> = Arc::new(NoopHistory);

        let subsystem = ChatSubsystem::new(clock, events, history, cancellation, agent);
        let first = subsystem.get_or_create_chat(&"s1".to_string(), "alice", snapshot()).await;
        let second = subsystem.get_or_create_chat(&"s1".to_string(), "alice", snapshot()).await;
        assert_eq!(first.chat_id, second.chat_id);
    }
}
