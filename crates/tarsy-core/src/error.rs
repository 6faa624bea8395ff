//! Error taxonomy for the chain execution core (spec §7).
//!
//! These are the "kind" distinctions the rest of the core reasons about —
//! validation vs. transport vs. parser vs. hook errors — not a single
//! catch-all. Most of the time a `CoreError` never escapes a component:
//! an agent run always returns a terminal `AgentExecutionResult`, a stage
//! always returns a terminal status, and a session always reaches a
//! terminal status. `CoreError` is for the boundaries where that isn't
//! true yet — config loading, history queries, event bus setup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller-supplied input failed validation (empty message, bad chain_id, ...).
    /// Never mutates session state; the API layer maps this to 4xx.
    #[error("validation error: {0}")]
    Validation(String),

    /// stdio/HTTP/SSE transport failure talking to an LLM or tool server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The LLM provider returned an error, timed out, or rejected the request.
    #[error("llm error: {0}")]
    Llm(String),

    /// A ReAct-style response could not be parsed by any tier.
    #[error("parser error: {0}")]
    Parser(String),

    /// A persistence operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The referenced session/stage/chat is in a state that does not allow
    /// the requested operation (e.g. cancelling an already-terminal session).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Catch-all for errors that don't fit the above but still need a typed
    /// home (masking subsystem misconfiguration, orphan sweep failures, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
