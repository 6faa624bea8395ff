use std::fmt;

/// Errors surfaced by the abstract `LLMClient` capability.
///
/// Kept as a manual `Display` impl + `std::error::Error`, matching the
/// style the chat/completion traits in this crate were already built
/// around, rather than switching this one type to `thiserror` while
/// everything else (`tarsy-core::error::CoreError`) uses it.
#[derive(Debug)]
pub enum LlmError {
    Transport(String),
    Auth(String),
    InvalidRequest(String),
    Provider(String),
    Timeout(String),
    ResponseFormat { message: String, raw_response: String },
    Json(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transport(e) => write!(f, "transport error: {e}"),
            LlmError::Auth(e) => write!(f, "auth error: {e}"),
            LlmError::InvalidRequest(e) => write!(f, "invalid request: {e}"),
            LlmError::Provider(e) => write!(f, "provider error: {e}"),
            LlmError::Timeout(e) => write!(f, "timeout: {e}"),
            LlmError::ResponseFormat { message, raw_response } => {
                write!(f, "response format error: {message}. raw: {raw_response}")
            }
            LlmError::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

/// Errors surfaced by the abstract `ToolClient` capability. Transport
/// failures never raise: they surface as `ToolResult { success: false, .. }`
/// (spec §4.6); this type exists for the handful of call sites (config
/// loading, masker compilation) where raising is still appropriate.
#[derive(Debug, thiserror::Error)]
pub enum ToolClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unknown server: {0}")]
    UnknownServer(String),
    #[error("invalid transport config: {0}")]
    InvalidConfig(String),
    #[error("masking error: {0}")]
    Masking(String),
}
