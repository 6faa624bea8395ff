//! Chain execution core: clock/ids, event bus, interaction pipeline, session
//! state machine and history persistence.
//!
//! This crate holds the data model and the process-wide infrastructure the
//! scheduler and iteration controllers in `tarsy-runtime` are built on top
//! of. It never imports an LLM/tool-server-specific type; those live in
//! `tarsy-runtime` behind the abstract `LlmClient`/`ToolClient` traits.

pub mod clock;
pub mod error;
pub mod events;
pub mod history;
pub mod model;
pub mod pipeline;
pub mod state_machine;
