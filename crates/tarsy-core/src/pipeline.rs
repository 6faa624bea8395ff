//! Interaction Pipeline: typed scoped hooks around every LLM/tool call
//! (spec §4.5).
//!
//! Mirrors the source's decorator-style "open record / run / finalize /
//! publish" wrapper as an explicit scoped-acquisition helper rather than a
//! decorator, per the design note in spec §9: the original outcome is
//! always propagated even if a hook fails, and each hook kind carries its
//! own error budget so a poisoned sink (e.g. the event bus down) can't take
//! the whole execution down with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::model::{Interaction, InteractionDetail, SessionId, StageExecutionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Llm,
    ToolCall,
    ToolList,
}

/// A persistence/event-publication hook registered for one `HookKind`.
/// Implementors should not panic; any `Err` counts against the error budget
/// and is logged, never returned to the caller of the wrapped operation.
pub trait InteractionHook: Send + Sync {
    fn run(&self, interaction: &Interaction) -> Result<(), String>;
}

struct HookSlot {
    hook: Arc<dyn InteractionHook>,
    consecutive_failures: AtomicU32,
    disabled: std::sync::atomic::AtomicBool,
}

/// Request id generator + hook registry, attached to every finalized
/// interaction so a UI can correlate partial/in-flight state.
pub struct InteractionPipeline {
    clock: Arc<dyn Clock>,
    hooks: Mutex<HashMap<HookKind, Vec<HookSlot>>>,
    error_budget: u32,
}

impl InteractionPipeline {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            hooks: Mutex::new(HashMap::new()),
            error_budget: 3,
        }
    }

    pub fn with_error_budget(clock: Arc<dyn Clock>, error_budget: u32) -> Self {
        Self {
            clock,
            hooks: Mutex::new(HashMap::new()),
            error_budget,
        }
    }

    pub fn register_hook(&self, kind: HookKind, hook: Arc<dyn InteractionHook>) {
        let mut hooks = self.hooks.lock();
        hooks.entry(kind).or_default().push(HookSlot {
            hook,
            consecutive_failures: AtomicU32::new(0),
            disabled: std::sync::atomic::AtomicBool::new(false),
        });
    }

    /// Scoped acquisition around one attempt: runs `op`, finalizes a terminal
    /// `Interaction` record regardless of outcome, dispatches it through
    /// every enabled hook for `kind`, and returns `op`'s own `Result`
    /// untouched -- a hook failure never changes the caller's result.
    pub async fn run<T, E, F, Fut>(
        &self,
        kind: HookKind,
        session_id: SessionId,
        stage_execution_id: Option<StageExecutionId>,
        detail_on_success: impl FnOnce(&T) -> InteractionDetail,
        detail_on_error: impl FnOnce(&E) -> InteractionDetail,
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let request_id = Uuid::new_v4().to_string();
        let started_at_us = self.clock.now_us();
        let outcome = op().await;
        let completed_at_us = self.clock.now_us();
        let duration_ms = (completed_at_us - started_at_us) / 1000;

        let interaction = match &outcome {
            Ok(value) => Interaction {
                interaction_id: request_id,
                session_id,
                stage_execution_id,
                started_at_us,
                completed_at_us,
                duration_ms,
                success: true,
                error_message: None,
                detail: detail_on_success(value),
            },
            Err(err) => Interaction {
                interaction_id: request_id,
                session_id,
                stage_execution_id,
                started_at_us,
                completed_at_us,
                duration_ms,
                success: false,
                error_message: Some(err.to_string()),
                detail: detail_on_error(err),
            },
        };

        self.dispatch(kind, &interaction);
        outcome
    }

    fn dispatch(&self, kind: HookKind, interaction: &Interaction) {
        let hooks = self.hooks.lock();
        let Some(slots) = hooks.get(&kind) else {
            return;
        };
        for slot in slots {
            if slot.disabled.load(Ordering::SeqCst) {
                continue;
            }
            match slot.hook.run(interaction) {
                Ok(()) => {
                    slot.consecutive_failures.store(0, Ordering::SeqCst);
                }
                Err(err) => {
                    tracing::warn!(?kind, error = %err, "interaction hook failed");
                    let failures = slot.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= self.error_budget {
                        tracing::error!(?kind, failures, "hook auto-disabled past error budget");
                        slot.disabled.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::model::TokenUsage;
    use std::sync::atomic::AtomicUsize;

    struct CountingHook {
        calls: Arc<AtomicUsize>,
        always_fail: bool,
    }

    impl InteractionHook for CountingHook {
        fn run(&self, _interaction: &Interaction) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.always_fail {
                Err("boom".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn hook_failure_never_changes_caller_result() {
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::new(0));
        let pipeline = InteractionPipeline::with_error_budget(clock, 3);
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.register_hook(
            HookKind::Llm,
            Arc::new(CountingHook { calls: calls.clone(), always_fail: true }),
        );

        let result: Result<u32, String> = pipeline
            .run(
                HookKind::Llm,
                "s1".into(),
                None,
                |_: &u32| InteractionDetail::Llm {
                    provider: "p".into(),
                    model: "m".into(),
                    token_usage: Some(TokenUsage::default()),
                },
                |_: &String| InteractionDetail::Llm {
                    provider: "p".into(),
                    model: "m".into(),
                    token_usage: None,
                },
                || async { Ok(42u32) },
            )
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hook_auto_disables_after_error_budget() {
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::new(0));
        let pipeline = InteractionPipeline::with_error_budget(clock, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.register_hook(
            HookKind::ToolCall,
            Arc::new(CountingHook { calls: calls.clone(), always_fail: true }),
        );

        for _ in 0..5 {
            let _: Result<u32, String> = pipeline
                .run(
                    HookKind::ToolCall,
                    "s1".into(),
                    None,
                    |_: &u32| InteractionDetail::Tool {
                        server: "srv".into(),
                        tool: "t".into(),
                        arguments: serde_json::json!({}),
                        result: None,
                    },
                    |_: &String| InteractionDetail::Tool {
                        server: "srv".into(),
                        tool: "t".into(),
                        arguments: serde_json::json!({}),
                        result: None,
                    },
                    || async { Ok(1u32) },
                )
                .await;
        }

        // Budget is 2: the hook runs twice then gets disabled, so later
        // iterations don't call it again.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
