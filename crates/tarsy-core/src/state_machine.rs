//! Session/stage lifecycle and cooperative cancellation (spec §4.8).
//!
//! Cancellation is one `tokio::sync::watch` signal per session (or per chat
//! execution), polled at iteration boundaries -- the same cooperative shape
//! the teacher uses for agent-loop cancellation, generalized from a single
//! process-wide bool to a per-session registry so multiple sessions can run
//! concurrently without cross-talk.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::model::SessionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSignal {
    Running,
    Canceling,
}

/// A cooperative cancellation token: cheap to clone, polled with
/// `is_canceling()` at iteration boundaries, before every LLM/tool call, and
/// after every hook per spec §4.8.
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<CancelSignal>,
}

impl CancellationToken {
    pub fn is_canceling(&self) -> bool {
        *self.rx.borrow() == CancelSignal::Canceling
    }
}

struct CancelEntry {
    tx: watch::Sender<CancelSignal>,
    requested_at_us: Option<i64>,
}

/// Per-process registry of cancellation signals keyed by session id (or,
/// for chats, by `stage_execution_id`). Registration is idempotent: calling
/// `register` twice for the same key returns the existing token.
pub struct CancellationRegistry {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CancelEntry>>,
}

impl CancellationRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, key: &str) -> CancellationToken {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            let (tx, _rx) = watch::channel(CancelSignal::Running);
            CancelEntry { tx, requested_at_us: None }
        });
        CancellationToken { rx: entry.tx.subscribe() }
    }

    /// Idempotent: a second call for an already-canceling key is a no-op and
    /// returns `false` (spec §5 + round-trip law "cancel a terminal/
    /// cancelling session twice never changes state again").
    pub fn request_cancel(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if *entry.tx.borrow() == CancelSignal::Canceling {
            return false;
        }
        entry.requested_at_us = Some(self.clock.now_us());
        let _ = entry.tx.send(CancelSignal::Canceling);
        true
    }

    pub fn requested_at_us(&self, key: &str) -> Option<i64> {
        self.entries.lock().get(key).and_then(|e| e.requested_at_us)
    }

    pub fn forget(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseSignal {
    Running,
    PauseRequested,
}

/// Cooperative pause token, the same shape as [`CancellationToken`] but for
/// pause requests -- kept as a separate signal rather than folding into
/// [`CancelSignal`] because pause and cancel are independently resumable:
/// a paused stage resumes into `Running`, a cancelled one never does.
#[derive(Clone)]
pub struct PauseToken {
    rx: watch::Receiver<PauseSignal>,
}

impl PauseToken {
    pub fn is_pause_requested(&self) -> bool {
        *self.rx.borrow() == PauseSignal::PauseRequested
    }
}

struct PauseEntry {
    tx: watch::Sender<PauseSignal>,
}

/// Per-process registry of pause signals keyed by `stage_execution_id`.
/// Resuming a stage clears its entry so the next pause request starts clean.
pub struct PauseRegistry {
    entries: Mutex<HashMap<String, PauseEntry>>,
}

impl PauseRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, stage_execution_id: &str) -> PauseToken {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(stage_execution_id.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = watch::channel(PauseSignal::Running);
                PauseEntry { tx }
            });
        PauseToken { rx: entry.tx.subscribe() }
    }

    pub fn request_pause(&self, stage_execution_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(stage_execution_id) else {
            return false;
        };
        if *entry.tx.borrow() == PauseSignal::PauseRequested {
            return false;
        }
        let _ = entry.tx.send(PauseSignal::PauseRequested);
        true
    }

    /// Resume clears the pause signal back to `Running` so a subsequent
    /// controller turn isn't immediately re-paused (spec §8 round-trip law:
    /// "resume a paused stage, then pause again before any iteration" starts
    /// from a clean `Running` state).
    pub fn resume(&self, stage_execution_id: &str) {
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(stage_execution_id) {
            let _ = entry.tx.send(PauseSignal::Running);
        }
    }

    pub fn forget(&self, stage_execution_id: &str) {
        self.entries.lock().remove(stage_execution_id);
    }
}

impl Default for PauseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Legal session transitions (spec §4.8 transition diagram). Returns an
/// error for anything not explicitly listed rather than allowing silent
/// corruption of the lifecycle.
pub fn validate_session_transition(from: SessionStatus, to: SessionStatus) -> CoreResult<()> {
    use SessionStatus::*;
    let legal = matches!(
        (from, to),
        (Pending, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Canceling)
            | (InProgress, Paused)
            | (Canceling, Cancelled)
            | (Paused, InProgress)
            | (Paused, Cancelled)
            | (Pending, Failed)
            | (InProgress, Cancelled)
    );
    if legal {
        Ok(())
    } else {
        Err(CoreError::InvalidState(format!(
            "illegal session transition {from:?} -> {to:?}"
        )))
    }
}

/// Background sweep that forces CANCELLED on sessions stuck in CANCELING
/// past `timeout`, and (separately) FAILED on sessions that crashed without
/// a terminal transition (orphan detection, spec §4.8/§4.9).
pub struct OrphanDetector {
    clock: Arc<dyn Clock>,
    cancel_timeout: Duration,
}

impl OrphanDetector {
    pub fn new(clock: Arc<dyn Clock>, cancel_timeout: Duration) -> Self {
        Self { clock, cancel_timeout }
    }

    /// Whether a session that entered CANCELING at `canceling_since_us`
    /// should be force-cancelled at `now`.
    pub fn should_force_cancel(&self, canceling_since_us: i64) -> bool {
        let now = self.clock.now_us();
        now - canceling_since_us >= self.cancel_timeout.as_micros() as i64
    }

    /// Whether a non-terminal session last updated at `last_activity_us`
    /// should be classified orphaned and marked FAILED.
    pub fn should_mark_orphaned(&self, last_activity_us: i64, orphan_timeout: Duration) -> bool {
        let now = self.clock.now_us();
        now - last_activity_us >= orphan_timeout.as_micros() as i64
    }
}

pub const ORPHANED_ERROR_MESSAGE: &str = "orphaned: session stuck without a terminal transition";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;

    #[test]
    fn legal_transitions_are_accepted() {
        assert!(validate_session_transition(SessionStatus::Pending, SessionStatus::InProgress).is_ok());
        assert!(validate_session_transition(SessionStatus::Paused, SessionStatus::InProgress).is_ok());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(validate_session_transition(SessionStatus::Completed, SessionStatus::InProgress).is_err());
        assert!(validate_session_transition(SessionStatus::Cancelled, SessionStatus::Paused).is_err());
    }

    #[test]
    fn cancel_is_idempotent() {
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::new(0));
        let registry = CancellationRegistry::new(clock);
        let token = registry.register("s1");
        assert!(!token.is_canceling());
        assert!(registry.request_cancel("s1"));
        assert!(token.is_canceling());
        assert!(!registry.request_cancel("s1"));
    }

    #[test]
    fn pause_then_resume_clears_signal() {
        let registry = PauseRegistry::new();
        let token = registry.register("stage-1");
        assert!(!token.is_pause_requested());
        assert!(registry.request_pause("stage-1"));
        assert!(token.is_pause_requested());
        registry.resume("stage-1");
        assert!(!token.is_pause_requested());
    }

    #[test]
    fn orphan_detector_fires_after_timeout() {
        let clock = Arc::new(FrozenClock::new(0));
        let detector = OrphanDetector::new(clock.clone(), Duration::from_secs(30));
        assert!(!detector.should_force_cancel(0));
        clock.advance(31_000_000);
        assert!(detector.should_force_cancel(0));
    }
}
