//! Durable event append + real-time fan-out (spec §4.10, §6.3).
//!
//! Two interchangeable backends share one [`EventBus`] trait: an in-process
//! notify-capable bus (a `tokio::sync::broadcast`-style callback table) and a
//! polling bus that tails an `events` table with a per-channel cursor. The
//! polling shape is lifted directly from the source's SQLite listener:
//! `last_event_id` cursor per channel, a single poll loop on a fixed
//! interval, and an error back-off — see `EventStore`/`PollingEventBus`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::model::Event;

pub type EventPayload = serde_json::Map<String, serde_json::Value>;

/// A handler registered against one channel. Callback errors are logged and
/// suppressed; they must never propagate to the publisher.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Durable append-only backing store for events, shared by both bus flavors.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, channel: &str, payload: EventPayload) -> CoreResult<Event>;

    /// Strictly-increasing-id page of events on `channel` after `after_id`.
    async fn get_events_after(
        &self,
        channel: &str,
        after_id: i64,
        limit: i64,
    ) -> CoreResult<Vec<Event>>;
}

/// Uniform subscribe/publish/unsubscribe capability regardless of backend.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: EventPayload) -> CoreResult<Event>;

    /// Registers `handler` on `channel`, returning a subscription id that
    /// must be passed to [`EventBus::unsubscribe`] to remove it.
    async fn subscribe(&self, channel: &str, handler: EventHandler) -> u64;

    async fn unsubscribe(&self, channel: &str, subscription_id: u64);
}

struct ChannelState {
    handlers: HashMap<u64, EventHandler>,
    last_event_id: i64,
    last_activity_us: i64,
}

/// In-process notify-capable bus: publish dispatches synchronously (but
/// asynchronously with respect to the publisher's own await point) to every
/// registered handler. Suitable when the backing store supports native
/// pub/sub (e.g. Postgres LISTEN/NOTIFY) and callbacks can run inline.
pub struct NotifyEventBus {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    channels: Mutex<HashMap<String, ChannelState>>,
    next_sub_id: std::sync::atomic::AtomicU64,
}

impl NotifyEventBus {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            channels: Mutex::new(HashMap::new()),
            next_sub_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn touch(&self, channel: &str) {
        let mut channels = self.channels.lock();
        if let Some(state) = channels.get_mut(channel) {
            state.last_activity_us = self.clock.now_us();
        }
    }

    /// Drop channels with no subscribers and no activity for `idle_secs`.
    /// Called opportunistically on publish/unsubscribe, mirroring the
    /// source's "idle channels are garbage-collected" requirement.
    fn gc_idle(&self, idle_secs: i64) {
        let now = self.clock.now_us();
        let mut channels = self.channels.lock();
        channels.retain(|_, state| {
            !state.handlers.is_empty() || now - state.last_activity_us < idle_secs * 1_000_000
        });
    }
}

#[async_trait]
impl EventBus for NotifyEventBus {
    async fn publish(&self, channel: &str, payload: EventPayload) -> CoreResult<Event> {
        let event = self.store.append(channel, payload).await?;
        self.touch(channel);
        let handlers: Vec<EventHandler> = {
            let channels = self.channels.lock();
            channels
                .get(channel)
                .map(|s| s.handlers.values().cloned().collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            let ev = event.clone();
            // Callback errors must never affect the publisher; handlers are
            // plain closures so a panic would be a programming error, not a
            // recoverable "callback failed" case we need to catch here.
            handler(ev);
        }
        self.gc_idle(60);
        Ok(event)
    }

    async fn subscribe(&self, channel: &str, handler: EventHandler) -> u64 {
        let id = self
            .next_sub_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut channels = self.channels.lock();
        let state = channels.entry(channel.to_string()).or_insert_with(|| ChannelState {
            handlers: HashMap::new(),
            last_event_id: 0,
            last_activity_us: self.clock.now_us(),
        });
        state.handlers.insert(id, handler);
        state.last_activity_us = self.clock.now_us();
        id
    }

    async fn unsubscribe(&self, channel: &str, subscription_id: u64) {
        {
            let mut channels = self.channels.lock();
            if let Some(state) = channels.get_mut(channel) {
                state.handlers.remove(&subscription_id);
            }
        }
        self.gc_idle(60);
    }
}

/// Polling bus: tails `EventStore` on a fixed interval per the source's
/// `sqlite_listener.py` shape (poll_interval ~500ms, error back-off ~5s).
pub struct PollingEventBus {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    next_sub_id: std::sync::atomic::AtomicU64,
    poll_interval: Duration,
    error_backoff: Duration,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl PollingEventBus {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_intervals(store, clock, Duration::from_millis(500), Duration::from_secs(5))
    }

    pub fn with_intervals(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        error_backoff: Duration,
    ) -> Arc<Self> {
        let bus = Arc::new(Self {
            store,
            clock,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_sub_id: std::sync::atomic::AtomicU64::new(1),
            poll_interval,
            error_backoff,
            loop_handle: Mutex::new(None),
            shutdown: Mutex::new(None),
        });
        bus.clone().spawn_poll_loop();
        bus
    }

    fn spawn_poll_loop(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::channel(1);
        *self.shutdown.lock() = Some(tx);
        let bus = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = tokio::time::sleep(bus.poll_interval) => {
                        if let Err(e) = bus.poll_once().await {
                            tracing::error!(error = %e, "event bus poll failed, backing off");
                            tokio::time::sleep(bus.error_backoff).await;
                        }
                    }
                }
            }
        });
        *self.loop_handle.lock() = Some(handle);
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.loop_handle.lock().take() {
            let _ = handle.await;
        }
    }

    async fn poll_once(&self) -> CoreResult<()> {
        let channel_names: Vec<String> = {
            let channels = self.channels.lock();
            channels
                .iter()
                .filter(|(_, s)| !s.handlers.is_empty())
                .map(|(name, _)| name.clone())
                .collect()
        };
        for channel in channel_names {
            let last_id = {
                let channels = self.channels.lock();
                channels.get(&channel).map(|s| s.last_event_id).unwrap_or(0)
            };
            let events = self.store.get_events_after(&channel, last_id, 100).await?;
            if events.is_empty() {
                continue;
            }
            let handlers: Vec<EventHandler> = {
                let channels = self.channels.lock();
                channels
                    .get(&channel)
                    .map(|s| s.handlers.values().cloned().collect())
                    .unwrap_or_default()
            };
            let mut max_id = last_id;
            for event in events {
                max_id = max_id.max(event.id);
                for handler in &handlers {
                    handler(event.clone());
                }
            }
            let mut channels = self.channels.lock();
            if let Some(state) = channels.get_mut(&channel) {
                state.last_event_id = max_id;
                state.last_activity_us = self.clock.now_us();
            }
        }
        self.gc_idle(60);
        Ok(())
    }

    fn gc_idle(&self, idle_secs: i64) {
        let now = self.clock.now_us();
        let mut channels = self.channels.lock();
        channels.retain(|_, state| {
            !state.handlers.is_empty() || now - state.last_activity_us < idle_secs * 1_000_000
        });
    }
}

#[async_trait]
impl EventBus for PollingEventBus {
    async fn publish(&self, channel: &str, payload: EventPayload) -> CoreResult<Event> {
        self.store.append(channel, payload).await
    }

    async fn subscribe(&self, channel: &str, handler: EventHandler) -> u64 {
        let id = self
            .next_sub_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut channels = self.channels.lock();
        let state = channels.entry(channel.to_string()).or_insert_with(|| ChannelState {
            handlers: HashMap::new(),
            last_event_id: 0,
            last_activity_us: self.clock.now_us(),
        });
        state.handlers.insert(id, handler);
        state.last_activity_us = self.clock.now_us();
        id
    }

    async fn unsubscribe(&self, channel: &str, subscription_id: u64) {
        let mut channels = self.channels.lock();
        if let Some(state) = channels.get_mut(channel) {
            state.handlers.remove(&subscription_id);
        }
    }
}

/// In-memory `EventStore`, for tests and single-process demo wiring where no
/// real database is mounted.
pub struct InMemoryEventStore {
    rows: Mutex<Vec<Event>>,
    clock: Arc<dyn Clock>,
    next_id: std::sync::atomic::AtomicI64,
}

impl InMemoryEventStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            clock,
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, channel: &str, payload: EventPayload) -> CoreResult<Event> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let event = Event {
            id,
            channel: channel.to_string(),
            payload,
            created_at_us: self.clock.now_us(),
        };
        self.rows.lock().push(event.clone());
        Ok(event)
    }

    async fn get_events_after(
        &self,
        channel: &str,
        after_id: i64,
        limit: i64,
    ) -> CoreResult<Vec<Event>> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .filter(|e| e.channel == channel && e.id > after_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// Fixed channel names used outside of per-session channels.
pub mod channels {
    pub const DASHBOARD_UPDATES: &str = "dashboard_updates";
    pub const CANCELLATIONS: &str = "cancellations";

    pub fn session_channel(session_id: &str) -> String {
        format!("session_{session_id}")
    }

    /// `ChannelType.extract_session_id` equivalent: `session_<id>` -> `<id>`,
    /// anything else -> `None`.
    pub fn extract_session_id(channel: &str) -> Option<&str> {
        channel.strip_prefix("session_")
    }
}

pub fn unknown_channel_error(channel: &str) -> CoreError {
    CoreError::NotFound(format!("unknown channel: {channel}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn notify_bus_dispatches_in_strictly_increasing_id_order() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new(clock.clone()));
        let bus = NotifyEventBus::new(store, clock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handler: EventHandler = Arc::new(move |e| seen2.lock().push(e.id));
        bus.subscribe("session_abc", handler).await;
        for _ in 0..5 {
            bus.publish("session_abc", serde_json::Map::new()).await.unwrap();
        }
        let ids = seen.lock().clone();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn unsubscribing_last_handler_removes_channel_tracking() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new(clock.clone()));
        let bus = NotifyEventBus::new(store, clock);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = bus
            .subscribe("c1", Arc::new(move |_| { count2.fetch_add(1, Ordering::SeqCst); }))
            .await;
        bus.publish("c1", serde_json::Map::new()).await.unwrap();
        bus.unsubscribe("c1", id).await;
        bus.publish("c1", serde_json::Map::new()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extract_session_id_only_matches_session_channels() {
        assert_eq!(channels::extract_session_id("session_abc"), Some("abc"));
        assert_eq!(channels::extract_session_id("dashboard_updates"), None);
    }
}
