//! Event fan-out: persistence, live broadcast, and alerting.
//!
//! The three publish steps are isolated; a failure in one never prevents
//! the others. Persistence gets one retry with jittered backoff, then the
//! event queues in a bounded in-memory buffer, kept per session, that
//! drains on the next successful write. Overflowing a session's buffer is
//! the only condition that halts that session; other sessions keep their
//! buffered events and keep running.

pub mod broadcast;

use crate::detect::Severity;
use crate::notify::Notifier;
use crate::pipeline::Event;
use crate::storage::{self, Pool};
use anyhow::Result;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use self::broadcast::SessionRegistry;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Append-only event persistence. Implementations must be idempotent on
/// `event_id` and safe under concurrent writers.
pub trait EventStore: Send + Sync {
    fn store(&self, event: &Event) -> Result<()>;
}

pub struct SqliteEventStore {
    pool: Pool,
}

impl SqliteEventStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl EventStore for SqliteEventStore {
    fn store(&self, event: &Event) -> Result<()> {
        storage::save_event(&self.pool, event)
    }
}

/// What happened to a published event. The lane inspects `session_fatal`
/// to decide whether to halt; everything else is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub persisted: bool,
    pub notified: bool,
    pub session_fatal: bool,
}

pub struct EventSink {
    store: Arc<dyn EventStore>,
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
    notify_threshold: Severity,
    pending: Mutex<HashMap<String, VecDeque<Event>>>,
    pending_limit: usize,
    store_failures: AtomicU64,
    dropped_events: AtomicU64,
    alerts_failed: AtomicU64,
}

impl EventSink {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<SessionRegistry>,
        notifier: Arc<dyn Notifier>,
        pending_limit: usize,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            notify_threshold: Severity::High,
            pending: Mutex::new(HashMap::new()),
            pending_limit,
            store_failures: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            alerts_failed: AtomicU64::new(0),
        }
    }

    /// Fan an event out to persistence, live subscribers, and the notifier.
    pub async fn publish(&self, event: Event) -> PublishOutcome {
        let persisted = self.persist(&event).await;
        let mut session_fatal = false;
        if !persisted {
            session_fatal = self.buffer_unpersisted(event.clone());
        }

        let receivers = self.registry.publish(&event);
        tracing::debug!(
            event_id = %event.event_id,
            session = %event.session_id,
            receivers,
            "Event broadcast"
        );

        let mut notified = false;
        if event.severity >= self.notify_threshold {
            notified = self.notifier.notify(&event).await;
            if !notified {
                self.alerts_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event_id = %event.event_id, "Alert notification failed");
            }
        }

        PublishOutcome {
            persisted,
            notified,
            session_fatal,
        }
    }

    /// Store with one retry. A success also drains any previously buffered
    /// events while the store is reachable again.
    async fn persist(&self, event: &Event) -> bool {
        match self.try_store(event) {
            Ok(()) => {
                self.drain_pending();
                true
            }
            Err(first) => {
                let jitter = rand::thread_rng().gen_range(0..100);
                tokio::time::sleep(RETRY_BACKOFF + Duration::from_millis(jitter)).await;
                match self.try_store(event) {
                    Ok(()) => {
                        self.drain_pending();
                        true
                    }
                    Err(second) => {
                        self.store_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            event_id = %event.event_id,
                            first_error = %first,
                            retry_error = %second,
                            "Event persistence failed after retry"
                        );
                        false
                    }
                }
            }
        }
    }

    fn try_store(&self, event: &Event) -> Result<()> {
        self.store.store(event)
    }

    /// Queue an unpersisted event in its session's buffer. Returns true
    /// when that buffer overflowed, which marks the session fatal --
    /// unbounded growth is worse than a halted session. Other sessions'
    /// buffers are untouched.
    fn buffer_unpersisted(&self, event: Event) -> bool {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let queue = pending.entry(event.session_id.clone()).or_default();
        queue.push_back(event);
        if queue.len() > self.pending_limit {
            if let Some(oldest) = queue.pop_front() {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    event_id = %oldest.event_id,
                    session = %oldest.session_id,
                    "Pending buffer overflow, oldest unpersisted event dropped"
                );
            }
            true
        } else {
            false
        }
    }

    fn drain_pending(&self) {
        loop {
            let next = {
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                let session = match pending.keys().next() {
                    Some(s) => s.clone(),
                    None => break,
                };
                let event = pending.get_mut(&session).and_then(|q| q.pop_front());
                if pending.get(&session).is_some_and(|q| q.is_empty()) {
                    pending.remove(&session);
                }
                event
            };
            let Some(event) = next else { break };
            if let Err(e) = self.try_store(&event) {
                tracing::warn!(event_id = %event.event_id, error = %e, "Pending drain stalled");
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                pending
                    .entry(event.session_id.clone())
                    .or_default()
                    .push_front(event);
                break;
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .values()
            .map(|q| q.len())
            .sum()
    }

    pub fn store_failure_count(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn alerts_failed_count(&self) -> u64 {
        self.alerts_failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicBool;

    /// Store that can be flipped unreachable, recording what it stored.
    struct FlakyStore {
        down: AtomicBool,
        stored: Mutex<Vec<Event>>,
    }

    impl FlakyStore {
        fn up() -> Self {
            Self {
                down: AtomicBool::new(false),
                stored: Mutex::new(Vec::new()),
            }
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn stored_labels(&self) -> Vec<String> {
            self.stored
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.label.clone())
                .collect()
        }
    }

    impl EventStore for FlakyStore {
        fn store(&self, event: &Event) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(anyhow!("store unreachable"));
            }
            self.stored.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct RecordingNotifier {
        calls: Mutex<Vec<String>>,
        succeed: bool,
    }

    impl RecordingNotifier {
        fn new(succeed: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                succeed,
            }
        }
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &Event) -> bool {
            self.calls.lock().unwrap().push(event.label.clone());
            self.succeed
        }
    }

    fn sink(
        store: Arc<FlakyStore>,
        notifier: Arc<RecordingNotifier>,
        limit: usize,
    ) -> (EventSink, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        let sink = EventSink::new(store, registry.clone(), notifier, limit);
        (sink, registry)
    }

    fn event(label: &str, severity: Severity) -> Event {
        Event::new("cam-1", label, 0.9, severity)
    }

    fn event_for(session: &str, label: &str, severity: Severity) -> Event {
        Event::new(session, label, 0.9, severity)
    }

    #[tokio::test]
    async fn test_publish_persists_broadcasts_and_notifies() {
        let store = Arc::new(FlakyStore::up());
        let notifier = Arc::new(RecordingNotifier::new(true));
        let (sink, registry) = sink(store.clone(), notifier.clone(), 8);
        let mut rx = registry.subscribe("cam-1");

        let outcome = sink.publish(event("scissors", Severity::Critical)).await;

        assert!(outcome.persisted);
        assert!(outcome.notified);
        assert!(!outcome.session_fatal);
        assert_eq!(store.stored_labels(), vec!["scissors"]);
        assert_eq!(rx.recv().await.unwrap().label, "scissors");
        assert_eq!(notifier.calls.lock().unwrap().as_slice(), ["scissors"]);
    }

    #[tokio::test]
    async fn test_low_and_medium_events_skip_notifier() {
        let store = Arc::new(FlakyStore::up());
        let notifier = Arc::new(RecordingNotifier::new(true));
        let (sink, _registry) = sink(store, notifier.clone(), 8);

        sink.publish(event("cell phone", Severity::Low)).await;
        sink.publish(event("person", Severity::Medium)).await;

        assert!(notifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_still_broadcasts_and_notifies() {
        let store = Arc::new(FlakyStore::up());
        store.set_down(true);
        let notifier = Arc::new(RecordingNotifier::new(true));
        let (sink, registry) = sink(store.clone(), notifier.clone(), 8);
        let mut rx = registry.subscribe("cam-1");

        let outcome = sink.publish(event("gun", Severity::Critical)).await;

        assert!(!outcome.persisted);
        assert!(!outcome.session_fatal);
        assert_eq!(sink.store_failure_count(), 1);
        assert_eq!(sink.pending_len(), 1);
        // Broadcast and notification still happened.
        assert_eq!(rx.recv().await.unwrap().label, "gun");
        assert_eq!(notifier.calls.lock().unwrap().as_slice(), ["gun"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_drains_once_store_recovers() {
        let store = Arc::new(FlakyStore::up());
        let notifier = Arc::new(RecordingNotifier::new(true));
        let (sink, _registry) = sink(store.clone(), notifier, 8);

        store.set_down(true);
        sink.publish(event("knife", Severity::High)).await;
        assert_eq!(sink.pending_len(), 1);

        store.set_down(false);
        sink.publish(event("scissors", Severity::High)).await;

        assert_eq!(sink.pending_len(), 0);
        // Both ended up stored; the buffered one drained on recovery.
        let mut labels = store.stored_labels();
        labels.sort();
        assert_eq!(labels, vec!["knife", "scissors"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_overflow_is_session_fatal() {
        let store = Arc::new(FlakyStore::up());
        store.set_down(true);
        let notifier = Arc::new(RecordingNotifier::new(true));
        let (sink, _registry) = sink(store, notifier, 2);

        assert!(!sink.publish(event("a", Severity::High)).await.session_fatal);
        assert!(!sink.publish(event("b", Severity::High)).await.session_fatal);
        let outcome = sink.publish(event("c", Severity::High)).await;

        assert!(outcome.session_fatal);
        assert_eq!(sink.dropped_event_count(), 1);
        assert_eq!(sink.pending_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_overflow_only_affects_its_own_session() {
        let store = Arc::new(FlakyStore::up());
        store.set_down(true);
        let notifier = Arc::new(RecordingNotifier::new(true));
        let (sink, _registry) = sink(store.clone(), notifier, 2);

        // cam-b buffers one event, then cam-a overflows its own buffer.
        let b = sink
            .publish(event_for("cam-b", "knife", Severity::High))
            .await;
        assert!(!b.session_fatal);
        for label in ["a1", "a2"] {
            let outcome = sink.publish(event_for("cam-a", label, Severity::High)).await;
            assert!(!outcome.session_fatal);
        }
        let overflow = sink.publish(event_for("cam-a", "a3", Severity::High)).await;

        assert!(overflow.session_fatal);
        assert_eq!(sink.dropped_event_count(), 1);
        // cam-b's buffered event survived the cam-a overflow.
        assert_eq!(sink.pending_len(), 3);

        // Once the store recovers, cam-b's event still gets persisted.
        store.set_down(false);
        sink.publish(event_for("cam-b", "scissors", Severity::High))
            .await;
        let labels = store.stored_labels();
        assert!(labels.contains(&"knife".to_string()));
        assert!(labels.contains(&"scissors".to_string()));
    }

    #[tokio::test]
    async fn test_failed_notification_does_not_affect_outcome() {
        let store = Arc::new(FlakyStore::up());
        let notifier = Arc::new(RecordingNotifier::new(false));
        let (sink, _registry) = sink(store.clone(), notifier, 8);

        let outcome = sink.publish(event("rifle", Severity::Critical)).await;

        assert!(outcome.persisted);
        assert!(!outcome.notified);
        assert!(!outcome.session_fatal);
        assert_eq!(sink.alerts_failed_count(), 1);
        assert_eq!(store.stored_labels(), vec!["rifle"]);
    }
}
