//! Per-session detection pipeline.
//!
//! Each active session (one camera/client stream) runs its own lane: a
//! tokio task fed by a bounded mpsc queue, processing frames strictly in
//! arrival order. Sessions are independent; the only shared mutable state
//! is the cooldown table and the event store, both safe under concurrent
//! use. Closing the queue is the cancellation path -- the lane drains and
//! deregisters itself.

pub mod lane;

use crate::detect::adapter::Detector;
use crate::detect::classify::SeverityPolicy;
use crate::detect::cooldown::CooldownTable;
use crate::detect::Severity;
use crate::enrich::Enricher;
use crate::sink::broadcast::SessionRegistry;
use crate::sink::EventSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One decoded frame tagged with its stream. Owned transiently by the
/// lane; dropped once detection completes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub session_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(session_id: &str, sequence: u64, pixels: Vec<u8>) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence,
            timestamp: Utc::now(),
            pixels,
        }
    }
}

/// A detection that survived classification and cooldown, eligible for
/// persistence and alerting. `diagnosis` transitions from absent to present
/// exactly once, during enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub session_id: String,
    pub label: String,
    pub confidence: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub diagnosis: Option<String>,
    pub fallback_diagnosis: bool,
}

impl Event {
    pub fn new(session_id: &str, label: &str, confidence: f64, severity: Severity) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            label: label.to_string(),
            confidence,
            severity,
            timestamp: Utc::now(),
            diagnosis: None,
            fallback_diagnosis: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} already has an active ingest lane")]
    AlreadyActive(String),
}

/// Pipeline-wide counters, surfaced on the status endpoint.
#[derive(Default)]
pub struct PipelineCounters {
    pub frames_ingested: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub frames_invalid: AtomicU64,
    pub detections_seen: AtomicU64,
    pub detections_discarded: AtomicU64,
    pub events_admitted: AtomicU64,
    pub events_published: AtomicU64,
    pub fallback_diagnoses: AtomicU64,
    pub sessions_failed: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct CountersSnapshot {
    pub frames_ingested: u64,
    pub frames_skipped: u64,
    pub frames_invalid: u64,
    pub detections_seen: u64,
    pub detections_discarded: u64,
    pub events_admitted: u64,
    pub events_published: u64,
    pub fallback_diagnoses: u64,
    pub sessions_failed: u64,
    pub alerts_suppressed: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self, cooldown: &CooldownTable) -> CountersSnapshot {
        CountersSnapshot {
            frames_ingested: self.frames_ingested.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_invalid: self.frames_invalid.load(Ordering::Relaxed),
            detections_seen: self.detections_seen.load(Ordering::Relaxed),
            detections_discarded: self.detections_discarded.load(Ordering::Relaxed),
            events_admitted: self.events_admitted.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            fallback_diagnoses: self.fallback_diagnoses.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            alerts_suppressed: cooldown.suppressed_count(),
        }
    }
}

/// Everything a lane needs, shared by all sessions.
pub struct LaneDeps {
    pub detector: Arc<dyn Detector>,
    pub policy: SeverityPolicy,
    pub cooldown: Arc<CooldownTable>,
    pub enricher: Arc<dyn Enricher>,
    pub enrich_timeout: Duration,
    pub sink: Arc<EventSink>,
    pub registry: Arc<SessionRegistry>,
    pub counters: Arc<PipelineCounters>,
    pub min_frame_interval: Duration,
}

/// Handle to a running session lane. Dropping it closes the queue; the
/// lane drains whatever is buffered, then deregisters itself. That drop
/// is the only teardown path.
pub struct LaneHandle {
    pub frames: mpsc::Sender<Frame>,
}

pub struct SessionManager {
    deps: Arc<LaneDeps>,
    queue_depth: usize,
    lanes: Arc<Mutex<HashSet<String>>>,
}

impl SessionManager {
    pub fn new(deps: Arc<LaneDeps>, queue_depth: usize) -> Self {
        Self {
            deps,
            queue_depth,
            lanes: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Spawn a lane for a new session. A second ingest connection for a
    /// live session id is refused rather than silently replacing the lane.
    /// A session stays active until its lane has drained and exited, so a
    /// reconnect racing the drain of its predecessor is refused too.
    pub fn open(&self, session_id: &str) -> Result<LaneHandle, SessionError> {
        {
            let mut lanes = self.lanes.lock().expect("lanes lock poisoned");
            if !lanes.insert(session_id.to_string()) {
                return Err(SessionError::AlreadyActive(session_id.to_string()));
            }
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let deps = self.deps.clone();
        let lanes = self.lanes.clone();
        let session = session_id.to_string();
        tokio::spawn(async move {
            tracing::info!(session = %session, "Session lane started");
            lane::run_lane(&session, rx, &deps).await;

            // Teardown: deregister and release per-session state.
            lanes.lock().expect("lanes lock poisoned").remove(&session);
            deps.cooldown.forget_session(&session);
            deps.registry.forget_session(&session);
            tracing::info!(session = %session, "Session lane closed");
        });

        Ok(LaneHandle { frames: tx })
    }

    pub fn active_sessions(&self) -> usize {
        self.lanes.lock().expect("lanes lock poisoned").len()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.lanes
            .lock()
            .expect("lanes lock poisoned")
            .contains(session_id)
    }
}
