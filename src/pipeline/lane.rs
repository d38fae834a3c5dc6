//! The per-session processing loop.

use crate::enrich::enrich_event;
use crate::pipeline::{Event, Frame, LaneDeps};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::mpsc;

/// Process one session's frames strictly in arrival order until the queue
/// closes or the sink declares the session fatal. Every failure mode short
/// of pending-buffer overflow drops the offending unit of work and keeps
/// the lane alive.
pub async fn run_lane(session_id: &str, mut frames: mpsc::Receiver<Frame>, deps: &LaneDeps) {
    let counters = &deps.counters;
    let mut last_processed: Option<Instant> = None;

    while let Some(frame) = frames.recv().await {
        counters.frames_ingested.fetch_add(1, Ordering::Relaxed);

        if frame.pixels.is_empty() {
            counters.frames_invalid.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session = %session_id, sequence = frame.sequence, "Dropping empty frame");
            continue;
        }

        // Frame-rate gate: a client pushing at capture rate only gets
        // processed at the configured cadence.
        let now = Instant::now();
        if let Some(last) = last_processed {
            if now.duration_since(last) < deps.min_frame_interval {
                counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }
        last_processed = Some(now);

        // GuardedDetector converts failures into an empty list.
        let detections = match deps.detector.detect(&frame).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Detector error reached lane");
                continue;
            }
        };
        counters
            .detections_seen
            .fetch_add(detections.len() as u64, Ordering::Relaxed);

        for detection in detections {
            let Some(severity) = deps.policy.classify(&detection.label, detection.confidence)
            else {
                counters.detections_discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            if !deps
                .cooldown
                .admit(session_id, &detection.label, Instant::now())
            {
                continue;
            }
            counters.events_admitted.fetch_add(1, Ordering::Relaxed);

            let mut event = Event::new(session_id, &detection.label, detection.confidence, severity);
            event.timestamp = frame.timestamp;

            enrich_event(deps.enricher.as_ref(), deps.enrich_timeout, &mut event).await;
            if event.fallback_diagnosis {
                counters.fallback_diagnoses.fetch_add(1, Ordering::Relaxed);
            }

            let outcome = deps.sink.publish(event).await;
            counters.events_published.fetch_add(1, Ordering::Relaxed);

            if outcome.session_fatal {
                counters.sessions_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    session = %session_id,
                    "Unpersisted event buffer overflowed, halting session"
                );
                return;
            }
        }
    }
}
