//! Detector adapter -- boundary to the external object-detection model.
//!
//! The model itself is a black box behind an HTTP sidecar service; the
//! adapter only cares about the wire shape. `GuardedDetector` enforces the
//! pipeline contract: a detector failure yields an empty detection list and
//! an error counter bump, never a crashed ingest lane.

use crate::detect::{BoundingBox, DetectError, Detection};
use crate::pipeline::Frame;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait::async_trait]
pub trait Detector: Send + Sync {
    /// Run detection on one frame. An empty list means nothing was found.
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError>;
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    session_id: &'a str,
    frame: String,
    min_confidence: f64,
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<WireDetection>,
}

#[derive(Deserialize)]
struct WireDetection {
    label: String,
    confidence: f64,
    #[serde(rename = "box")]
    bbox: [f32; 4],
}

/// HTTP client for the external detection service.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    min_confidence: f64,
}

impl HttpDetector {
    pub fn new(service_url: &str, timeout: Duration, min_confidence: f64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to build HTTP client"),
            url: format!("{}/detect", service_url.trim_end_matches('/')),
            min_confidence,
        }
    }
}

#[async_trait::async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        if frame.pixels.is_empty() {
            return Err(DetectError::EmptyFrame);
        }

        let request = DetectRequest {
            session_id: &frame.session_id,
            frame: base64::engine::general_purpose::STANDARD.encode(&frame.pixels),
            min_confidence: self.min_confidence,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let parsed: DetectResponse = response.json().await?;
        Ok(parsed
            .detections
            .into_iter()
            .map(|d| Detection {
                label: d.label,
                confidence: d.confidence,
                bbox: BoundingBox {
                    x: d.bbox[0],
                    y: d.bbox[1],
                    w: d.bbox[2],
                    h: d.bbox[3],
                },
            })
            .collect())
    }
}

/// Wraps any detector with the pipeline's failure contract: errors are
/// swallowed into an empty result and counted, and detections with a
/// confidence outside [0, 1] are dropped as malformed.
pub struct GuardedDetector<D> {
    inner: D,
    errors: AtomicU64,
    rejected: AtomicU64,
}

impl<D> GuardedDetector<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            errors: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl<D: Detector> Detector for GuardedDetector<D> {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        match self.inner.detect(frame).await {
            Ok(detections) => {
                let valid: Vec<Detection> = detections
                    .into_iter()
                    .filter(|d| {
                        let ok = (0.0..=1.0).contains(&d.confidence);
                        if !ok {
                            self.rejected.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                label = %d.label,
                                confidence = d.confidence,
                                "Dropping detection with out-of-range confidence"
                            );
                        }
                        ok
                    })
                    .collect();
                Ok(valid)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session = %frame.session_id, error = %e, "Detector call failed");
                Ok(Vec::new())
            }
        }
    }
}

/// Detector that replays a script of responses, one per frame. Used when no
/// service is configured (always empty) and by tests.
#[derive(Default)]
pub struct StaticDetector {
    script: Mutex<std::collections::VecDeque<Vec<Detection>>>,
}

impl StaticDetector {
    /// A detector that never finds anything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<Vec<Detection>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait::async_trait]
impl Detector for StaticDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        if frame.pixels.is_empty() {
            return Err(DetectError::EmptyFrame);
        }
        let mut script = self.script.lock().expect("script lock poisoned");
        Ok(script.pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Frame;

    struct FailingDetector;

    #[async_trait::async_trait]
    impl Detector for FailingDetector {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, DetectError> {
            Err(DetectError::EmptyFrame)
        }
    }

    fn frame() -> Frame {
        Frame::new("cam-1", 0, vec![0xff, 0xd8, 0xff])
    }

    fn det(label: &str, confidence: f64) -> Detection {
        Detection {
            label: label.to_string(),
            confidence,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                w: 10.0,
                h: 10.0,
            },
        }
    }

    #[tokio::test]
    async fn test_guarded_swallows_errors() {
        let d = GuardedDetector::new(FailingDetector);
        let out = d.detect(&frame()).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(d.error_count(), 1);
    }

    #[tokio::test]
    async fn test_guarded_drops_malformed_confidence() {
        let d = GuardedDetector::new(StaticDetector::with_script(vec![vec![
            det("person", 0.9),
            det("ghost", 1.7),
            det("shadow", -0.1),
        ]]));
        let out = d.detect(&frame()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "person");
        assert_eq!(d.rejected_count(), 2);
    }

    #[tokio::test]
    async fn test_static_detector_replays_script_then_empties() {
        let d = StaticDetector::with_script(vec![vec![det("knife", 0.8)]]);
        assert_eq!(d.detect(&frame()).await.unwrap().len(), 1);
        assert!(d.detect(&frame()).await.unwrap().is_empty());
    }
}
