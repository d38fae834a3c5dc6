//! Diagnosis enrichment -- attaches a natural-language explanation to events.
//!
//! The external text-generation call is bounded by a timeout and can only
//! ever degrade an event to the templated fallback, never drop it. Which
//! enricher runs is decided once at startup: a configured API key resolves
//! to `LlmEnricher`, anything else to `NullEnricher`.

use crate::config::DiagnosisConfig;
use crate::detect::Severity;
use crate::pipeline::Event;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[async_trait::async_trait]
pub trait Enricher: Send + Sync {
    /// Produce a 1-2 sentence assessment of the detection.
    async fn diagnose(&self, label: &str, severity: Severity, confidence: f64) -> Result<String>;
}

/// Deterministic template used for Low-severity events and for any
/// enrichment failure.
pub fn fallback_template(label: &str, severity: Severity) -> String {
    format!("{label} detected with {severity} severity")
}

/// Resolve the configured enricher variant. Logged so runtime behavior is
/// evident from startup output rather than inferred from the environment.
pub fn from_config(config: &DiagnosisConfig) -> Box<dyn Enricher> {
    match (&config.api_key, &config.model) {
        (Some(key), Some(model)) => {
            tracing::info!(%model, "Diagnosis enrichment enabled");
            Box::new(LlmEnricher::new(
                &config.api_url,
                key,
                model,
                config.max_tokens,
            ))
        }
        _ => {
            tracing::info!("Diagnosis enrichment disabled, events get templated diagnoses");
            Box::new(NullEnricher)
        }
    }
}

/// Attach a diagnosis to the event in place.
///
/// Low-severity events always get the template without an external call.
/// Everything else goes through the enricher under `timeout`; on any
/// failure the template is used and the fallback flag records it.
pub async fn enrich_event(enricher: &dyn Enricher, timeout: Duration, event: &mut Event) {
    if event.severity == Severity::Low {
        event.diagnosis = Some(fallback_template(&event.label, event.severity));
        event.fallback_diagnosis = true;
        return;
    }

    let call = enricher.diagnose(&event.label, event.severity, event.confidence);
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(text)) => {
            event.diagnosis = Some(text);
            event.fallback_diagnosis = false;
        }
        Ok(Err(e)) => {
            tracing::warn!(event_id = %event.event_id, error = %e, "Diagnosis call failed, using fallback");
            event.diagnosis = Some(fallback_template(&event.label, event.severity));
            event.fallback_diagnosis = true;
        }
        Err(_) => {
            tracing::warn!(event_id = %event.event_id, timeout_secs = timeout.as_secs(), "Diagnosis call timed out, using fallback");
            event.diagnosis = Some(fallback_template(&event.label, event.severity));
            event.fallback_diagnosis = true;
        }
    }
}

/// Claude-style messages API client.
pub struct LlmEnricher {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl LlmEnricher {
    pub fn new(api_url: &str, api_key: &str, model: &str, max_tokens: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
        }
    }

    fn prompt(label: &str, severity: Severity, confidence: f64) -> String {
        format!(
            "A video monitoring system detected: {label} \
             (severity: {severity}, confidence: {:.0}%).\n\
             In 1-2 sentences, assess whether this is a genuine safety \
             concern and what the operator should do. Respond with plain \
             text only.",
            confidence * 100.0
        )
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[async_trait::async_trait]
impl Enricher for LlmEnricher {
    async fn diagnose(&self, label: &str, severity: Severity, confidence: f64) -> Result<String> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![json!({
                "role": "user",
                "content": Self::prompt(label, severity, confidence),
            })],
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .context("diagnosis request failed")?
            .error_for_status()
            .context("diagnosis service returned an error status")?;

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("malformed diagnosis response")?;

        let text = parsed
            .content
            .first()
            .map(|b| b.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("diagnosis response contained no text"))?;

        Ok(text)
    }
}

/// Explicit "no diagnosis configured" variant.
pub struct NullEnricher;

#[async_trait::async_trait]
impl Enricher for NullEnricher {
    async fn diagnose(&self, _label: &str, _severity: Severity, _confidence: f64) -> Result<String> {
        Err(anyhow!("diagnosis enrichment is disabled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Event;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingEnricher {
        calls: AtomicU64,
    }

    #[async_trait::async_trait]
    impl Enricher for CountingEnricher {
        async fn diagnose(&self, label: &str, _s: Severity, _c: f64) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("assessment of {label}"))
        }
    }

    struct HangingEnricher;

    #[async_trait::async_trait]
    impl Enricher for HangingEnricher {
        async fn diagnose(&self, _l: &str, _s: Severity, _c: f64) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    fn event(severity: Severity) -> Event {
        Event::new("cam-1", "scissors", 0.6, severity)
    }

    #[test]
    fn test_fallback_template_shape() {
        assert_eq!(
            fallback_template("scissors", Severity::Critical),
            "scissors detected with critical severity"
        );
    }

    #[tokio::test]
    async fn test_low_severity_skips_external_call() {
        let enricher = CountingEnricher {
            calls: AtomicU64::new(0),
        };
        let mut ev = event(Severity::Low);
        ev.label = "cell phone".to_string();
        enrich_event(&enricher, Duration::from_secs(5), &mut ev).await;

        assert_eq!(enricher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            ev.diagnosis.as_deref(),
            Some("cell phone detected with low severity")
        );
        assert!(ev.fallback_diagnosis);
    }

    #[tokio::test]
    async fn test_successful_enrichment_clears_fallback_flag() {
        let enricher = CountingEnricher {
            calls: AtomicU64::new(0),
        };
        let mut ev = event(Severity::Critical);
        enrich_event(&enricher, Duration::from_secs(5), &mut ev).await;

        assert_eq!(ev.diagnosis.as_deref(), Some("assessment of scissors"));
        assert!(!ev.fallback_diagnosis);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_without_dropping_event() {
        let mut ev = event(Severity::Critical);
        enrich_event(&HangingEnricher, Duration::from_secs(5), &mut ev).await;

        assert_eq!(
            ev.diagnosis.as_deref(),
            Some("scissors detected with critical severity")
        );
        assert!(ev.fallback_diagnosis);
    }

    #[tokio::test]
    async fn test_null_enricher_yields_fallback() {
        let mut ev = event(Severity::High);
        enrich_event(&NullEnricher, Duration::from_secs(5), &mut ev).await;
        assert!(ev.fallback_diagnosis);
        assert!(ev.diagnosis.is_some());
    }
}
