//! Alert notification over an external channel.
//!
//! `notify` returns plain success/failure; a failed delivery is logged by
//! the caller and never re-processes the event or halts the pipeline.
//! Which notifier runs is resolved once at startup from config.

use crate::config::NotifierConfig;
use crate::pipeline::Event;
use serde_json::json;

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert for the event. Returns false on any failure.
    async fn notify(&self, event: &Event) -> bool;
}

/// Resolve the configured notifier variant.
pub fn from_config(config: &NotifierConfig) -> Box<dyn Notifier> {
    match (&config.webhook_url, &config.recipient) {
        (Some(url), Some(recipient)) => {
            tracing::info!(%recipient, "Alert notifications enabled");
            Box::new(WebhookNotifier::new(url, recipient))
        }
        _ => {
            tracing::info!("Alert notifications disabled");
            Box::new(NullNotifier)
        }
    }
}

/// Human-readable alert message, subject + body.
pub fn format_alert(event: &Event) -> (String, String) {
    let subject = format!(
        "SafeGuard alert: {} ({})",
        event.label.to_uppercase(),
        event.severity
    );
    let diagnosis = event
        .diagnosis
        .as_deref()
        .unwrap_or("no diagnosis available");
    let body = format!(
        "{} DETECTED\n\n\
         {}\n\n\
         Details:\n\
         - Severity: {}\n\
         - Confidence: {:.1}%\n\
         - Session: {}\n\
         - Time: {}\n\n\
         This is an automated alert from SafeGuard.",
        event.label.to_uppercase(),
        diagnosis,
        event.severity.as_str().to_uppercase(),
        event.confidence * 100.0,
        event.session_id,
        event.timestamp.to_rfc3339(),
    );
    (subject, body)
}

/// Delivers alerts as JSON to a webhook endpoint (mail relay, chat bridge,
/// pager -- whatever sits behind the URL).
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    recipient: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, recipient: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            url: url.to_string(),
            recipient: recipient.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &Event) -> bool {
        let (subject, body) = format_alert(event);
        let payload = json!({
            "recipient": self.recipient,
            "subject": subject,
            "body": body,
            "event_id": event.event_id,
            "severity": event.severity,
        });

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(event_id = %event.event_id, "Alert delivered");
                true
            }
            Ok(response) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    status = %response.status(),
                    "Alert delivery rejected"
                );
                false
            }
            Err(e) => {
                tracing::warn!(event_id = %event.event_id, error = %e, "Alert delivery failed");
                false
            }
        }
    }
}

/// Explicit "no notification channel configured" variant.
pub struct NullNotifier;

#[async_trait::async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, event: &Event) -> bool {
        tracing::debug!(event_id = %event.event_id, "Notifier disabled, alert skipped");
        true
    }
}
