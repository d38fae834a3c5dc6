//! Startup configuration -- TOML file, serde defaults, fatal validation.
//!
//! Everything tunable about the pipeline lives here: severity thresholds,
//! the dangerous-label set, the cooldown window, and the optional external
//! capabilities (detector service, LLM diagnosis, webhook notifier).
//! Optional capabilities are resolved once at startup into explicit
//! variants; nothing later in the pipeline inspects the environment.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub severity: SeverityConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub diagnosis: DiagnosisConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Max events held in memory while the store is unreachable.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Base URL of the external detection service. None disables detection
    /// entirely (every frame yields zero detections).
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default = "default_detector_timeout")]
    pub timeout_secs: u64,
    /// Confidence floor passed to the model service itself.
    #[serde(default = "default_request_confidence")]
    pub request_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityConfig {
    /// Non-dangerous detections below this are discarded, not classified.
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    /// Non-dangerous detections at/above this are Medium instead of Low.
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
    /// Dangerous detections at/above this are Critical instead of High.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_dangerous_labels")]
    pub dangerous_labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// Minimum seconds between two admitted events for one (session, label).
    #[serde(default = "default_cooldown_window")]
    pub window_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Frames arriving closer together than this are skipped (per session).
    #[serde(default = "default_min_frame_interval")]
    pub min_frame_interval_ms: u64,
    /// Depth of the per-session frame queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisConfig {
    /// Messages endpoint of the text-generation service.
    #[serde(default = "default_diagnosis_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_diagnosis_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifierConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_db_path() -> String {
    "data/safeguard.db".to_string()
}
fn default_pending_limit() -> usize {
    256
}
fn default_detector_timeout() -> u64 {
    5
}
fn default_request_confidence() -> f64 {
    // Matches low_threshold: detections the classifier would discard are
    // never requested from the model service in the first place.
    0.4
}
fn default_low_threshold() -> f64 {
    0.4
}
fn default_medium_threshold() -> f64 {
    0.8
}
fn default_high_threshold() -> f64 {
    0.5
}
fn default_dangerous_labels() -> Vec<String> {
    [
        "knife",
        "scissors",
        "gun",
        "rifle",
        "baseball bat",
        "fire",
        "flame",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_cooldown_window() -> f64 {
    3.0
}
fn default_min_frame_interval() -> u64 {
    100
}
fn default_queue_depth() -> usize {
    8
}
fn default_diagnosis_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}
fn default_diagnosis_timeout() -> u64 {
    5
}
fn default_max_tokens() -> u32 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pending_limit: default_pending_limit(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            timeout_secs: default_detector_timeout(),
            request_confidence: default_request_confidence(),
        }
    }
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            low_threshold: default_low_threshold(),
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
            dangerous_labels: default_dangerous_labels(),
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            window_secs: default_cooldown_window(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_frame_interval_ms: default_min_frame_interval(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            api_url: default_diagnosis_url(),
            api_key: None,
            model: None,
            timeout_secs: default_diagnosis_timeout(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Config {
    /// Load config from a TOML file. A missing file yields the defaults,
    /// which still go through validation.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config = if Path::new(path).exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?
        } else {
            tracing::info!(%path, "Config file not found, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the resolved config. Failures here are fatal at startup;
    /// the pipeline refuses to accept frames with a broken policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.severity;
        for (name, v) in [
            ("severity.low_threshold", s.low_threshold),
            ("severity.medium_threshold", s.medium_threshold),
            ("severity.high_threshold", s.high_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {v}"
                )));
            }
        }
        if s.low_threshold > s.medium_threshold {
            return Err(ConfigError::Invalid(format!(
                "severity.low_threshold ({}) must not exceed severity.medium_threshold ({})",
                s.low_threshold, s.medium_threshold
            )));
        }
        if s.dangerous_labels.is_empty() {
            return Err(ConfigError::Invalid(
                "severity.dangerous_labels must not be empty".to_string(),
            ));
        }
        if self.cooldown.window_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cooldown.window_secs must be positive, got {}",
                self.cooldown.window_secs
            )));
        }
        if self.storage.pending_limit == 0 {
            return Err(ConfigError::Invalid(
                "storage.pending_limit must be at least 1".to_string(),
            ));
        }
        if self.ingest.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "ingest.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.diagnosis.api_key.is_some() && self.diagnosis.model.is_none() {
            return Err(ConfigError::Invalid(
                "diagnosis.model is required when diagnosis.api_key is set".to_string(),
            ));
        }
        if self.notifier.webhook_url.is_some() && self.notifier.recipient.is_none() {
            return Err(ConfigError::Invalid(
                "notifier.recipient is required when notifier.webhook_url is set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dangerous_label_set(&self) -> HashSet<String> {
        self.severity
            .dangerous_labels
            .iter()
            .map(|l| l.to_lowercase())
            .collect()
    }

    pub fn cooldown_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.cooldown.window_secs)
    }
}
