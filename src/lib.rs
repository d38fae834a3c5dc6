//! SafeGuard -- real-time threat detection and alert pipeline for live
//! video streams.
//!
//! This crate provides the core library for frame ingest, detection via an
//! external model service, severity classification, alert cooldown,
//! LLM-backed diagnosis enrichment, and fan-out to storage, live
//! subscribers, and a notification channel.

pub mod api;
pub mod config;
pub mod detect;
pub mod enrich;
pub mod notify;
pub mod pipeline;
pub mod sink;
pub mod storage;

use crate::api::state::AppState;
use crate::config::Config;
use crate::detect::adapter::{Detector, GuardedDetector, HttpDetector, StaticDetector};
use crate::detect::classify::SeverityPolicy;
use crate::detect::cooldown::CooldownTable;
use crate::pipeline::{LaneDeps, PipelineCounters, SessionManager};
use crate::sink::broadcast::SessionRegistry;
use crate::sink::{EventSink, SqliteEventStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Assemble the full pipeline from validated config and an open pool.
/// Capability variants (detector service, LLM diagnosis, webhook notifier)
/// are resolved here, once, and logged.
pub fn build_state(config: &Config, pool: storage::Pool) -> AppState {
    let detector: Arc<dyn Detector> = match &config.detector.service_url {
        Some(url) => {
            tracing::info!(%url, "Detection service configured");
            Arc::new(GuardedDetector::new(HttpDetector::new(
                url,
                Duration::from_secs(config.detector.timeout_secs),
                config.detector.request_confidence,
            )))
        }
        None => {
            tracing::warn!("No detection service configured, frames will yield no detections");
            Arc::new(GuardedDetector::new(StaticDetector::empty()))
        }
    };

    let cooldown = Arc::new(CooldownTable::new(config.cooldown_window()));
    let registry = Arc::new(SessionRegistry::new());
    let counters = Arc::new(PipelineCounters::default());

    let sink = Arc::new(EventSink::new(
        Arc::new(SqliteEventStore::new(pool.clone())),
        registry.clone(),
        notify::from_config(&config.notifier).into(),
        config.storage.pending_limit,
    ));

    let deps = Arc::new(LaneDeps {
        detector,
        policy: SeverityPolicy::new(&config.severity),
        cooldown: cooldown.clone(),
        enricher: enrich::from_config(&config.diagnosis).into(),
        enrich_timeout: Duration::from_secs(config.diagnosis.timeout_secs),
        sink: sink.clone(),
        registry: registry.clone(),
        counters: counters.clone(),
        min_frame_interval: Duration::from_millis(config.ingest.min_frame_interval_ms),
    });

    let manager = Arc::new(SessionManager::new(deps, config.ingest.queue_depth));

    AppState {
        pool,
        manager,
        registry,
        sink,
        cooldown,
        counters,
    }
}

/// Start the SafeGuard daemon: API server plus the detection pipeline.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Storage
    tracing::info!(db_path = %config.storage.db_path, "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    // 2. Pipeline + shared state
    let state = build_state(&config, pool);

    // 3. API server (frame ingest and event watch ride the same listener)
    let addr: std::net::SocketAddr = config.server.bind.parse()?;
    let app = api::router(state);

    tracing::info!(%addr, "SafeGuard listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
