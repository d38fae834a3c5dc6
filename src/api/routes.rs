//! API route definitions.

use crate::api::state::AppState;
use crate::detect::Severity;
use crate::storage::{self, EventFilter};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(list_events))
        .route("/status", get(status))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    session_id: Option<String>,
    min_severity: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let min_severity = match query.min_severity.as_deref() {
        None => None,
        Some(raw) => Some(Severity::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown severity '{raw}'") })),
            )
        })?),
    };

    let filter = EventFilter {
        session_id: query.session_id,
        min_severity,
        since: query.since,
        until: query.until,
        limit: Some(query.limit.unwrap_or(100).min(1000)),
    };

    let events = storage::query_events(&state.pool, &filter).map_err(|e| {
        tracing::error!(error = %e, "Event query failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "event query failed" })),
        )
    })?;

    let total = events.len();
    Ok(Json(json!({
        "data": events,
        "meta": { "total": total }
    })))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let counters = state.counters.snapshot(&state.cooldown);
    Json(json!({
        "data": {
            "active_sessions": state.manager.active_sessions(),
            "pipeline": counters,
            "store": {
                "pending_events": state.sink.pending_len(),
                "store_failures": state.sink.store_failure_count(),
                "dropped_events": state.sink.dropped_event_count(),
                "alerts_failed": state.sink.alerts_failed_count(),
            }
        },
        "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}
