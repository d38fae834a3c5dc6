//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;

use crate::detect::Severity;
use crate::pipeline::Event;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use uuid::Uuid;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {parent:?}"))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Persist an event. Idempotent on `event_id`: re-publishing the same event
/// never creates a duplicate row.
pub fn save_event(pool: &Pool, event: &Event) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO events (
            event_id, session_id, label, confidence, severity,
            diagnosis, fallback_diagnosis, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(event_id) DO NOTHING",
        rusqlite::params![
            event.event_id.to_string(),
            event.session_id,
            event.label,
            event.confidence,
            event.severity.as_str(),
            event.diagnosis,
            event.fallback_diagnosis as i64,
            event.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Filters for `query_events`. All fields optional; unset means unfiltered.
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub session_id: Option<String>,
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Fetch stored events in timestamp order.
pub fn query_events(pool: &Pool, filter: &EventFilter) -> Result<Vec<Event>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT event_id, session_id, label, confidence, severity,
                diagnosis, fallback_diagnosis, created_at
         FROM events
         WHERE (?1 IS NULL OR session_id = ?1)
           AND (?2 IS NULL OR created_at >= ?2)
           AND (?3 IS NULL OR created_at <= ?3)
         ORDER BY created_at ASC, event_id ASC",
    )?;

    let rows = stmt.query_map(
        rusqlite::params![
            filter.session_id,
            filter.since.map(|t| t.to_rfc3339()),
            filter.until.map(|t| t.to_rfc3339()),
        ],
        row_to_event,
    )?;

    let mut events = Vec::new();
    for row in rows {
        let event = row?;
        if let Some(min) = filter.min_severity {
            if event.severity < min {
                continue;
            }
        }
        events.push(event);
        if let Some(limit) = filter.limit {
            if events.len() >= limit {
                break;
            }
        }
    }
    Ok(events)
}

pub fn count_events(pool: &Pool) -> Result<i64> {
    let conn = pool.get()?;
    let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    Ok(count)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let id_str: String = row.get(0)?;
    let severity_str: String = row.get(4)?;
    let created_at: String = row.get(7)?;

    Ok(Event {
        event_id: Uuid::parse_str(&id_str).unwrap_or_default(),
        session_id: row.get(1)?,
        label: row.get(2)?,
        confidence: row.get(3)?,
        severity: Severity::parse(&severity_str).unwrap_or(Severity::Low),
        diagnosis: row.get(5)?,
        fallback_diagnosis: row.get::<_, i64>(6)? != 0,
        timestamp: DateTime::parse_from_rfc3339(&created_at)
            .unwrap_or_default()
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn test_pool() -> (TempDir, Pool) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        (dir, pool)
    }

    fn event_at(session: &str, label: &str, severity: Severity, secs: i64) -> Event {
        let mut ev = Event::new(session, label, 0.7, severity);
        ev.timestamp = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        ev
    }

    #[test]
    fn test_save_is_idempotent_on_event_id() {
        let (_dir, pool) = test_pool();
        let ev = event_at("cam-1", "scissors", Severity::Critical, 0);

        save_event(&pool, &ev).unwrap();
        save_event(&pool, &ev).unwrap();

        assert_eq!(count_events(&pool).unwrap(), 1);
    }

    #[test]
    fn test_query_orders_by_timestamp() {
        let (_dir, pool) = test_pool();
        let first = event_at("cam-1", "knife", Severity::High, 0);
        let second = event_at("cam-1", "person", Severity::Low, 10);

        // Insert out of order; query must come back in timestamp order.
        save_event(&pool, &second).unwrap();
        save_event(&pool, &first).unwrap();

        let events = query_events(&pool, &EventFilter::default()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, first.event_id);
        assert_eq!(events[1].event_id, second.event_id);
    }

    #[test]
    fn test_query_filters_by_session_and_severity() {
        let (_dir, pool) = test_pool();
        save_event(&pool, &event_at("cam-1", "knife", Severity::Critical, 0)).unwrap();
        save_event(&pool, &event_at("cam-1", "cup", Severity::Low, 1)).unwrap();
        save_event(&pool, &event_at("cam-2", "gun", Severity::Critical, 2)).unwrap();

        let filter = EventFilter {
            session_id: Some("cam-1".to_string()),
            min_severity: Some(Severity::High),
            ..Default::default()
        };
        let events = query_events(&pool, &filter).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label, "knife");
    }

    #[test]
    fn test_query_respects_limit_and_since() {
        let (_dir, pool) = test_pool();
        for i in 0..5 {
            save_event(&pool, &event_at("cam-1", "person", Severity::Low, i)).unwrap();
        }

        let filter = EventFilter {
            since: Some(Utc.timestamp_opt(1_700_000_002, 0).unwrap()),
            limit: Some(2),
            ..Default::default()
        };
        let events = query_events(&pool, &filter).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let (_dir, pool) = test_pool();
        let mut ev = event_at("cam-9", "scissors", Severity::Critical, 0);
        ev.diagnosis = Some("sharp object near the counter".to_string());
        ev.fallback_diagnosis = true;
        save_event(&pool, &ev).unwrap();

        let events = query_events(&pool, &EventFilter::default()).unwrap();
        assert_eq!(events[0].event_id, ev.event_id);
        assert_eq!(events[0].diagnosis, ev.diagnosis);
        assert!(events[0].fallback_diagnosis);
        assert_eq!(events[0].severity, Severity::Critical);
    }
}
