//! Per-(session, label) alert cooldown.
//!
//! A persistent object in frame would otherwise raise one alert per frame at
//! capture rate. `admit` is a keyed check-and-set: at most one admission per
//! cooldown window for a given key. The map lock is held across both the
//! check and the update, so two concurrent detections for the same key can
//! never both be admitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct CooldownTable {
    window: Duration,
    entries: Mutex<HashMap<(String, String), Instant>>,
    suppressed: AtomicU64,
}

impl CooldownTable {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns true and records `now` as the last firing time if the key is
    /// outside its cooldown window; otherwise returns false and the caller
    /// drops the candidate event. Suppressions are counted, not logged.
    pub fn admit(&self, session_id: &str, label: &str, now: Instant) -> bool {
        let key = (session_id.to_string(), label.to_lowercase());
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        match entries.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                false
            }
            _ => {
                entries.insert(key, now);
                true
            }
        }
    }

    /// Drop all entries for a torn-down session.
    pub fn forget_session(&self, session_id: &str) {
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        entries.retain(|(sid, _), _| sid != session_id);
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
