//! Per-session live subscriber channels.
//!
//! Each session gets its own `tokio::sync::broadcast` channel. Subscribers
//! join and leave at any time; a slow subscriber lags and skips events on
//! its own receiver without blocking the lane or other subscribers.

use crate::pipeline::Event;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

pub struct SessionRegistry {
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a session's event stream, creating the channel if this
    /// is the first subscriber.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Event> {
        let mut channels = self.channels.lock().expect("registry lock poisoned");
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Push an event to all live subscribers of its session. Returns the
    /// number of subscribers that received it; zero subscribers is normal,
    /// not an error.
    pub fn publish(&self, event: &Event) -> usize {
        let mut channels = self.channels.lock().expect("registry lock poisoned");
        match channels.get(&event.session_id) {
            Some(sender) => match sender.send(event.clone()) {
                Ok(n) => n,
                Err(_) => {
                    // Last subscriber left between lookups; prune the channel.
                    channels.remove(&event.session_id);
                    0
                }
            },
            None => 0,
        }
    }

    /// Remove a session's channel once the session is torn down.
    pub fn forget_session(&self, session_id: &str) {
        let mut channels = self.channels.lock().expect("registry lock poisoned");
        channels.remove(session_id);
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let channels = self.channels.lock().expect("registry lock poisoned");
        channels
            .get(session_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
