use crate::detect::cooldown::CooldownTable;
use crate::pipeline::{PipelineCounters, SessionManager};
use crate::sink::broadcast::SessionRegistry;
use crate::sink::EventSink;
use crate::storage::Pool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub manager: Arc<SessionManager>,
    pub registry: Arc<SessionRegistry>,
    pub sink: Arc<EventSink>,
    pub cooldown: Arc<CooldownTable>,
    pub counters: Arc<PipelineCounters>,
}
