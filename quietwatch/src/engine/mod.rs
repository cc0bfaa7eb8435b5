// quietwatch/src/engine/mod.rs
//
// Orchestration, learning, scoring and output.

pub mod baseline;
pub mod cooldown;
pub mod dispatcher;
pub mod metrics;
pub mod orchestrator;
pub mod quiet_index;

use std::sync::Arc;

use chrono::Duration;

use crate::events::RuleKind;
use crate::state::memory::MemoryStore;
use crate::state::{
    AccountRegistry, BaselineStore, CooldownStore, DetectionStore, EventStore, QuietIndexStore,
};

/// Store handles shared by the engine components.
#[derive(Clone)]
pub struct Stores {
    pub registry: Arc<dyn AccountRegistry>,
    pub events: Arc<dyn EventStore>,
    pub detections: Arc<dyn DetectionStore>,
    pub cooldowns: Arc<dyn CooldownStore>,
    pub baselines: Arc<dyn BaselineStore>,
    pub quiet_index: Arc<dyn QuietIndexStore>,
}

impl Stores {
    /// Every handle backed by the same in-memory store.
    pub fn memory(store: &Arc<MemoryStore>) -> Self {
        Self {
            registry: store.clone(),
            events: store.clone(),
            detections: store.clone(),
            cooldowns: store.clone(),
            baselines: store.clone(),
            quiet_index: store.clone(),
        }
    }
}

/// Widest window any rule asks for, capped at `max`.
pub fn widest_lookback(max: Duration) -> Duration {
    RuleKind::ALL
        .iter()
        .map(|r| r.lookback().min(max))
        .max()
        .unwrap_or(max)
}
