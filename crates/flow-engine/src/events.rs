//! Engine event stream
//!
//! The executor reports frame progress through an [`EventSink`] so a UI
//! can mirror execution without polling. Sinks must not block; a slow
//! consumer should buffer internally.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::FrameStats;

/// Failure to deliver an event to a sink
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event channel closed")]
    Closed,
    #[error("event sink error: {0}")]
    Sink(String),
}

/// Events emitted during frame execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    FrameStarted { execution_id: String },
    #[serde(rename_all = "camelCase")]
    OperatorCompleted { operator: String, duration_ms: u64 },
    #[serde(rename_all = "camelCase")]
    OperatorFailed { operator: String, message: String },
    #[serde(rename_all = "camelCase")]
    LoopPassCompleted { end_operator: String, items: usize },
    #[serde(rename_all = "camelCase")]
    FrameCompleted {
        execution_id: String,
        stats: FrameStats,
    },
}

/// Consumer of engine events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent) -> Result<(), EventError>;
}

/// Sink that discards every event
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Sink that records events in memory, for tests
#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: EngineEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}
