//! Journey analytics events: a trait for emitting lifecycle events from the
//! engine and sweeper.
//!
//! Components accept an `Arc<dyn EventSink>`; the embedding service routes
//! events to its analytics pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyEventType {
    SessionStarted,
    SessionCancelled,
    SessionCompleted,
    SessionBroken,
    StepSent,
    AnswerRecorded,
    ReplyReceived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyEvent {
    pub event_id: Uuid,
    pub event_type: JourneyEventType,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub session_id: Uuid,
    pub step_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting journey events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JourneyEvent);
}

/// No-op sink for deployments without an analytics pipeline.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: JourneyEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<JourneyEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<JourneyEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn count_type(&self, event_type: JourneyEventType) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.event_type == event_type).count())
            .unwrap_or(0)
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: JourneyEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Convenience builder for a `JourneyEvent` stamped with the current time.
pub fn make_event(
    event_type: JourneyEventType,
    tenant_id: Uuid,
    workflow_id: Uuid,
    session_id: Uuid,
    step_id: Option<Uuid>,
) -> JourneyEvent {
    JourneyEvent {
        event_id: Uuid::new_v4(),
        event_type,
        tenant_id,
        workflow_id,
        session_id,
        step_id,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
