//! Orchestrator event bus: trait for emitting observability events from any
//! module.
//!
//! Components accept an `Arc<dyn EventSink>`; the binary routes events to the
//! structured log, tests capture them in memory.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CampaignTransitioned,
    MessageSent,
    MessageFailed,
    MessagePermanentlyFailed,
    LogWriteFailed,
    LogWriteRecovered,
    PrizeAllocated,
    CouponIssued,
    CouponCancelled,
    CouponExpired,
    ConversionRecorded,
    NotificationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub tenant_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub subject_id: Option<Uuid>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Writes every event to the structured log.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: OrchestratorEvent) {
        tracing::info!(
            event_type = ?event.event_type,
            tenant_id = %event.tenant_id,
            campaign_id = ?event.campaign_id,
            subject_id = ?event.subject_id,
            detail = %event.detail,
            "orchestrator event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<OrchestratorEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<OrchestratorEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: OrchestratorEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating an `OrchestratorEvent`.
pub fn make_event(
    event_type: EventType,
    tenant_id: Uuid,
    campaign_id: Option<Uuid>,
    subject_id: Option<Uuid>,
    detail: impl Into<String>,
) -> OrchestratorEvent {
    OrchestratorEvent {
        event_id: Uuid::new_v4(),
        event_type,
        tenant_id,
        campaign_id,
        subject_id,
        detail: detail.into(),
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
