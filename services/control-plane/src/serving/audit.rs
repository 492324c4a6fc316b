//! Audit sinks.
//!
//! The orchestrator emits one event per terminal transition. Emission is
//! fire-and-forget: sinks must not block and must not fail the operation.

use std::sync::Mutex;

use mserve_events::AuditEvent;
use tracing::info;

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Writes audit events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_type = event.event_type(),
            endpoint_id = %event.endpoint_id,
            actor = %event.actor,
            operation = %event.payload.operation,
            error_code = event.payload.error_code.as_deref().unwrap_or(""),
            "Audit event"
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mserve_events::{Actor, AuditOutcome, Operation};
    use mserve_id::EndpointId;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingAuditSink::new();
        let id = EndpointId::new();
        for outcome in [AuditOutcome::Committed, AuditOutcome::Deleted] {
            sink.emit(
                AuditEvent::builder()
                    .endpoint(id)
                    .outcome(outcome)
                    .actor(Actor::user("alice"))
                    .operation(Operation::Redeploy)
                    .build()
                    .unwrap(),
            );
        }

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, AuditOutcome::Committed);
        assert_eq!(events[1].outcome, AuditOutcome::Deleted);
    }
}
