//! Audit sink seam.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

use crate::models::{AuditEvent, AuditEventKind, AuditOutcome};

/// Receives every security-relevant event the gateway emits. Sinks must
/// not fail the calling flow; delivery problems are theirs to handle.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent);
}

/// Default sink: structured log records on the `audit` target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) {
        info!(
            target: "audit",
            event_id = %event.event_id,
            kind = event.kind.as_str(),
            identity_id = event.identity_id.map(|id| id.to_string()).as_deref().unwrap_or("-"),
            session_id = event.session_id.map(|id| id.to_string()).as_deref().unwrap_or("-"),
            ip = event.ip_address.as_deref().unwrap_or("-"),
            outcome = match event.outcome {
                AuditOutcome::Success => "success",
                AuditOutcome::Failure => "failure",
            },
            reason = event.reason.as_deref().unwrap_or("-"),
        );
    }
}

/// Captures events in memory so tests can assert on the trail.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events().into_iter().map(|event| event.kind).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
