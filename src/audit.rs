/// Audit collaborator interface.
///
/// Sinks are fire-and-forget: `record` cannot fail and must not block, so a
/// broken audit pipeline never stops a cryptographic operation.
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pq::{Algorithm, Implementation};

/// Security-relevant events emitted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    DeviceRegistered {
        user_id: String,
        device_id: String,
        implementation: Implementation,
    },
    MasterKeyWrapped {
        device_id: String,
    },
    MasterKeyUnwrapped {
        device_id: String,
        success: bool,
    },
    DeviceRevoked {
        device_id: String,
    },
    RecoveryKitCreated {
        kit_id: Uuid,
        shares_total: u8,
        shares_required: u8,
    },
    RecoveryKitDistributed {
        kit_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    RecoveryAttempt {
        kit_id: Uuid,
        success: bool,
        valid_shares: usize,
        rejected_shares: usize,
        reason: Option<String>,
    },
    RecoveryKitRevoked {
        kit_id: Uuid,
    },
    RecoveryKitExpired {
        kit_id: Uuid,
    },
    CapabilityFallback {
        algorithm: Algorithm,
        reason: String,
    },
}

/// Event sink. Implementations must return promptly and swallow their own errors.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "audit", event = %json, "audit"),
            Err(e) => debug!(target: "audit", error = %e, "Unserializable audit event dropped"),
        }
    }
}

/// Forwards events to an async consumer over a bounded channel.
///
/// When the channel is full or closed the event is dropped.
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!(target: "audit", error = %e, "Audit channel unavailable, event dropped");
        }
    }
}

/// Keeps every event in memory. Useful for embedding applications and tests.
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
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
