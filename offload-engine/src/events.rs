//! Outbound notifications.
//!
//! The engine reports lifecycle events through an [`EventSink`]; the host
//! decides whether they end up in logs, a notification channel or nowhere.

use crate::purge::queue::QueueEntry;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Mutex;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OffloadEvent {
    PurgeCompleted {
        file: String,
        destinations: Vec<String>,
        attempts: u32,
    },
    PurgePermanentFailure {
        file: String,
        entry: QueueEntry,
        errors: Vec<String>,
    },
    StorageUsageWarning {
        destination_id: String,
        ratio: f64,
        used_bytes: u64,
        quota_bytes: u64,
    },
}

impl OffloadEvent {
    /// Dotted event name, e.g. `purge.completed`.
    pub fn name(&self) -> &'static str {
        match self {
            OffloadEvent::PurgeCompleted { .. } => "purge.completed",
            OffloadEvent::PurgePermanentFailure { .. } => "purge.permanent_failure",
            OffloadEvent::StorageUsageWarning { .. } => "storage.usage_warning",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OffloadEvent::PurgeCompleted {
                file,
                destinations,
                attempts,
            } => json!({ "file": file, "destinations": destinations, "attempts": attempts }),
            OffloadEvent::PurgePermanentFailure { file, entry, errors } => {
                json!({ "file": file, "entry": entry, "errors": errors })
            }
            OffloadEvent::StorageUsageWarning {
                destination_id,
                ratio,
                used_bytes,
                quota_bytes,
            } => json!({
                "destination_id": destination_id,
                "ratio": ratio,
                "used_bytes": used_bytes,
                "quota_bytes": quota_bytes,
            }),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: OffloadEvent);
}

/// Fan-out over a tokio broadcast channel. Emitting with no subscribers is fine.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<OffloadEvent>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OffloadEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: OffloadEvent) {
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OffloadEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OffloadEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(OffloadEvent::name).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: OffloadEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastSink::new();
        let mut rx = sink.subscribe();
        sink.emit(OffloadEvent::PurgeCompleted {
            file: "a.zip".into(),
            destinations: vec!["aws_s3".into()],
            attempts: 0,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "purge.completed");
        assert_eq!(event.payload()["destinations"][0], "aws_s3");
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        BroadcastSink::new().emit(OffloadEvent::StorageUsageWarning {
            destination_id: "dropbox".into(),
            ratio: 0.95,
            used_bytes: 95,
            quota_bytes: 100,
        });
    }

    #[test]
    fn test_recording_sink_names() {
        let sink = RecordingSink::new();
        sink.emit(OffloadEvent::StorageUsageWarning {
            destination_id: "dropbox".into(),
            ratio: 0.95,
            used_bytes: 95,
            quota_bytes: 100,
        });
        assert_eq!(sink.names(), vec!["storage.usage_warning"]);
    }
}
