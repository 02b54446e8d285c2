use offload_engine::{BroadcastSink, OffloadEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Write every engine event to the log. Notification delivery hangs off the same channel.
pub fn start_event_logger(events: &BroadcastSink, cancel: CancellationToken) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event logger lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::info!("Event logger stopped");
    });
}

fn log_event(event: &OffloadEvent) {
    let payload = event.payload();
    match event {
        OffloadEvent::PurgePermanentFailure { file, errors, .. } => {
            tracing::error!(event = event.name(), file = %file, errors = ?errors, "Remote purge gave up");
        }
        OffloadEvent::StorageUsageWarning { destination_id, ratio, .. } => {
            tracing::warn!(event = event.name(), destination = %destination_id, ratio, "Remote storage usage warning");
        }
        OffloadEvent::PurgeCompleted { .. } => {
            tracing::info!(event = event.name(), payload = %payload, "Remote purge completed");
        }
    }
}
