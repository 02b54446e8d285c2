//! Durable purge queue worker.
//!
//! Each pass takes the task lock, snapshots the manifest, tries every due
//! entry against its destinations in order (extending the lock after each
//! one), then folds the outcomes into a freshly loaded manifest and saves
//! once before publishing events and SLA metrics. Per-destination errors are
//! folded into the entry; only host persistence errors fail a pass.

pub mod backoff;
pub mod queue;
pub mod sla;

use crate::config::PurgeConfig;
use crate::events::{EventSink, OffloadEvent};
use crate::host::{Clock, HostStore};
use crate::lock::{LockGuard, TaskLock};
use crate::manifest::ManifestStore;
use crate::registry::DestinationRegistry;
use crate::Result;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use backoff::BackoffPolicy;
pub use queue::{QueueEntry, QueueStatus};
pub use sla::{Forecast, SlaMetrics, SlaTracker};

/// Hook name the host fires to run a pass.
pub const PURGE_TICK_HOOK: &str = "offload_purge_tick";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub skipped_locked: bool,
    pub processed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Pending and retry entries left after the pass
    pub remaining: usize,
}

/// Outcome of one delete attempt across all of an entry's destinations.
struct Attempt {
    errors: Vec<String>,
    permanent: bool,
}

pub struct PurgeWorker {
    store: Arc<dyn HostStore>,
    manifest: ManifestStore,
    registry: Arc<DestinationRegistry>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    lock: TaskLock,
    sla: SlaTracker,
    backoff: BackoffPolicy,
    max_attempts: u32,
}

impl PurgeWorker {
    pub fn new(
        store: Arc<dyn HostStore>,
        registry: Arc<DestinationRegistry>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        config: &PurgeConfig,
    ) -> Self {
        Self {
            manifest: ManifestStore::new(store.clone()),
            lock: TaskLock::new(store.clone(), config.lock_ttl_secs),
            sla: SlaTracker::new(store.clone(), config.history_limit, config.forecast_window),
            backoff: BackoffPolicy::from_config(config),
            max_attempts: config.max_attempts.max(1),
            store,
            registry,
            clock,
            events,
        }
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// Run one pass. A held lock makes this a no-op.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let now = self.clock.now();
        let Some(guard) = self.lock.try_acquire(now).await? else {
            info!("Purge pass skipped, another invocation holds the task lock");
            return Ok(PassReport {
                skipped_locked: true,
                ..PassReport::default()
            });
        };

        let result = self.drain(&guard, now).await;

        if let Err(e) = self.lock.release(guard).await {
            warn!(error = %e, "Failed to release task lock");
        }
        result
    }

    async fn drain(&self, guard: &LockGuard, now: i64) -> Result<PassReport> {
        let snapshot = self.manifest.load().await?;
        let mut report = PassReport::default();
        let mut events = Vec::new();
        let mut completed = Vec::new();
        let mut attempted = Vec::new();

        for mut entry in snapshot.remote_purge_queue.into_iter().filter(|e| e.is_due(now)) {
            report.processed += 1;

            let attempt = self.attempt(&entry).await;
            if attempt.errors.is_empty() {
                entry.mark_completed(now);
                info!(file = %entry.file, attempts = entry.attempts, "Remote purge completed");
                events.push(OffloadEvent::PurgeCompleted {
                    file: entry.file.clone(),
                    destinations: entry.destinations.clone(),
                    attempts: entry.attempts,
                });
                completed.push(entry.clone());
                report.completed += 1;
            } else {
                entry.record_failure(attempt.errors, now, &self.backoff, self.max_attempts, attempt.permanent);
                if entry.status == QueueStatus::Failed {
                    warn!(
                        file = %entry.file,
                        attempts = entry.attempts,
                        last_error = %entry.last_error,
                        "Remote purge failed permanently"
                    );
                    events.push(OffloadEvent::PurgePermanentFailure {
                        file: entry.file.clone(),
                        entry: entry.clone(),
                        errors: entry.errors.clone(),
                    });
                    report.failed += 1;
                } else {
                    info!(
                        file = %entry.file,
                        attempts = entry.attempts,
                        next_attempt_at = entry.next_attempt_at,
                        last_error = %entry.last_error,
                        "Remote purge will be retried"
                    );
                    report.retried += 1;
                }
            }
            attempted.push(entry);

            match self.lock.refresh(guard, self.clock.now()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Task lock lost mid-pass, leaving remaining entries for the next pass");
                    break;
                }
                Err(e) => warn!(error = %e, "Failed to refresh task lock"),
            }
        }

        // Other writers (registrations, backup rotation) may have saved while
        // the deletes were in flight, so outcomes go onto a fresh copy.
        let queue = if attempted.is_empty() {
            self.manifest.load().await?.remote_purge_queue
        } else {
            self.manifest
                .update(move |fresh| {
                    fresh.apply_attempts(attempted);
                    fresh.remote_purge_queue.clone()
                })
                .await?
        };
        report.remaining = queue.iter().filter(|e| e.status.is_active()).count();

        for event in events {
            self.events.emit(event);
        }

        self.sla.update(&completed, &queue, now).await;

        let next_retry = queue
            .iter()
            .filter(|e| e.status == QueueStatus::Retry)
            .map(|e| e.next_attempt_at)
            .min();
        if let Some(run_at) = next_retry {
            if let Err(e) = self.store.schedule_once(run_at, PURGE_TICK_HOOK, json!({})).await {
                warn!(error = %e, run_at, "Failed to schedule next purge tick");
            }
        }

        debug!(?report, "Purge pass finished");
        Ok(report)
    }

    /// Delete `entry.file` from every destination, collecting `"{id}: {message}"` errors.
    async fn attempt(&self, entry: &QueueEntry) -> Attempt {
        let mut attempt = Attempt {
            errors: Vec::new(),
            permanent: false,
        };

        for id in &entry.destinations {
            let destination = match self.registry.resolve(id) {
                Ok(d) => d,
                Err(e) => {
                    attempt.permanent |= e.is_permanent();
                    attempt.errors.push(format!("{id}: {e}"));
                    continue;
                }
            };

            match destination.delete_remote_backup_by_name(&entry.file).await {
                Ok(outcome) if outcome.success => {
                    debug!(
                        file = %entry.file,
                        destination = %id,
                        message = %outcome.message,
                        used_bytes = ?outcome.quota.as_ref().map(|q| q.used_bytes),
                        "Remote delete ok"
                    );
                }
                Ok(outcome) => attempt.errors.push(format!("{id}: {}", outcome.message)),
                Err(e) => {
                    warn!(file = %entry.file, destination = %id, error = %e, "Remote delete failed");
                    attempt.permanent |= e.is_permanent();
                    attempt.errors.push(format!("{id}: {e}"));
                }
            }
        }
        attempt
    }

    /// Queue `file` for removal from `destinations`.
    pub async fn register(&self, file: &str, destinations: &[String]) -> Result<bool> {
        self.manifest
            .register_purge(file, destinations, self.clock.now())
            .await
    }

    /// Operator retry: reset the entry so the next pass picks it up.
    pub async fn retry(&self, file: &str) -> Result<bool> {
        let now = self.clock.now();
        let guard = self.lock.acquire(now).await?;
        let result = self
            .manifest
            .update(|m| match m.queue_entry_mut(file) {
                Some(entry) => {
                    entry.reset(now);
                    true
                }
                None => false,
            })
            .await;
        self.lock.release(guard).await?;
        let found = result?;
        if found {
            info!(file = %file, "Purge entry reset for retry");
            if let Err(e) = self.store.schedule_once(now, PURGE_TICK_HOOK, json!({})).await {
                warn!(error = %e, "Failed to schedule purge tick");
            }
        }
        Ok(found)
    }

    /// Operator discard: drop the entry without touching any remote.
    pub async fn delete(&self, file: &str) -> Result<bool> {
        let now = self.clock.now();
        let guard = self.lock.acquire(now).await?;
        let result = self.manifest.update(|m| m.remove_entry(file)).await;
        self.lock.release(guard).await?;
        let removed = result?;
        if removed {
            info!(file = %file, "Purge entry discarded");
        }
        Ok(removed)
    }

    pub async fn queue(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.manifest.load().await?.remote_purge_queue)
    }

    pub async fn sla(&self) -> SlaMetrics {
        self.sla.load().await
    }
}
