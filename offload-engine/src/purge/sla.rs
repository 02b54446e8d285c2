//! Completion-latency history and pending-work forecast.

use super::queue::QueueEntry;
use crate::host::{self, HostStore};
use crate::utils::format::format_duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub const SLA_OPTION: &str = "offload_purge_sla";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds from registration to completion
    pub duration: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub pending: usize,
    pub forecast_seconds: Option<i64>,
    pub forecast_label: Option<String>,
}

impl Forecast {
    fn compute(history: &[Sample], pending: usize, window: usize) -> Self {
        let recent = &history[history.len().saturating_sub(window.max(1))..];
        if recent.is_empty() || pending == 0 {
            return Self {
                pending,
                ..Self::default()
            };
        }
        let mean = recent.iter().map(|s| s.duration.max(0)).sum::<i64>() / recent.len() as i64;
        let seconds = mean.saturating_mul(pending as i64);
        Self {
            pending,
            forecast_seconds: Some(seconds),
            forecast_label: Some(format!("~{} for {} pending", format_duration(seconds as u64), pending)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlaMetrics {
    #[serde(default)]
    pub overall: Vec<Sample>,
    #[serde(default)]
    pub destinations: BTreeMap<String, Vec<Sample>>,
    #[serde(default)]
    pub forecast: Forecast,
    #[serde(default)]
    pub destination_forecasts: BTreeMap<String, Forecast>,
    #[serde(default)]
    pub updated_at: i64,
}

impl SlaMetrics {
    /// Add one completed entry to the overall and per-destination histories.
    pub fn record_completion(&mut self, entry: &QueueEntry, now: i64, history_limit: usize) {
        let sample = Sample {
            duration: (now - entry.registered_at).max(0),
            timestamp: now,
        };
        push_capped(&mut self.overall, sample, history_limit);
        for id in &entry.destinations {
            push_capped(self.destinations.entry(id.clone()).or_default(), sample, history_limit);
        }
    }

    /// Rebuild every forecast from the histories and the still-active entries.
    pub fn refresh_forecasts(&mut self, queue: &[QueueEntry], window: usize, now: i64) {
        let active: Vec<&QueueEntry> = queue.iter().filter(|e| e.status.is_active()).collect();
        self.forecast = Forecast::compute(&self.overall, active.len(), window);

        let mut pending_by_destination: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in &active {
            for id in &entry.destinations {
                *pending_by_destination.entry(id.as_str()).or_default() += 1;
            }
        }

        let ids: Vec<String> = self
            .destinations
            .keys()
            .cloned()
            .chain(pending_by_destination.keys().map(|id| id.to_string()))
            .collect();

        self.destination_forecasts.clear();
        for id in ids {
            let history = self.destinations.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let pending = pending_by_destination.get(id.as_str()).copied().unwrap_or(0);
            self.destination_forecasts
                .insert(id, Forecast::compute(history, pending, window));
        }
        self.updated_at = now;
    }
}

fn push_capped(history: &mut Vec<Sample>, sample: Sample, limit: usize) {
    history.push(sample);
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
}

/// Loads, updates and stores [`SlaMetrics`]. Storage problems are logged, never returned.
pub struct SlaTracker {
    store: Arc<dyn HostStore>,
    history_limit: usize,
    forecast_window: usize,
}

impl SlaTracker {
    pub fn new(store: Arc<dyn HostStore>, history_limit: usize, forecast_window: usize) -> Self {
        Self {
            store,
            history_limit,
            forecast_window,
        }
    }

    pub async fn load(&self) -> SlaMetrics {
        match host::load_or_default(self.store.as_ref(), SLA_OPTION).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "Unreadable SLA metrics, starting fresh");
                SlaMetrics::default()
            }
        }
    }

    /// Fold a pass's completions in and recompute forecasts against `queue`.
    pub async fn update(&self, completed: &[QueueEntry], queue: &[QueueEntry], now: i64) -> SlaMetrics {
        let mut metrics = self.load().await;
        for entry in completed {
            metrics.record_completion(entry, now, self.history_limit);
        }
        metrics.refresh_forecasts(queue, self.forecast_window, now);

        if let Err(e) = host::save(self.store.as_ref(), SLA_OPTION, &metrics).await {
            warn!(error = %e, "Failed to persist SLA metrics");
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::purge::queue::QueueStatus;

    fn entry(file: &str, dests: &[&str], registered_at: i64) -> QueueEntry {
        let dests: Vec<String> = dests.iter().map(|s| s.to_string()).collect();
        QueueEntry::new(file, &dests, registered_at)
    }

    #[test]
    fn test_no_history_means_no_forecast() {
        let mut metrics = SlaMetrics::default();
        metrics.refresh_forecasts(&[entry("a.zip", &["s3"], 0)], 10, 100);
        assert_eq!(metrics.forecast.pending, 1);
        assert!(metrics.forecast.forecast_seconds.is_none());
        assert!(metrics.forecast.forecast_label.is_none());
    }

    #[test]
    fn test_forecast_is_mean_times_pending() {
        let mut metrics = SlaMetrics::default();
        metrics.record_completion(&entry("old1.zip", &["s3"], 0), 1_000, 50);
        metrics.record_completion(&entry("old2.zip", &["s3", "dropbox"], 0), 3_000, 50);

        let mut failed = entry("dead.zip", &["s3"], 0);
        failed.status = QueueStatus::Failed;
        let queue = vec![
            entry("a.zip", &["s3"], 0),
            entry("b.zip", &["s3"], 0),
            entry("c.zip", &["dropbox"], 0),
            failed,
        ];
        metrics.refresh_forecasts(&queue, 10, 5_000);

        assert_eq!(metrics.forecast.forecast_seconds, Some(6_000));
        assert_eq!(metrics.forecast.forecast_label.as_deref(), Some("~1h 40m for 3 pending"));
        assert_eq!(metrics.destination_forecasts["s3"].forecast_seconds, Some(4_000));
        assert_eq!(metrics.destination_forecasts["dropbox"].forecast_seconds, Some(3_000));
    }

    #[test]
    fn test_history_is_capped_and_window_limits_mean() {
        let mut metrics = SlaMetrics::default();
        for i in 0..60 {
            metrics.record_completion(&entry("x.zip", &["s3"], 0), i * 10, 50);
        }
        assert_eq!(metrics.overall.len(), 50);
        assert_eq!(metrics.overall[0].duration, 100);

        metrics.refresh_forecasts(&[entry("a.zip", &["s3"], 0)], 2, 0);
        // Last two durations: 580 and 590
        assert_eq!(metrics.forecast.forecast_seconds, Some(585));
    }

    #[tokio::test]
    async fn test_tracker_persists() {
        let store = Arc::new(MemoryHost::new());
        let tracker = SlaTracker::new(store.clone(), 50, 10);
        tracker.update(&[entry("a.zip", &["s3"], 100)], &[], 160).await;

        let reloaded = tracker.load().await;
        assert_eq!(reloaded.overall, vec![Sample { duration: 60, timestamp: 160 }]);
        assert_eq!(reloaded.updated_at, 160);
        assert!(store.get_json(SLA_OPTION).await.unwrap().is_some());
    }
}
