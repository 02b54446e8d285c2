//! Purge queue entries and their state transitions.

use super::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[default]
    Pending,
    Retry,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn is_active(self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Retry)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Retry => "retry",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

/// One archive that must disappear from a set of destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub file: String,
    /// Destination ids in registration order, no duplicates
    pub destinations: Vec<String>,
    #[serde(default)]
    pub status: QueueStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub registered_at: i64,
    #[serde(default)]
    pub last_attempt_at: i64,
    #[serde(default)]
    pub next_attempt_at: i64,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub failed_at: i64,
}

impl QueueEntry {
    pub fn new(file: &str, destinations: &[String], now: i64) -> Self {
        let mut entry = Self {
            file: file.to_string(),
            destinations: Vec::new(),
            status: QueueStatus::Pending,
            attempts: 0,
            registered_at: now,
            last_attempt_at: 0,
            next_attempt_at: now,
            last_error: String::new(),
            errors: Vec::new(),
            failed_at: 0,
        };
        entry.merge_destinations(destinations);
        entry
    }

    /// Add destinations not already listed, keeping order. Returns how many were added.
    pub fn merge_destinations(&mut self, destinations: &[String]) -> usize {
        let mut added = 0;
        for id in destinations {
            if !id.is_empty() && !self.destinations.contains(id) {
                self.destinations.push(id.clone());
                added += 1;
            }
        }
        added
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.status.is_active() && self.next_attempt_at <= now
    }

    /// Operator retry: back to a fresh pending entry, error history kept.
    pub fn reset(&mut self, now: i64) {
        self.status = QueueStatus::Pending;
        self.attempts = 0;
        self.last_error.clear();
        self.next_attempt_at = now;
        self.failed_at = 0;
    }

    pub fn mark_completed(&mut self, now: i64) {
        self.status = QueueStatus::Completed;
        self.last_attempt_at = now;
        self.next_attempt_at = 0;
    }

    /// Fold one failed attempt into the entry.
    ///
    /// `permanent` forces the failed state regardless of the attempt count.
    pub fn record_failure(
        &mut self,
        errors: Vec<String>,
        now: i64,
        backoff: &BackoffPolicy,
        max_attempts: u32,
        permanent: bool,
    ) {
        self.attempts += 1;
        self.last_attempt_at = now;
        if let Some(last) = errors.last() {
            self.last_error = last.clone();
        }
        self.errors.extend(errors);

        if permanent || self.attempts >= max_attempts {
            self.status = QueueStatus::Failed;
            self.failed_at = now;
            self.next_attempt_at = 0;
        } else {
            self.status = QueueStatus::Retry;
            self.next_attempt_at = now + backoff.delay(self.attempts);
        }
    }
}
