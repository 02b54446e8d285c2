//! One-shot operator commands behind the CLI subcommands.

use crate::state::AppState;
use offload_engine::retention::RetentionPolicy;
use offload_engine::transfer::{PruneReport, StorageUsage};
use offload_engine::utils::format::{format_bytes, format_duration};
use offload_engine::{Clock, QueueEntry, QueueStatus};
use std::path::Path;
use uuid::Uuid;

/// Upload `path` to each destination in turn.
pub async fn upload(state: &AppState, destination_ids: &[String], path: &Path) -> anyhow::Result<()> {
    if !path.is_file() {
        anyhow::bail!("{} is not a file", path.display());
    }
    let task_id = Uuid::new_v4().to_string();
    for id in destination_ids {
        let destination = state.registry.resolve(id)?;
        let started = std::time::Instant::now();
        destination.upload(path, &task_id).await?;
        tracing::info!(
            destination = %id,
            file = %path.display(),
            elapsed = %format_duration(started.elapsed().as_secs()),
            "Upload finished"
        );
    }
    Ok(())
}

pub async fn prune(
    state: &AppState,
    destination_id: &str,
    retain_by_number: usize,
    retain_by_age_days: u32,
) -> anyhow::Result<PruneReport> {
    let destination = state.registry.resolve(destination_id)?;
    let policy = RetentionPolicy::new(retain_by_number, retain_by_age_days);
    let report = destination
        .prune_remote_backups(policy, state.clock.now())
        .await;
    if report.is_partial_failure() {
        tracing::warn!(destination = %destination_id, errors = ?report.errors, "Prune finished with errors");
    }
    Ok(report)
}

pub async fn usage(state: &AppState, destination_id: &str, refresh: bool) -> anyhow::Result<StorageUsage> {
    let destination = state.registry.resolve(destination_id)?;
    let usage = state
        .usage
        .usage(destination.as_ref(), state.clock.now(), refresh)
        .await?;
    Ok(usage)
}

pub fn describe_usage(id: &str, usage: &StorageUsage) -> String {
    let quota = usage
        .quota_bytes
        .map(format_bytes)
        .unwrap_or_else(|| "unknown".into());
    let ratio = usage
        .ratio()
        .map(|r| format!(" ({:.1}%)", r * 100.0))
        .unwrap_or_default();
    format!(
        "{id}: {} used of {quota}{ratio} [{:?}]",
        format_bytes(usage.used_bytes),
        usage.source
    )
}

/// One line per queue entry for terminal output.
pub fn describe_entry(entry: &QueueEntry, now: i64) -> String {
    let mut line = format!(
        "{:<40} {:<9} attempts={} destinations={}",
        entry.file,
        entry.status,
        entry.attempts,
        entry.destinations.join(",")
    );
    match entry.status {
        QueueStatus::Retry if entry.next_attempt_at > now => {
            line.push_str(&format!(
                " next_in={}",
                format_duration((entry.next_attempt_at - now) as u64)
            ));
        }
        QueueStatus::Failed => line.push_str(&format!(" failed_at={}", entry.failed_at)),
        _ => {}
    }
    if !entry.last_error.is_empty() {
        line.push_str(&format!(" last_error=\"{}\"", entry.last_error));
    }
    line
}
