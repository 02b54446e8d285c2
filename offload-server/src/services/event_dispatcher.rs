use crate::models::scheduled_event::{self, ScheduledEventRow};
use crate::state::AppState;
use offload_engine::purge::PURGE_TICK_HOOK;
use offload_engine::Clock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Poll `scheduled_events` and fire the hooks that are due.
pub fn start_event_dispatcher(state: Arc<AppState>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(state.config.dispatch_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = dispatch_due(&state).await {
                        tracing::warn!(error = %e, "Scheduled event dispatch failed");
                    }
                }
            }
        }
        tracing::info!("Event dispatcher stopped");
    });
}

/// Take every due row and run its hook. Returns how many ran.
pub async fn dispatch_due(state: &AppState) -> anyhow::Result<usize> {
    let db = state.db.clone();
    let now = state.clock.now();
    let due = tokio::task::spawn_blocking(move || {
        let mut conn = db.get()?;
        scheduled_event::take_due(&mut conn, now)
    })
    .await??;

    let count = due.len();
    for event in due {
        run_hook(state, &event).await;
    }
    Ok(count)
}

async fn run_hook(state: &AppState, event: &ScheduledEventRow) {
    match event.hook.as_str() {
        PURGE_TICK_HOOK => match state.worker.run_pass().await {
            Ok(report) => tracing::info!(
                hook = %event.hook,
                processed = report.processed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                "Scheduled purge pass finished"
            ),
            Err(e) => tracing::error!(hook = %event.hook, error = %e, "Scheduled purge pass failed"),
        },
        other => tracing::warn!(hook = %other, id = event.id, "No handler for scheduled hook"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use offload_engine::host::HostStore;
    use offload_engine::{Config, QueueStatus};
    use serde_json::json;

    fn state(dir: &tempfile::TempDir) -> AppState {
        let db_path = dir.path().join("offload.db");
        let pool = create_pool(db_path.to_str().unwrap()).unwrap();
        migrate(&pool).unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            db_path,
            config_path: dir.path().join("offload.toml"),
            log_level: None,
            dispatch_interval_secs: 30,
        };
        AppState::new(pool, config, Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_due_purge_tick_runs_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        state
            .worker
            .register("full-1.zip", &["missing".to_string()])
            .await
            .unwrap();

        let host = crate::host::SqliteHost::new(state.db.clone());
        host.schedule_once(0, PURGE_TICK_HOOK, json!({})).await.unwrap();
        host.schedule_once(i64::MAX, "later", json!({})).await.unwrap();

        assert_eq!(dispatch_due(&state).await.unwrap(), 1);
        let queue = state.worker.queue().await.unwrap();
        assert_eq!(queue[0].status, QueueStatus::Failed);

        // Already consumed.
        assert_eq!(dispatch_due(&state).await.unwrap(), 0);
    }
}
