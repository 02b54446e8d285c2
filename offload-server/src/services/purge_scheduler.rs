use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct PurgeScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl PurgeScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    /// Register the periodic purge tick on the configured cron expression.
    pub async fn init_schedule(&self) -> anyhow::Result<()> {
        let cron = self.state.engine.purge.cron.clone();
        let worker = self.state.worker.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let worker = worker.clone();
            Box::pin(async move {
                match worker.run_pass().await {
                    Ok(report) if report.skipped_locked => {
                        tracing::debug!("Scheduled purge tick skipped: lock held");
                    }
                    Ok(report) => {
                        tracing::info!(
                            processed = report.processed,
                            completed = report.completed,
                            retried = report.retried,
                            failed = report.failed,
                            remaining = report.remaining,
                            "Scheduled purge tick finished"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "Scheduled purge tick failed"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron, "Purge tick scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
