//! Cron triggers. Each tick calls `run_backup(category)`; the engine itself
//! knows nothing about time.

use backup_engine::manifest::Category;
use backup_engine::{Engine, EngineError, RunResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    engine: Arc<Engine>,
}

impl BackupScheduler {
    pub async fn new(engine: Arc<Engine>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            engine,
        })
    }

    pub async fn schedule(&self, category: Category, cron_expression: &str) -> anyhow::Result<()> {
        let engine = self.engine.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let engine = engine.clone();
            Box::pin(async move {
                run_scheduled(&engine, category).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(category = %category, cron = %cron_expression, "Backup scheduled");
        Ok(())
    }

    pub async fn init_schedules(&self, schedules: &[(Category, String)]) -> anyhow::Result<()> {
        let mut count = 0;
        for (category, cron) in schedules {
            if let Err(e) = self.schedule(*category, cron).await {
                tracing::error!(category = %category, cron = %cron, error = %e, "Failed to schedule backup");
            } else {
                count += 1;
            }
        }

        tracing::info!(count, "Cron schedules initialized");
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

/// One tick. A tick that finds another operation running is skipped.
pub async fn run_scheduled(engine: &Engine, category: Category) -> Option<RunResult> {
    tracing::info!(category = %category, "Starting scheduled backup");
    match engine.run_backup(category).await {
        Ok(result) => Some(result),
        Err(e @ EngineError::AlreadyRunning { .. }) => {
            tracing::warn!(category = %category, reason = %e, "Skipping scheduled backup");
            None
        }
        Err(e) => {
            tracing::error!(category = %category, error = %e, "Scheduled backup failed");
            None
        }
    }
}
