use std::sync::Arc;

use anyhow::{Context, Result};
use kidsync_storage::RecordStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::orchestrator::SyncOrchestrator;

/// A cron job running the daily sync, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler<S>(
    config: &SyncConfig,
    orchestrator: Arc<SyncOrchestrator<S>>,
) -> Result<Option<JobScheduler>>
where
    S: RecordStore + 'static,
{
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            match orchestrator.run_daily_sync().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "daily sync scheduled");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use kidsync_storage::MemoryStore;

    use super::*;
    use crate::orchestrator::Collaborators;
    use crate::testing::{fixed_clock, StubFeed, StubPlatform, StubSearch};

    fn orchestrator(config: &SyncConfig) -> Arc<SyncOrchestrator<MemoryStore>> {
        Arc::new(SyncOrchestrator::new(
            Arc::new(MemoryStore::new()),
            fixed_clock("2026-03-01T02:00:00Z"),
            Collaborators {
                feed: Arc::new(StubFeed::default()),
                search: Arc::new(StubSearch::default()),
                platform: Arc::new(StubPlatform::default()),
            },
            config,
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        let built = maybe_build_scheduler(&config, orchestrator(&config)).await.unwrap();
        assert!(built.is_none());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = true;
        config.sync_cron = "every day at two".into();
        let Err(err) = maybe_build_scheduler(&config, orchestrator(&config)).await else {
            panic!("an unparsable cron expression must be rejected");
        };
        assert!(err.to_string().contains("every day at two"));
    }
}
