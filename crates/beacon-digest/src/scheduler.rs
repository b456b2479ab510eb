use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::DigestConfig;
use crate::error::DigestError;
use crate::job::{DigestJob, RunOptions};

/// Registers the daily digest on `cron` (six-field, UTC). A failed scheduled
/// run is logged; the scheduler keeps going.
pub async fn build_scheduler(
    job: Arc<DigestJob>,
    cron: &str,
    days_back: u32,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let scheduled = Job::new_async(cron, move |_uuid, _l| {
        let job = job.clone();
        Box::pin(async move {
            info!(days_back, "scheduled digest run triggered");
            match job.run(RunOptions::days_back(days_back)).await {
                Ok(summary) => info!(
                    run_id = summary.run_id,
                    sent = summary.sent_count,
                    "scheduled digest run finished"
                ),
                Err(DigestError::RunInProgress) => {
                    info!("previous digest run still in progress; skipping this tick")
                }
                Err(err) => error!(code = err.code(), error = %err, "scheduled digest run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(scheduled).await.context("adding scheduler job")?;
    Ok(sched)
}

/// `None` unless `DIGEST_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(
    job: Arc<DigestJob>,
    config: &DigestConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(job, &config.cron, config.days_back)
        .await
        .map(Some)
}
