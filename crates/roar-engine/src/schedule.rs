use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::{AggregationPipeline, DriverContextProvider, EngineSettings};

/// Scheduler that runs one cycle for `driver_id` per cron tick. The caller starts it.
///
/// Context is reloaded on every tick so edits to the driver's file take effect without a restart.
pub async fn build_scheduler(
    pipeline: Arc<AggregationPipeline>,
    provider: Arc<dyn DriverContextProvider>,
    driver_id: String,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let provider = provider.clone();
        let driver_id = driver_id.clone();
        Box::pin(async move {
            match provider.driver_context(&driver_id).await {
                Ok(ctx) => {
                    let outcome = pipeline.run_cycle(&ctx).await;
                    info!(
                        cycle_id = %outcome.cycle_id,
                        returned = outcome.stats.returned,
                        "scheduled cycle finished"
                    );
                }
                Err(err) => warn!(%driver_id, error = %err, "skipping scheduled cycle"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Scheduler for `ROAR_SCHEDULED_DRIVER`, or `None` when scheduling is off or has no driver.
pub async fn maybe_build_scheduler(
    settings: &EngineSettings,
    pipeline: Arc<AggregationPipeline>,
    provider: Arc<dyn DriverContextProvider>,
) -> Result<Option<JobScheduler>> {
    if !settings.scheduler_enabled {
        return Ok(None);
    }
    let Some(driver_id) = settings.scheduled_driver.clone() else {
        warn!("scheduler enabled without ROAR_SCHEDULED_DRIVER; not scheduling");
        return Ok(None);
    };
    let sched = build_scheduler(pipeline, provider, driver_id, &settings.cycle_cron).await?;
    Ok(Some(sched))
}
