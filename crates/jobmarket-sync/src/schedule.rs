use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::ScrapeService;

/// One job per configured cron expression, each running a full live scrape.
/// `None` when scheduling is disabled. The scheduler is returned unstarted.
pub async fn build_scheduler(service: Arc<ScrapeService>) -> Result<Option<JobScheduler>> {
    let schedule = service.config().schedule.clone();
    if !schedule.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in &schedule.crons {
        let service = Arc::clone(&service);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                let config = service.config();
                let rate_limit = config.rate_limit.to_rate_limit_config();
                match service.run_scrape(config.max_pages, rate_limit).await {
                    Ok(log) => info!(run_id = %log.run_id, status = %log.status, "scheduled scrape finished"),
                    Err(err) => error!(error = format!("{err:#}"), "scheduled scrape failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    info!(jobs = schedule.crons.len(), "scrape scheduler configured");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::service_with;

    #[tokio::test]
    async fn disabled_schedule_builds_nothing() {
        let (service, _dir) = service_with(|_| {}).await;
        assert!(build_scheduler(Arc::new(service)).await.expect("build scheduler").is_none());
    }

    #[tokio::test]
    async fn enabled_schedule_registers_jobs() {
        let (service, _dir) = service_with(|c| c.schedule.enabled = true).await;
        let sched = build_scheduler(Arc::new(service)).await.expect("build scheduler");
        assert!(sched.is_some());
    }

    #[tokio::test]
    async fn malformed_cron_is_rejected() {
        let (service, _dir) = service_with(|c| {
            c.schedule.enabled = true;
            c.schedule.crons = vec!["every morning".to_string()];
        })
        .await;
        let err = build_scheduler(Arc::new(service)).await.err().expect("expected an error");
        assert!(format!("{err:#}").contains("every morning"));
    }
}
