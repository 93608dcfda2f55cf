// service/background_jobs.rs
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};

use crate::service::job_service::JobService;

/// Releases payment for every job whose cooling window has elapsed.
/// Errors are logged and the job is picked up again on the next tick.
pub async fn start_finalize_job(job_service: Arc<JobService>, every: Duration, batch_size: i64) {
    let mut interval = interval(every);

    loop {
        interval.tick().await;

        tracing::debug!("Running finalize job at {}", Utc::now());

        match job_service.finalize_due(batch_size).await {
            Ok(summary) if summary.finalized + summary.skipped + summary.failed > 0 => tracing::info!(
                "Finalize job completed: {} finalized, {} skipped, {} failed",
                summary.finalized,
                summary.skipped,
                summary.failed
            ),
            Ok(_) => {}
            Err(e) => tracing::error!("Finalize job failed: {}", e),
        }
    }
}
