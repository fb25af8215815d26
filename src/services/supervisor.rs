//! Liveness for claimed jobs whose worker disappeared.
//!
//! Stale queue claims are redelivered while the job has attempts left, and
//! failed with a timeout message once it does not. Expired terminal jobs are
//! purged on the same tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::models::job::JobState;
use crate::services::queue::JobQueue;
use crate::services::registry::JobRegistry;
use crate::services::worker::WorkerError;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// A claim older than this is considered abandoned.
    pub claim_timeout: Duration,
    /// Deliveries allowed before a job is failed instead of redelivered.
    pub max_deliveries: u32,
    pub interval: Duration,
}

/// Counts from one supervision pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub redelivered: u32,
    pub abandoned: u32,
    pub dropped: u32,
    pub purged: u64,
}

pub struct Supervisor {
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn JobRegistry>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(queue: Arc<dyn JobQueue>, registry: Arc<dyn JobRegistry>, config: SupervisorConfig) -> Self {
        Self {
            queue,
            registry,
            config,
        }
    }

    /// One recovery and retention pass.
    pub async fn tick(&self) -> Result<RecoveryReport, WorkerError> {
        let mut report = RecoveryReport::default();

        for job in self.queue.reclaim_stale(self.config.claim_timeout).await? {
            let current = self.registry.get(job.job_id).await?;
            match current {
                Some(record) if record.state == JobState::Started => {
                    if record.attempts as u32 >= self.config.max_deliveries {
                        let reason = format!(
                            "Job timed out: no result after {} attempt(s) of {}s each",
                            record.attempts,
                            self.config.claim_timeout.as_secs()
                        );
                        if self.registry.abandon(job.job_id, &reason).await? {
                            tracing::warn!(job_id = %job.job_id, attempts = record.attempts, "Abandoned stalled job");
                            report.abandoned += 1;
                        }
                    } else {
                        self.queue.enqueue(&job.redelivery()).await?;
                        tracing::warn!(job_id = %job.job_id, attempts = record.attempts, "Redelivered stalled job");
                        report.redelivered += 1;
                    }
                }
                // Claimed from the queue but never registered as started.
                Some(record) if record.state == JobState::Pending => {
                    self.queue.enqueue(&job.redelivery()).await?;
                    report.redelivered += 1;
                }
                _ => {
                    tracing::debug!(job_id = %job.job_id, "Dropping stale claim for finished job");
                    report.dropped += 1;
                }
            }
        }

        report.purged = self.registry.purge_expired().await?;

        let recovered = report.redelivered + report.abandoned;
        if recovered > 0 {
            metrics::counter!("analysis_jobs_recovered_total").increment(recovered as u64);
        }
        if report.purged > 0 {
            tracing::info!(purged = report.purged, "Purged expired jobs");
        }
        Ok(report)
    }

    /// Tick on `config.interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Supervisor pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Supervisor stopped");
    }
}
