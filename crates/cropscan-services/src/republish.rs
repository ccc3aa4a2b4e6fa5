use chrono::Utc;
use cropscan_core::{Config, Job, JobMessage, RetryBackoff};
use cropscan_db::JobStore;
use cropscan_queue::QueuePublisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct RepublishConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub backoff: RetryBackoff,
}

impl Default for RepublishConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            backoff: RetryBackoff::default(),
        }
    }
}

impl From<&Config> for RepublishConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.republish_interval,
            backoff: RetryBackoff::new(config.retry_backoff_base, config.retry_backoff_max),
            ..Self::default()
        }
    }
}

/// Background service that re-publishes queued jobs whose initial publish
/// never reached the broker.
///
/// Each job keeps its own schedule: after a failed attempt the next one is
/// pushed out along the backoff curve and then held at its cap. Jobs are never
/// dropped; the marker clears once a publish succeeds or the job leaves
/// `Queued`.
pub struct RepublishService {
    jobs: Arc<dyn JobStore>,
    publisher: QueuePublisher,
    config: RepublishConfig,
}

impl RepublishService {
    /// `publisher` should make a single attempt; pacing comes from the schedule.
    pub fn new(jobs: Arc<dyn JobStore>, publisher: QueuePublisher, config: RepublishConfig) -> Self {
        Self {
            jobs,
            publisher,
            config,
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                interval_secs = self.config.interval.as_secs(),
                batch_size = self.config.batch_size,
                "Republish service started"
            );

            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "Error processing republish batch");
                }
            }
        })
    }

    /// Attempt every due job once. Returns how many were published.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let due = self
            .jobs
            .due_for_republish(Utc::now(), self.config.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        tracing::info!(due = due.len(), "Republishing queued jobs");
        let mut published = 0;
        for job in due {
            if self.republish(&job).await? {
                published += 1;
            }
        }
        Ok(published)
    }

    #[tracing::instrument(skip(self, job), fields(job.id = %job.job_id, publish_attempts = job.publish_attempts))]
    async fn republish(&self, job: &Job) -> anyhow::Result<bool> {
        let message = JobMessage::for_job(job, Utc::now());
        match self.publisher.publish(&message).await {
            Ok(()) => {
                self.jobs.clear_publish_failed(job.job_id).await?;
                tracing::info!("Job republished");
                Ok(true)
            }
            Err(e) => {
                let delay = self
                    .config
                    .backoff
                    .delay_for(job.publish_attempts.max(0) as u32);
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(16));
                tracing::warn!(
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "Republish failed, will retry"
                );
                self.jobs
                    .mark_publish_failed(job.job_id, next_attempt_at)
                    .await?;
                Ok(false)
            }
        }
    }
}
