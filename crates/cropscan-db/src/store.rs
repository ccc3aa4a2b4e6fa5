use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cropscan_core::{ActiveFileReferences, Job, JobEvent, NewJob};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{JobStoreError, JobStoreResult};

/// Result of applying a lifecycle event.
#[derive(Debug, Clone)]
pub struct Applied {
    pub job: Job,
    /// False when the job was already terminal and the event was absorbed.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// Flag set now; a worker will honour it at its next checkpoint.
    Requested(Job),
    AlreadyRequested(Job),
    /// Job finished before the request; nothing to cancel.
    AlreadyTerminal(Job),
}

impl CancelOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CancelOutcome::Requested(job)
            | CancelOutcome::AlreadyRequested(job)
            | CancelOutcome::AlreadyTerminal(job) => job,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, CancelOutcome::AlreadyTerminal(_))
    }
}

/// Shared job record store used by the producer, workers, reaper and pollers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `Queued` with the publish marker already set; the
    /// producer clears it once the descriptor reaches the broker.
    async fn create(&self, new_job: NewJob) -> JobStoreResult<Job>;

    async fn get(&self, job_id: Uuid) -> JobStoreResult<Option<Job>>;

    /// Read-consistent status lookup; unknown or reaped ids are `NotFound`.
    async fn get_status(&self, job_id: Uuid) -> JobStoreResult<Job> {
        self.get(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    /// Apply a lifecycle event with a compare-and-swap on the prior state.
    async fn apply(&self, job_id: Uuid, event: JobEvent) -> JobStoreResult<Applied>;

    /// Set `cancel_requested` on a non-terminal job.
    async fn request_cancel(&self, job_id: Uuid) -> JobStoreResult<CancelOutcome>;

    /// Record a failed publish on a still-queued job and schedule the next attempt.
    async fn mark_publish_failed(
        &self,
        job_id: Uuid,
        next_attempt_at: DateTime<Utc>,
    ) -> JobStoreResult<()>;

    /// Confirm a publish: the job is no longer a republication candidate.
    async fn clear_publish_failed(&self, job_id: Uuid) -> JobStoreResult<()>;

    /// Queued jobs carrying the publish marker whose next attempt is due.
    async fn due_for_republish(&self, now: DateTime<Utc>, limit: usize) -> JobStoreResult<Vec<Job>>;

    /// True when a queued, processing or retry-pending job references the file.
    async fn has_active_references(&self, file_id: &str) -> JobStoreResult<bool>;

    /// Delete at most `limit` terminal jobs finished before `cutoff`.
    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> JobStoreResult<u64>;
}

/// Adapts a [`JobStore`] to the object store's reference check.
#[derive(Clone)]
pub struct JobFileReferences(pub Arc<dyn JobStore>);

#[async_trait]
impl ActiveFileReferences for JobFileReferences {
    async fn has_active_references(&self, file_id: &str) -> anyhow::Result<bool> {
        Ok(self.0.has_active_references(file_id).await?)
    }
}
