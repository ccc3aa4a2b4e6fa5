use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cropscan_core::{apply_event, Job, JobEvent, JobStatus, NewJob};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{JobStoreError, JobStoreResult};
use crate::store::{Applied, CancelOutcome, JobStore};

/// Single-process job store. Every mutation happens under one write lock, which
/// linearises transitions per job.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> JobStoreResult<Job> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&new_job.job_id) {
            return Err(JobStoreError::AlreadyExists(new_job.job_id));
        }
        let job = Job::new(new_job, Utc::now());
        jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> JobStoreResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn apply(&self, job_id: Uuid, event: JobEvent) -> JobStoreResult<Applied> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(&job_id)
            .cloned()
            .ok_or(JobStoreError::NotFound(job_id))?;
        match apply_event(&current, &event, Utc::now())? {
            Some(updated) => {
                jobs.insert(job_id, updated.clone());
                Ok(Applied {
                    job: updated,
                    changed: true,
                })
            }
            None => Ok(Applied {
                job: current,
                changed: false,
            }),
        }
    }

    async fn request_cancel(&self, job_id: Uuid) -> JobStoreResult<CancelOutcome> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job.clone()));
        }
        if job.cancel_requested {
            return Ok(CancelOutcome::AlreadyRequested(job.clone()));
        }
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        Ok(CancelOutcome::Requested(job.clone()))
    }

    async fn mark_publish_failed(
        &self,
        job_id: Uuid,
        next_attempt_at: DateTime<Utc>,
    ) -> JobStoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status == JobStatus::Queued {
            job.publish_failed = true;
            job.publish_attempts += 1;
            job.next_publish_at = Some(next_attempt_at);
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn clear_publish_failed(&self, job_id: Uuid) -> JobStoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.publish_failed {
            job.publish_failed = false;
            job.next_publish_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn due_for_republish(&self, now: DateTime<Utc>, limit: usize) -> JobStoreResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Queued
                    && job.publish_failed
                    && job.next_publish_at.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|job| job.next_publish_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn has_active_references(&self, file_id: &str) -> JobStoreResult<bool> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .any(|job| job.stored_file_id == file_id && !job.is_terminal()))
    }

    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> JobStoreResult<u64> {
        let mut jobs = self.jobs.write().await;
        let mut doomed: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|job| job.is_terminal())
            .filter_map(|job| job.finished_at.map(|at| (at, job.job_id)))
            .filter(|(at, _)| *at < cutoff)
            .collect();
        doomed.sort();
        doomed.truncate(limit);
        for (_, job_id) in &doomed {
            jobs.remove(job_id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropscan_core::{AnalysisParameters, AnalysisType, JobFailure, PUBLISH_CONFIRM_GRACE_SECS};
    use std::sync::Arc;

    fn new_job(file_id: &str) -> NewJob {
        NewJob {
            job_id: Uuid::new_v4(),
            stored_file_id: file_id.to_string(),
            analysis_type: AnalysisType::Disease,
            parameters: AnalysisParameters::default(),
        }
    }

    fn failure() -> JobFailure {
        JobFailure {
            code: "vision_rejected".to_string(),
            message: "HTTP 422".to_string(),
            attempts: 1,
            retryable: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_status() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("f1")).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let status = store.get_status(job.job_id).await.unwrap();
        assert_eq!(status.job_id, job.job_id);

        let missing = store.get_status(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(JobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = new_job("f1");
        store.create(job.clone()).await.unwrap();
        assert!(matches!(
            store.create(job).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store.create(new_job("f1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .apply(job.job_id, JobEvent::Claim { redelivered: false })
                    .await
            }));
        }

        let mut winners = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(applied) if applied.changed => winners += 1,
                Err(JobStoreError::InvalidTransition(_)) => rejected += 1,
                other => panic!("unexpected outcome: {:?}", other.map(|a| a.job.status)),
            }
        }
        assert_eq!((winners, rejected), (1, 1));
        assert_eq!(store.get_status(job.job_id).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_events_after_terminal_are_noops() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("f1")).await.unwrap();
        store
            .apply(job.job_id, JobEvent::Claim { redelivered: false })
            .await
            .unwrap();
        store
            .apply(job.job_id, JobEvent::FailPermanent { failure: failure() })
            .await
            .unwrap();

        let again = store
            .apply(job.job_id, JobEvent::Claim { redelivered: true })
            .await
            .unwrap();
        assert!(!again.changed);
        assert_eq!(again.job.status, JobStatus::FailedPermanently);
        assert_eq!(again.job.error.unwrap().code, "vision_rejected");
    }

    #[tokio::test]
    async fn test_cancel_request_outcomes() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("f1")).await.unwrap();

        let outcome = store.request_cancel(job.job_id).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Requested(ref j) if j.cancel_requested));
        // Visible to pollers at once, status untouched until a worker observes it.
        let polled = store.get_status(job.job_id).await.unwrap();
        assert!(polled.cancel_requested);
        assert_eq!(polled.status, JobStatus::Queued);

        assert!(matches!(
            store.request_cancel(job.job_id).await.unwrap(),
            CancelOutcome::AlreadyRequested(_)
        ));

        store
            .apply(job.job_id, JobEvent::CancelObserved)
            .await
            .unwrap();
        let outcome = store.request_cancel(job.job_id).await.unwrap();
        assert!(outcome.is_noop());
    }

    #[tokio::test]
    async fn test_references_only_count_unfinished_jobs() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("shared")).await.unwrap();
        assert!(store.has_active_references("shared").await.unwrap());
        assert!(!store.has_active_references("other").await.unwrap());

        store
            .apply(job.job_id, JobEvent::CancelObserved)
            .await
            .unwrap();
        assert!(!store.has_active_references("shared").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_marker_lifecycle() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("f1")).await.unwrap();
        let now = Utc::now();

        store.mark_publish_failed(job.job_id, now).await.unwrap();
        let due = store.due_for_republish(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].publish_attempts, 1);

        let later = now + chrono::Duration::seconds(30);
        store.mark_publish_failed(job.job_id, later).await.unwrap();
        assert!(store.due_for_republish(now, 10).await.unwrap().is_empty());

        store.clear_publish_failed(job.job_id).await.unwrap();
        assert!(store.due_for_republish(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_job_becomes_due_for_republish() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("f1")).await.unwrap();
        assert!(job.publish_failed);

        let now = Utc::now();
        assert!(store.due_for_republish(now, 10).await.unwrap().is_empty());
        let after_grace = now + chrono::Duration::seconds(PUBLISH_CONFIRM_GRACE_SECS + 1);
        let due = store.due_for_republish(after_grace, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].publish_attempts, 0);

        store.clear_publish_failed(job.job_id).await.unwrap();
        assert!(store
            .due_for_republish(after_grace, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_retention_sweep_is_bounded() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            let job = store.create(new_job("f1")).await.unwrap();
            store
                .apply(job.job_id, JobEvent::CancelObserved)
                .await
                .unwrap();
        }
        let live = store.create(new_job("f2")).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.delete_terminal_before(cutoff, 2).await.unwrap(), 2);
        assert_eq!(store.delete_terminal_before(cutoff, 2).await.unwrap(), 1);
        assert_eq!(store.delete_terminal_before(cutoff, 2).await.unwrap(), 0);
        assert!(store.get(live.job_id).await.unwrap().is_some());
    }
}
