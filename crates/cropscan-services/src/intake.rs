use bytes::Bytes;
use chrono::Utc;
use cropscan_core::{
    AnalysisParameters, AnalysisType, AppError, Config, JobMessage, JobStatus, NewJob,
    RetryBackoff, StoredFile,
};
use cropscan_db::JobStore;
use cropscan_queue::QueuePublisher;
use cropscan_storage::{CommitOutcome, ObjectStore, UploadHandle};
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub max_file_size: u64,
    /// Curve used to schedule background republication after a failed publish.
    pub republish_backoff: RetryBackoff,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            republish_backoff: RetryBackoff::default(),
        }
    }
}

impl From<&Config> for IntakeConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_file_size: config.max_file_size,
            republish_backoff: RetryBackoff::new(
                config.retry_backoff_base,
                config.retry_backoff_max,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub stored: StoredFile,
    pub deduplicated: bool,
    pub analysis_type: AnalysisType,
    pub parameters: AnalysisParameters,
}

/// Intake response returned to the client.
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub file_id: String,
    pub deduplicated: bool,
    pub message: String,
    /// Seconds.
    pub estimated_processing_time: u64,
    /// True when the descriptor is waiting for background republication.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub publish_pending: bool,
}

/// Producer side of the pipeline.
#[derive(Clone)]
pub struct JobIntakeService {
    files: Arc<ObjectStore>,
    jobs: Arc<dyn JobStore>,
    publisher: QueuePublisher,
    config: IntakeConfig,
}

impl JobIntakeService {
    pub fn new(
        files: Arc<ObjectStore>,
        jobs: Arc<dyn JobStore>,
        publisher: QueuePublisher,
        config: IntakeConfig,
    ) -> Self {
        Self {
            files,
            jobs,
            publisher,
            config,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.config.max_file_size
    }

    /// Stream an upload into the object store under the configured size cap.
    pub async fn store_upload<S, E>(
        &self,
        content_type: &str,
        body: S,
    ) -> Result<CommitOutcome, AppError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let outcome = self
            .files
            .upload_stream(content_type, self.config.max_file_size, body)
            .await?;
        Ok(outcome)
    }

    /// Stream an upload to a temp file under the size cap, leaving the commit
    /// to [`commit_staged`](Self::commit_staged). Dropping the handle discards it.
    pub async fn stage_upload<S, E>(
        &self,
        content_type: &str,
        body: S,
    ) -> Result<UploadHandle, AppError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let handle = self
            .files
            .stage_stream(content_type, self.config.max_file_size, body)
            .await?;
        Ok(handle)
    }

    pub async fn commit_staged(&self, handle: UploadHandle) -> Result<CommitOutcome, AppError> {
        Ok(self.files.commit_upload(handle).await?)
    }

    /// Create the job record and publish its descriptor.
    ///
    /// The record is created already marked for republication, so once it
    /// exists the client always gets its job id: a broker outage or a failed
    /// marker update only changes when the republisher picks the job up.
    #[tracing::instrument(skip(self, request), fields(file_id = %request.stored.file_id, analysis_type = %request.analysis_type))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<SubmittedJob, AppError> {
        request.parameters.validate()?;

        let job = self
            .jobs
            .create(NewJob {
                job_id: Uuid::new_v4(),
                stored_file_id: request.stored.file_id.clone(),
                analysis_type: request.analysis_type,
                parameters: request.parameters,
            })
            .await?;

        let message = JobMessage::for_job(&job, Utc::now());
        let publish_pending = match self.publisher.publish(&message).await {
            Ok(()) => {
                if let Err(e) = self.jobs.clear_publish_failed(job.job_id).await {
                    // Worst case the republisher sends a duplicate, which
                    // workers absorb.
                    tracing::warn!(job.id = %job.job_id, error = %e, "Failed to confirm publish");
                }
                false
            }
            Err(e) => {
                tracing::error!(
                    job.id = %job.job_id,
                    error = %e,
                    "Publish failed, job left queued for republication"
                );
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(self.config.republish_backoff.delay_for(0))
                        .unwrap_or_else(|_| chrono::Duration::seconds(1));
                if let Err(e) = self
                    .jobs
                    .mark_publish_failed(job.job_id, next_attempt_at)
                    .await
                {
                    tracing::warn!(
                        job.id = %job.job_id,
                        error = %e,
                        "Failed to reschedule republication, creation deadline stands"
                    );
                }
                true
            }
        };

        tracing::info!(
            job.id = %job.job_id,
            deduplicated = request.deduplicated,
            publish_pending,
            "Job submitted"
        );

        let message = if publish_pending {
            "Image accepted; analysis will be queued shortly".to_string()
        } else {
            "Image queued for analysis".to_string()
        };
        Ok(SubmittedJob {
            job_id: job.job_id,
            status: job.status,
            file_id: job.stored_file_id,
            deduplicated: request.deduplicated,
            message,
            estimated_processing_time: request.analysis_type.estimated_processing_secs(),
            publish_pending,
        })
    }

    /// Store, create and publish in one call.
    pub async fn submit<S, E>(
        &self,
        content_type: &str,
        analysis_type: AnalysisType,
        parameters: AnalysisParameters,
        body: S,
    ) -> Result<SubmittedJob, AppError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        parameters.validate()?;
        let commit = self.store_upload(content_type, body).await?;
        self.enqueue(EnqueueRequest {
            stored: commit.stored,
            deduplicated: commit.deduplicated,
            analysis_type,
            parameters,
        })
        .await
    }
}
