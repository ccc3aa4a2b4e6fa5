use cropscan_core::{AppError, InvalidTransition, JobStatus};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} already exists")]
    AlreadyExists(Uuid),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Lost every compare-and-swap attempt against concurrent writers.
    #[error("Job {job_id} changed concurrently (last seen {observed})")]
    Conflict { job_id: Uuid, observed: JobStatus },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type JobStoreResult<T> = Result<T, JobStoreError>;

impl From<JobStoreError> for AppError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => AppError::NotFound(format!("Job {} not found", id)),
            JobStoreError::AlreadyExists(_) | JobStoreError::Conflict { .. } => {
                AppError::Conflict(err.to_string())
            }
            JobStoreError::InvalidTransition(e) => AppError::Conflict(e.to_string()),
            JobStoreError::Database(e) => AppError::Internal(format!("Database error: {}", e)),
        }
    }
}
