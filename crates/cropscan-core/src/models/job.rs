use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::analysis::{AnalysisParameters, AnalysisType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    /// Retryable failure; the message has been requeued.
    Failed,
    CancelledCooperative,
    FailedPermanently,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CancelledCooperative | JobStatus::FailedPermanently
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::CancelledCooperative => "cancelled_cooperative",
            JobStatus::FailedPermanently => "failed_permanently",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled_cooperative" => Ok(JobStatus::CancelledCooperative),
            "failed_permanently" => Ok(JobStatus::FailedPermanently),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// Structured failure cause attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
    pub attempts: i32,
    pub retryable: bool,
}

/// How long a new job waits for its initial publish to be confirmed before
/// the republisher treats it as unpublished.
pub const PUBLISH_CONFIRM_GRACE_SECS: i64 = 30;

/// Input for creating a job in `Queued`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub stored_file_id: String,
    pub analysis_type: AnalysisType,
    pub parameters: AnalysisParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: Uuid,
    pub stored_file_id: String,
    pub analysis_type: AnalysisType,
    pub parameters: AnalysisParameters,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    pub cancel_requested: bool,
    /// Number of times a worker has claimed this job.
    pub attempts: i32,
    /// Set from creation until a publish is confirmed, so a job whose
    /// descriptor never reached the broker is always found by the republisher.
    pub publish_failed: bool,
    pub publish_attempts: i32,
    pub next_publish_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            job_id: new_job.job_id,
            stored_file_id: new_job.stored_file_id,
            analysis_type: new_job.analysis_type,
            parameters: new_job.parameters,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            cancel_requested: false,
            attempts: 0,
            publish_failed: true,
            publish_attempts: 0,
            next_publish_at: Some(now + chrono::Duration::seconds(PUBLISH_CONFIRM_GRACE_SECS)),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a further attempt is allowed after the current one fails.
    pub fn can_retry(&self, max_retries: i32) -> bool {
        self.attempts < max_retries
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Job {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::types::Json;
        use sqlx::Row;
        Ok(Job {
            job_id: row.try_get("job_id")?,
            stored_file_id: row.try_get("stored_file_id")?,
            analysis_type: row
                .try_get::<String, _>("analysis_type")?
                .parse()
                .map_err(|e| {
                    sqlx::Error::Decode(format!("Failed to parse analysis_type: {}", e).into())
                })?,
            parameters: row
                .try_get::<Json<AnalysisParameters>, _>("parameters")?
                .0,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse status: {}", e).into())
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            result: row.try_get("result")?,
            error: row
                .try_get::<Option<Json<JobFailure>>, _>("error")?
                .map(|e| e.0),
            cancel_requested: row.try_get("cancel_requested")?,
            attempts: row.try_get("attempts")?,
            publish_failed: row.try_get("publish_failed")?,
            publish_attempts: row.try_get("publish_attempts")?,
            next_publish_at: row.try_get("next_publish_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::CancelledCooperative,
            JobStatus::FailedPermanently,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn failed_is_not_terminal() {
        assert!(!JobStatus::Failed.is_terminal());
        assert!(JobStatus::FailedPermanently.is_terminal());
        assert!(JobStatus::CancelledCooperative.is_terminal());
    }
}
