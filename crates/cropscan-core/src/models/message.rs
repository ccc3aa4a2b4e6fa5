//! Queue wire payload
//!
//! A [`JobMessage`] only references the stored file, so its size is constant
//! whatever the image size. The schema is versioned: decoders ignore unknown
//! fields, treat a missing `schema_version` as version 1, and refuse versions
//! newer than they understand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::analysis::{AnalysisParameters, AnalysisType};
use super::job::Job;

pub const JOB_MESSAGE_SCHEMA_VERSION: u16 = 1;

fn legacy_schema_version() -> u16 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u16,
    pub job_id: Uuid,
    pub stored_file_id: String,
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub parameters: AnalysisParameters,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed job message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported job message schema version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },
}

impl JobMessage {
    pub fn for_job(job: &Job, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: JOB_MESSAGE_SCHEMA_VERSION,
            job_id: job.job_id,
            stored_file_id: job.stored_file_id.clone(),
            analysis_type: job.analysis_type,
            parameters: job.parameters.clone(),
            enqueued_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let message: JobMessage = serde_json::from_slice(bytes)?;
        if message.schema_version > JOB_MESSAGE_SCHEMA_VERSION {
            return Err(MessageError::UnsupportedVersion {
                found: message.schema_version,
                supported: JOB_MESSAGE_SCHEMA_VERSION,
            });
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_payload_from_older_producer() {
        let payload = br#"{
            "job_id": "6f1c2a1e-8d7b-4f0e-9a55-3b2f1c0d9e8a",
            "stored_file_id": "abc123",
            "analysis_type": "disease_detection",
            "enqueued_at": "2024-05-01T10:00:00Z"
        }"#;
        let message = JobMessage::decode(payload).unwrap();
        assert_eq!(message.schema_version, 1);
        assert_eq!(message.analysis_type, AnalysisType::Disease);
        assert_eq!(message.parameters, AnalysisParameters::default());
    }

    #[test]
    fn ignores_fields_added_by_newer_minor_revisions() {
        let payload = br#"{
            "schema_version": 1,
            "job_id": "6f1c2a1e-8d7b-4f0e-9a55-3b2f1c0d9e8a",
            "stored_file_id": "abc123",
            "analysis_type": "pest",
            "parameters": {"confidence_threshold": 0.5, "region": "north"},
            "enqueued_at": "2024-05-01T10:00:00Z",
            "trace_id": "xyz"
        }"#;
        let message = JobMessage::decode(payload).unwrap();
        assert_eq!(message.parameters.confidence_threshold, Some(0.5));
    }

    #[test]
    fn rejects_future_schema_versions() {
        let payload = br#"{
            "schema_version": 2,
            "job_id": "6f1c2a1e-8d7b-4f0e-9a55-3b2f1c0d9e8a",
            "stored_file_id": "abc123",
            "analysis_type": "pest",
            "enqueued_at": "2024-05-01T10:00:00Z"
        }"#;
        assert!(matches!(
            JobMessage::decode(payload),
            Err(MessageError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn message_carries_no_image_bytes() {
        let mut job = Job::new(
            crate::models::NewJob {
                job_id: Uuid::new_v4(),
                stored_file_id: "f".repeat(64),
                analysis_type: AnalysisType::Disease,
                parameters: AnalysisParameters::default(),
            },
            Utc::now(),
        );
        job.result = Some(serde_json::json!({"large": "x".repeat(10_000)}));
        let encoded = JobMessage::for_job(&job, Utc::now()).encode().unwrap();
        assert!(encoded.len() < 512);
    }
}
