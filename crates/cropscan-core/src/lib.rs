//! Core domain types for cropscan.
//!
//! Holds the models shared by every other crate (stored files, jobs, the queue
//! wire message), the job lifecycle state machine, the error taxonomy and the
//! environment-driven configuration.

pub mod backoff;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod processing_error;
pub mod references;

pub use backoff::RetryBackoff;
pub use config::Config;
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use lifecycle::{apply_event, next_status, InvalidTransition, JobEvent, Transition};
pub use models::{
    AnalysisParameters, AnalysisType, ImageFormat, Job, JobFailure, JobMessage, JobStatus,
    MessageError, NewJob, StoredFile, JOB_MESSAGE_SCHEMA_VERSION, PUBLISH_CONFIRM_GRACE_SECS,
};
pub use processing_error::{FailureKind, ProcessingError, ProcessingResultExt};
pub use references::ActiveFileReferences;
