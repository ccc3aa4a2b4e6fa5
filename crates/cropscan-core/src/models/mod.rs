pub mod analysis;
pub mod file;
pub mod job;
pub mod message;

pub use analysis::{AnalysisParameters, AnalysisType};
pub use file::{ImageFormat, StoredFile};
pub use job::{Job, JobFailure, JobStatus, NewJob, PUBLISH_CONFIRM_GRACE_SECS};
pub use message::{JobMessage, MessageError, JOB_MESSAGE_SCHEMA_VERSION};
