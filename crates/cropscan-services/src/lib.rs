//! Cropscan services
//!
//! Background and request-path services built on the storage, job store and
//! queue crates:
//!
//! - [`JobIntakeService`]: stores an upload, creates the job, publishes its descriptor
//! - [`Reaper`]: expires files, reaps old jobs and sweeps abandoned temp uploads
//! - [`RepublishService`]: re-publishes jobs whose initial publish failed

pub mod intake;
pub mod reaper;
pub mod republish;

pub use intake::{EnqueueRequest, IntakeConfig, JobIntakeService, SubmittedJob};
pub use reaper::{CleanupReport, Reaper, ReaperConfig, ReaperStats};
pub use republish::{RepublishConfig, RepublishService};
