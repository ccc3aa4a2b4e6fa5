//! Cropscan worker: queue consumer and Vision Service adapter.
//!
//! The [`WorkerPool`] receives job descriptors, claims the job in the status
//! store, calls the external [`VisionService`] under a timeout and records the
//! outcome before acking. Cancellation is checked before the claim, after it,
//! and during the call through a [`CancellationToken`](tokio_util::sync::CancellationToken).

mod pool;
mod vision;

pub use pool::{Outcome, WorkerConfig, WorkerPool};
pub use vision::{HttpVisionClient, VisionError, VisionRequest, VisionService};
