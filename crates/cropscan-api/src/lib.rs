//! HTTP gateway for cropscan.
//!
//! A thin translation layer over the intake service, the job status store and
//! the reaper. All long-running work happens in the background services wired
//! up by [`setup::initialize_app`].

pub mod error;
pub mod handlers;
pub mod setup;
pub mod state;
pub mod telemetry;

pub use error::{ErrorResponse, HttpAppError};
pub use setup::services::{Backends, BackgroundTasks};
pub use state::AppState;
