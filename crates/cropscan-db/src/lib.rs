//! Job status store
//!
//! All mutation goes through keyed, conditional operations: status changes are
//! computed by the pure lifecycle functions in `cropscan-core` and written with
//! a compare-and-swap on the prior `(status, attempts)`.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{JobStoreError, JobStoreResult};
pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{Applied, CancelOutcome, JobFileReferences, JobStore};
