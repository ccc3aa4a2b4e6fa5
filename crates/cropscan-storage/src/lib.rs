//! cropscan object store
//!
//! Uploads are streamed chunk-by-chunk into a scoped temp file while a SHA-256
//! is accumulated, then atomically renamed to a content-addressed path:
//!
//! - **Blobs**: `objects/{id[0..2]}/{id}`
//! - **Records**: `objects/{id[0..2]}/{id}.json`
//! - **In-flight uploads**: `tmp/upload-*`
//!
//! The rename is the single commit point. A second upload of the same bytes
//! loses the rename, discards its temp file and extends the winner's expiry.

pub mod error;
pub mod format;
pub mod store;
pub mod upload;

pub use error::{StorageError, StorageResult};
pub use format::{detect_format, validate_content_type};
pub use store::{
    CommitOutcome, DeleteOutcome, ObjectStore, ObjectStoreConfig, OrphanSweep, StoreStats,
};
pub use upload::UploadHandle;
