use cropscan_core::AppError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Upload exceeds {limit} bytes (received at least {received})")]
    PayloadTooLarge { limit: u64, received: u64 },

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Upload is empty")]
    EmptyUpload,

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file id: {0}")]
    InvalidKey(String),

    #[error("Reference check failed: {0}")]
    ReferenceCheck(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Errors caused by the client's payload rather than the disk.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StorageError::PayloadTooLarge { .. }
                | StorageError::UnsupportedContentType(_)
                | StorageError::UnsupportedFormat(_)
                | StorageError::EmptyUpload
                | StorageError::InvalidKey(_)
        )
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::PayloadTooLarge { limit, received } => {
                AppError::PayloadTooLarge { limit, received }
            }
            StorageError::UnsupportedContentType(_)
            | StorageError::UnsupportedFormat(_)
            | StorageError::EmptyUpload
            | StorageError::InvalidKey(_) => AppError::Validation(err.to_string()),
            StorageError::NotFound(id) => AppError::NotFound(format!("File {} not found", id)),
            other => AppError::Storage(other.to_string()),
        }
    }
}
