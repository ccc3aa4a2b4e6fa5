use cropscan_core::{AppError, MessageError};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The lease behind this receipt expired and the message moved on.
    #[error("Stale or unknown delivery receipt {0}")]
    StaleReceipt(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Broker unavailable after {attempts} attempts: {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },

    #[error(transparent)]
    Encode(#[from] MessageError),
}

impl From<PublishError> for AppError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::BrokerUnavailable { .. } => AppError::BrokerUnavailable(err.to_string()),
            PublishError::Encode(e) => AppError::Internal(e.to_string()),
        }
    }
}
