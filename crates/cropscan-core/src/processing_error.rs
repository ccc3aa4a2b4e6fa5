//! Vision Service failure classification
//!
//! A [`ProcessingError`] tells the worker what to do next: retry the job later,
//! fail it permanently, or treat it as a cooperative cancellation.

use std::fmt;

use crate::models::JobFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, 5xx responses, connection errors.
    Retryable,
    /// 4xx responses, missing files, undecodable results.
    Permanent,
    /// The service honoured a cancellation token mid-call.
    Cancelled,
}

#[derive(Debug)]
pub struct ProcessingError {
    inner: anyhow::Error,
    kind: FailureKind,
    code: &'static str,
}

impl ProcessingError {
    /// Error that will be retried until the job's retry ceiling is reached.
    pub fn retryable(code: &'static str, err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            kind: FailureKind::Retryable,
            code,
        }
    }

    /// Error that fails the job immediately, whatever attempts remain.
    pub fn permanent(code: &'static str, err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            kind: FailureKind::Permanent,
            code,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            inner: anyhow::anyhow!("Analysis cancelled before completion"),
            kind: FailureKind::Cancelled,
            code: "cancelled",
        }
    }

    /// Call-level timeout; always retryable.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::retryable(
            "vision_timeout",
            anyhow::anyhow!("Vision service did not respond within {:?}", after),
        )
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Structured cause stored on the job record.
    pub fn to_failure(&self, attempts: i32) -> JobFailure {
        JobFailure {
            code: self.code.to_string(),
            message: self.inner.to_string(),
            attempts,
            retryable: self.is_retryable(),
        }
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.inner)
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for ProcessingError {
    /// Unclassified failures are assumed transient
    fn from(err: anyhow::Error) -> Self {
        Self::retryable("processing_error", err)
    }
}

/// Extension trait for classifying `Result`s at the call site
pub trait ProcessingResultExt<T> {
    fn permanent(self, code: &'static str) -> Result<T, ProcessingError>;
    fn retryable(self, code: &'static str) -> Result<T, ProcessingError>;
}

impl<T, E: Into<anyhow::Error>> ProcessingResultExt<T> for Result<T, E> {
    fn permanent(self, code: &'static str) -> Result<T, ProcessingError> {
        self.map_err(|e| ProcessingError::permanent(code, e))
    }

    fn retryable(self, code: &'static str) -> Result<T, ProcessingError> {
        self.map_err(|e| ProcessingError::retryable(code, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_permanent_error() {
        let err = ProcessingError::permanent("vision_rejected", anyhow::anyhow!("HTTP 422"));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert!(err.to_string().contains("HTTP 422"));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = ProcessingError::timeout(Duration::from_secs(120));
        assert!(err.is_retryable());
        assert_eq!(err.code(), "vision_timeout");
    }

    #[test]
    fn test_from_anyhow_defaults_to_retryable() {
        let err: ProcessingError = anyhow::anyhow!("connection reset").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failure_record() {
        let result: Result<(), anyhow::Error> = Err(anyhow::anyhow!("bad image"));
        let err = result.permanent("vision_rejected").unwrap_err();
        let failure = err.to_failure(2);
        assert_eq!(failure.code, "vision_rejected");
        assert_eq!(failure.attempts, 2);
        assert!(!failure.retryable);
    }
}
