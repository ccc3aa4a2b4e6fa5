use async_trait::async_trait;

/// Answers whether a stored file is still needed by unfinished work.
///
/// Implemented by the job store; consulted by the object store before any
/// expiry-driven deletion.
#[async_trait]
pub trait ActiveFileReferences: Send + Sync {
    /// True when at least one non-terminal job references `file_id`.
    async fn has_active_references(&self, file_id: &str) -> anyhow::Result<bool>;
}
