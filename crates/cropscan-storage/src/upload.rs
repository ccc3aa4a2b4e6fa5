use sha2::{Digest, Sha256};
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::format::SNIFF_LEN;

/// An in-flight upload.
///
/// Owns a uniquely named temp file plus the running hash. Memory held is the
/// hasher state and the first few bytes kept for format sniffing, whatever the
/// upload size. Dropping an uncommitted handle removes the temp file.
pub struct UploadHandle {
    pub(crate) id: Uuid,
    pub(crate) temp: Option<NamedTempFile>,
    pub(crate) file: tokio::fs::File,
    pub(crate) hasher: Sha256,
    pub(crate) written: u64,
    pub(crate) max_size: u64,
    pub(crate) head: Vec<u8>,
    pub(crate) started: Instant,
}

impl UploadHandle {
    pub(crate) fn new(temp: NamedTempFile, max_size: u64) -> StorageResult<Self> {
        let file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
        Ok(Self {
            id: Uuid::new_v4(),
            temp: Some(temp),
            file,
            hasher: Sha256::new(),
            written: 0,
            max_size,
            head: Vec::with_capacity(SNIFF_LEN),
            started: Instant::now(),
        })
    }

    /// Append a chunk to the temp file and the hash.
    ///
    /// Fails with `PayloadTooLarge` before writing any byte of a chunk that would
    /// push the total past `max_size`.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> StorageResult<()> {
        let received = self.written + chunk.len() as u64;
        if received > self.max_size {
            tracing::debug!(
                upload_id = %self.id,
                limit = self.max_size,
                received,
                "Upload exceeded size limit"
            );
            return Err(StorageError::PayloadTooLarge {
                limit: self.max_size,
                received,
            });
        }

        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }

        self.hasher.update(chunk);
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| StorageError::UploadFailed(format!("Failed to write chunk: {}", e)))?;
        self.written = received;
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes held in memory by the handle itself, excluding the hasher state.
    pub fn buffered_len(&self) -> usize {
        self.head.len()
    }
}

impl std::fmt::Debug for UploadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadHandle")
            .field("id", &self.id)
            .field("written", &self.written)
            .field("max_size", &self.max_size)
            .finish()
    }
}
