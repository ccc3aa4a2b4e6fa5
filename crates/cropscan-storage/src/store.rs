use bytes::Bytes;
use chrono::{DateTime, Utc};
use cropscan_core::{ActiveFileReferences, ImageFormat, StoredFile};
use futures::{Stream, StreamExt};
use serde::Serialize;
use sha2::Digest;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::{StorageError, StorageResult};
use crate::format::{detect_format, validate_content_type};
use crate::upload::UploadHandle;

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const UPLOAD_PREFIX: &str = "upload-";
const RECORD_PREFIX: &str = "record-";

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub root: PathBuf,
    /// Default expiry applied at commit.
    pub file_ttl: Duration,
    pub supported_formats: Vec<ImageFormat>,
}

impl ObjectStoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_ttl: Duration::from_secs(86_400),
            supported_formats: vec![
                ImageFormat::Jpeg,
                ImageFormat::Png,
                ImageFormat::Webp,
                ImageFormat::Bmp,
                ImageFormat::Gif,
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub stored: StoredFile,
    /// True when identical bytes were already stored.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { size_bytes: u64 },
    NotExpired,
    /// Still needed by a queued or running job.
    Referenced,
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanSweep {
    pub removed: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_files: usize,
    pub total_size_bytes: u64,
    pub storage_root: String,
}

/// Content-addressed file store on local disk.
///
/// Shared by every upload handler and the reaper. Writes go to unique temp
/// paths; commits and expiry deletions are serialised on `commit_lock` so a
/// dedup extension can never interleave with a deletion of the same file.
pub struct ObjectStore {
    config: ObjectStoreConfig,
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
    index: RwLock<BTreeMap<String, StoredFile>>,
    commit_lock: Mutex<()>,
}

impl ObjectStore {
    /// Open (or create) a store and rebuild its index from the record files.
    pub async fn open(config: ObjectStoreConfig) -> StorageResult<Self> {
        let objects_dir = config.root.join(OBJECTS_DIR);
        let tmp_dir = config.root.join(TMP_DIR);
        for dir in [&objects_dir, &tmp_dir] {
            fs::create_dir_all(dir).await.map_err(|e| {
                StorageError::ConfigError(format!(
                    "Failed to create storage directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let index = load_index(&objects_dir).await?;
        tracing::info!(
            root = %config.root.display(),
            files = index.len(),
            "Object store opened"
        );

        Ok(Self {
            config,
            objects_dir,
            tmp_dir,
            index: RwLock::new(index),
            commit_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ObjectStoreConfig {
        &self.config
    }

    /// Open a scoped temp target and a running hash for a new upload.
    pub async fn begin_upload(
        &self,
        content_type: &str,
        max_size: u64,
    ) -> StorageResult<UploadHandle> {
        validate_content_type(content_type)?;

        let tmp_dir = self.tmp_dir.clone();
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(UPLOAD_PREFIX)
                .tempfile_in(tmp_dir)
        })
        .await
        .map_err(|e| StorageError::UploadFailed(format!("Temp file task failed: {}", e)))?
        .map_err(|e| StorageError::UploadFailed(format!("Failed to create temp file: {}", e)))?;

        let handle = UploadHandle::new(temp, max_size)?;
        tracing::debug!(upload_id = %handle.id(), content_type, max_size, "Upload started");
        Ok(handle)
    }

    /// Finalise the hash and atomically move the temp file to its content address.
    pub async fn commit_upload(&self, handle: UploadHandle) -> StorageResult<CommitOutcome> {
        self.commit_upload_with_ttl(handle, self.config.file_ttl)
            .await
    }

    #[tracing::instrument(skip(self, handle), fields(upload_id = %handle.id, size_bytes = handle.written))]
    pub async fn commit_upload_with_ttl(
        &self,
        mut handle: UploadHandle,
        ttl: Duration,
    ) -> StorageResult<CommitOutcome> {
        if handle.written == 0 {
            return Err(StorageError::EmptyUpload);
        }
        let format = detect_format(&handle.head).ok_or_else(|| {
            StorageError::UnsupportedFormat("content is not a recognised image".to_string())
        })?;
        if !self.config.supported_formats.contains(&format) {
            return Err(StorageError::UnsupportedFormat(format.to_string()));
        }

        handle
            .file
            .flush()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("Failed to flush upload: {}", e)))?;
        handle
            .file
            .sync_all()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("Failed to sync upload: {}", e)))?;

        let file_id = hex::encode(std::mem::take(&mut handle.hasher).finalize());
        let final_path = self.blob_path(&file_id)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let size_bytes = handle.written;
        let temp = handle
            .temp
            .take()
            .ok_or_else(|| StorageError::UploadFailed("Upload already committed".to_string()))?;

        let _guard = self.commit_lock.lock().await;

        let target = final_path.clone();
        let persisted = tokio::task::spawn_blocking(move || temp.persist_noclobber(target))
            .await
            .map_err(|e| StorageError::UploadFailed(format!("Commit task failed: {}", e)))?;

        let outcome = match persisted {
            Ok(_) => {
                let stored = StoredFile {
                    file_id: file_id.clone(),
                    path: final_path,
                    size_bytes,
                    format,
                    created_at: now,
                    expires_at,
                };
                self.write_record(&stored).await?;
                self.index.write().await.insert(file_id.clone(), stored.clone());
                CommitOutcome {
                    stored,
                    deduplicated: false,
                }
            }
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost the race or re-upload: our temp file is discarded on drop.
                drop(err.file);
                let existing = self.index.read().await.get(&file_id).cloned();
                let mut stored = match existing {
                    Some(record) => record,
                    None => StoredFile {
                        file_id: file_id.clone(),
                        path: final_path,
                        size_bytes,
                        format,
                        created_at: now,
                        expires_at,
                    },
                };
                stored.expires_at = stored.expires_at.max(expires_at);
                self.write_record(&stored).await?;
                self.index.write().await.insert(file_id.clone(), stored.clone());
                CommitOutcome {
                    stored,
                    deduplicated: true,
                }
            }
            Err(err) => {
                return Err(StorageError::UploadFailed(format!(
                    "Failed to move upload into place: {}",
                    err.error
                )))
            }
        };

        tracing::info!(
            file_id = %outcome.stored.file_id,
            size_bytes = outcome.stored.size_bytes,
            format = %outcome.stored.format,
            deduplicated = outcome.deduplicated,
            expires_at = %outcome.stored.expires_at,
            duration_ms = handle.started.elapsed().as_secs_f64() * 1000.0,
            "Upload committed"
        );

        Ok(outcome)
    }

    /// Stream a whole body into a new upload without committing it.
    ///
    /// The returned handle can be committed later or dropped, which removes the
    /// temp file. Any error along the way drops it too.
    pub async fn stage_stream<S, E>(
        &self,
        content_type: &str,
        max_size: u64,
        body: S,
    ) -> StorageResult<UploadHandle>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let mut handle = self.begin_upload(content_type, max_size).await?;
        let mut body = std::pin::pin!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                StorageError::UploadFailed(format!("Upload stream interrupted: {}", e))
            })?;
            handle.write_chunk(&chunk).await?;
        }
        Ok(handle)
    }

    /// Stream a whole body through `begin_upload` / `write_chunk` / `commit_upload`.
    pub async fn upload_stream<S, E>(
        &self,
        content_type: &str,
        max_size: u64,
        body: S,
    ) -> StorageResult<CommitOutcome>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let handle = self.stage_stream(content_type, max_size, body).await?;
        self.commit_upload(handle).await
    }

    pub async fn get(&self, file_id: &str) -> Option<StoredFile> {
        self.index.read().await.get(file_id).cloned()
    }

    pub async fn get_path(&self, file_id: &str) -> StorageResult<PathBuf> {
        self.get(file_id)
            .await
            .map(|f| f.path)
            .ok_or_else(|| StorageError::NotFound(file_id.to_string()))
    }

    /// True when the record exists and its blob is still on disk.
    pub async fn exists(&self, file_id: &str) -> bool {
        match self.get(file_id).await {
            Some(file) => fs::try_exists(&file.path).await.unwrap_or(false),
            None => false,
        }
    }

    /// Delete a file only if it has expired and no unfinished job references it.
    #[tracing::instrument(skip(self, references))]
    pub async fn delete_if_expired(
        &self,
        file_id: &str,
        now: DateTime<Utc>,
        references: &dyn ActiveFileReferences,
    ) -> StorageResult<DeleteOutcome> {
        let _guard = self.commit_lock.lock().await;

        let Some(record) = self.get(file_id).await else {
            return Ok(DeleteOutcome::Missing);
        };
        if !record.is_expired(now) {
            return Ok(DeleteOutcome::NotExpired);
        }
        let referenced = references
            .has_active_references(file_id)
            .await
            .map_err(|e| StorageError::ReferenceCheck(e.to_string()))?;
        if referenced {
            tracing::debug!(file_id, "Expired file still referenced, keeping");
            return Ok(DeleteOutcome::Referenced);
        }

        remove_if_present(&record.path).await?;
        remove_if_present(&record_path(&record.path)).await?;
        self.index.write().await.remove(file_id);

        tracing::info!(
            file_id,
            size_bytes = record.size_bytes,
            expired_at = %record.expires_at,
            "Expired file deleted"
        );
        Ok(DeleteOutcome::Deleted {
            size_bytes: record.size_bytes,
        })
    }

    /// Expired records with ids strictly after `after`, in id order.
    pub async fn list_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: usize,
    ) -> Vec<StoredFile> {
        let index = self.index.read().await;
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.to_string()),
            None => Bound::Unbounded,
        };
        index
            .range((lower, Bound::Unbounded))
            .map(|(_, file)| file)
            .filter(|file| file.is_expired(now))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove temp files untouched for longer than `grace`.
    ///
    /// Live uploads keep their modification time fresh, so only abandoned ones
    /// age past the grace period.
    pub async fn sweep_orphans(&self, grace: Duration, limit: usize) -> StorageResult<OrphanSweep> {
        let mut sweep = OrphanSweep::default();
        let mut entries = fs::read_dir(&self.tmp_dir).await?;
        let now = SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            if sweep.removed as usize >= limit {
                break;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < grace {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    sweep.removed += 1;
                    sweep.bytes += metadata.len();
                    tracing::debug!(path = %entry.path().display(), age_secs = age.as_secs(), "Orphaned temp file removed");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove orphaned temp file");
                }
            }
        }

        Ok(sweep)
    }

    pub async fn stats(&self) -> StoreStats {
        let index = self.index.read().await;
        StoreStats {
            total_files: index.len(),
            total_size_bytes: index.values().map(|f| f.size_bytes).sum(),
            storage_root: self.config.root.display().to_string(),
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    fn blob_path(&self, file_id: &str) -> StorageResult<PathBuf> {
        if file_id.len() != 64 || !file_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidKey(file_id.to_string()));
        }
        Ok(self.objects_dir.join(&file_id[..2]).join(file_id))
    }

    async fn write_record(&self, stored: &StoredFile) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(stored)
            .map_err(|e| StorageError::UploadFailed(format!("Failed to encode record: {}", e)))?;
        let tmp_dir = self.tmp_dir.clone();
        let target = record_path(&stored.path);

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut temp = tempfile::Builder::new()
                .prefix(RECORD_PREFIX)
                .tempfile_in(tmp_dir)?;
            temp.write_all(&json)?;
            temp.as_file().sync_all()?;
            temp.persist(target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::UploadFailed(format!("Record task failed: {}", e)))?
        .map_err(|e| StorageError::UploadFailed(format!("Failed to write record: {}", e)))
    }
}

fn record_path(blob: &Path) -> PathBuf {
    blob.with_extension("json")
}

async fn remove_if_present(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::DeleteFailed(format!(
            "Failed to delete {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn load_index(objects_dir: &Path) -> StorageResult<BTreeMap<String, StoredFile>> {
    let mut index = BTreeMap::new();
    let mut shards = fs::read_dir(objects_dir).await?;
    while let Some(shard) = shards.next_entry().await? {
        if !shard.file_type().await?.is_dir() {
            continue;
        }
        let mut entries = fs::read_dir(shard.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: StoredFile = match fs::read(&path)
                .await
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok())
            {
                Some(record) => record,
                None => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable file record");
                    continue;
                }
            };
            if !fs::try_exists(&record.path).await.unwrap_or(false) {
                tracing::warn!(file_id = %record.file_id, "Record without blob, dropping");
                remove_if_present(&path).await?;
                continue;
            }
            index.insert(record.file_id.clone(), record);
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sha2::Sha256;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FixedReferences(bool);

    #[async_trait]
    impl ActiveFileReferences for FixedReferences {
        async fn has_active_references(&self, _file_id: &str) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    fn png_bytes(len: usize, seed: u8) -> Vec<u8> {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend((0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)));
        data
    }

    async fn upload(store: &ObjectStore, data: &[u8], chunk: usize) -> StorageResult<CommitOutcome> {
        let mut handle = store.begin_upload("image/png", 1024 * 1024).await?;
        for part in data.chunks(chunk) {
            handle.write_chunk(part).await?;
        }
        store.commit_upload(handle).await
    }

    async fn count_files(dir: &Path) -> usize {
        let mut count = 0;
        let mut stack = vec![dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await.unwrap();
            while let Some(entry) = entries.next_entry().await.unwrap() {
                if entry.file_type().await.unwrap().is_dir() {
                    stack.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn test_commit_is_content_addressed() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();
        let data = png_bytes(10_000, 1);

        let outcome = upload(&store, &data, 1000).await.unwrap();

        assert!(!outcome.deduplicated);
        assert_eq!(outcome.stored.file_id, hex::encode(Sha256::digest(&data)));
        assert_eq!(outcome.stored.size_bytes, data.len() as u64);
        assert_eq!(outcome.stored.format, ImageFormat::Png);
        assert_eq!(fs::read(&outcome.stored.path).await.unwrap(), data);
        assert!(store.exists(&outcome.stored.file_id).await);
        assert_eq!(count_files(store.tmp_dir()).await, 0);
    }

    #[tokio::test]
    async fn test_identical_uploads_share_one_file_and_extend_expiry() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();
        let data = png_bytes(4096, 7);

        let mut first = store.begin_upload("image/png", 1 << 20).await.unwrap();
        first.write_chunk(&data).await.unwrap();
        let first = store
            .commit_upload_with_ttl(first, Duration::from_secs(60))
            .await
            .unwrap();

        let mut second = store.begin_upload("image/png", 1 << 20).await.unwrap();
        second.write_chunk(&data).await.unwrap();
        let second = store
            .commit_upload_with_ttl(second, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(second.deduplicated);
        assert_eq!(first.stored.file_id, second.stored.file_id);
        assert!(second.stored.expires_at > first.stored.expires_at);
        assert_eq!(second.stored.created_at, first.stored.created_at);

        // A later upload with a shorter ttl never shortens the expiry.
        let mut third = store.begin_upload("image/png", 1 << 20).await.unwrap();
        third.write_chunk(&data).await.unwrap();
        let third = store
            .commit_upload_with_ttl(third, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(third.stored.expires_at, second.stored.expires_at);

        // One blob plus its record.
        assert_eq!(count_files(&dir.path().join(OBJECTS_DIR)).await, 2);
        assert_eq!(store.stats().await.total_files, 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_uploads_converge() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap());
        let data = Arc::new(png_bytes(64 * 1024, 3));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move { upload(&store, &data, 4096).await }));
        }

        let mut ids = Vec::new();
        let mut fresh = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            if !outcome.deduplicated {
                fresh += 1;
            }
            ids.push(outcome.stored.file_id);
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(fresh, 1);
        assert_eq!(count_files(&dir.path().join(OBJECTS_DIR)).await, 2);
        assert_eq!(count_files(store.tmp_dir()).await, 0);
    }

    #[tokio::test]
    async fn test_one_byte_over_limit_is_rejected_before_commit() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();
        let limit = 8192u64;
        let data = png_bytes(limit as usize - 8 + 1, 9);
        assert_eq!(data.len() as u64, limit + 1);

        let mut handle = store.begin_upload("image/png", limit).await.unwrap();
        let mut result = Ok(());
        for part in data.chunks(1000) {
            result = handle.write_chunk(part).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(StorageError::PayloadTooLarge { limit: 8192, received: 8193 })
        ));
        assert!(handle.bytes_written() <= limit);
        drop(handle);

        assert_eq!(count_files(store.tmp_dir()).await, 0);
        assert_eq!(count_files(&dir.path().join(OBJECTS_DIR)).await, 0);
    }

    #[tokio::test]
    async fn test_exactly_at_limit_is_accepted() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();
        let data = png_bytes(4088, 2);

        let mut handle = store.begin_upload("image/png", 4096).await.unwrap();
        handle.write_chunk(&data).await.unwrap();
        let outcome = store.commit_upload(handle).await.unwrap();
        assert_eq!(outcome.stored.size_bytes, 4096);
    }

    #[tokio::test]
    async fn test_non_image_content_is_rejected() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();

        let mut handle = store
            .begin_upload("application/octet-stream", 1024)
            .await
            .unwrap();
        handle.write_chunk(b"%PDF-1.7 not an image").await.unwrap();
        let err = store.commit_upload(handle).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedFormat(_)));
        assert!(err.is_validation());
        assert_eq!(count_files(store.tmp_dir()).await, 0);

        let err = store.begin_upload("text/html", 1024).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedContentType(_)));
    }

    #[tokio::test]
    async fn test_disabled_format_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = ObjectStoreConfig::new(dir.path());
        config.supported_formats = vec![ImageFormat::Jpeg];
        let store = ObjectStore::open(config).await.unwrap();

        let err = upload(&store, &png_bytes(100, 0), 50).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedFormat(f) if f == "png"));
    }

    #[tokio::test]
    async fn test_delete_if_expired_respects_ttl_and_references() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();

        let mut handle = store.begin_upload("image/png", 1 << 20).await.unwrap();
        handle.write_chunk(&png_bytes(500, 4)).await.unwrap();
        let expired = store
            .commit_upload_with_ttl(handle, Duration::ZERO)
            .await
            .unwrap()
            .stored;

        let mut handle = store.begin_upload("image/png", 1 << 20).await.unwrap();
        handle.write_chunk(&png_bytes(500, 5)).await.unwrap();
        let fresh = store.commit_upload(handle).await.unwrap().stored;

        let now = Utc::now();
        assert_eq!(
            store
                .delete_if_expired(&fresh.file_id, now, &FixedReferences(false))
                .await
                .unwrap(),
            DeleteOutcome::NotExpired
        );
        assert_eq!(
            store
                .delete_if_expired(&expired.file_id, now, &FixedReferences(true))
                .await
                .unwrap(),
            DeleteOutcome::Referenced
        );
        assert!(store.exists(&expired.file_id).await);

        assert_eq!(
            store
                .delete_if_expired(&expired.file_id, now, &FixedReferences(false))
                .await
                .unwrap(),
            DeleteOutcome::Deleted { size_bytes: 508 }
        );
        assert!(!store.exists(&expired.file_id).await);
        assert!(!fs::try_exists(&expired.path).await.unwrap());
        assert_eq!(
            store
                .delete_if_expired(&expired.file_id, now, &FixedReferences(false))
                .await
                .unwrap(),
            DeleteOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_list_expired_paginates_by_cursor() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();
        for seed in 0..5 {
            let mut handle = store.begin_upload("image/png", 1 << 20).await.unwrap();
            handle.write_chunk(&png_bytes(100, seed)).await.unwrap();
            store
                .commit_upload_with_ttl(handle, Duration::ZERO)
                .await
                .unwrap();
        }

        let now = Utc::now();
        let first = store.list_expired(now, None, 3).await;
        assert_eq!(first.len(), 3);
        let cursor = first.last().map(|f| f.file_id.clone());
        let rest = store.list_expired(now, cursor.as_deref(), 3).await;
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|f| !first.contains(f)));
    }

    #[tokio::test]
    async fn test_orphan_sweep_honours_grace_period() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();

        // An abandoned upload: the temp file outlives its handle.
        let mut handle = store.begin_upload("image/png", 1 << 20).await.unwrap();
        handle.write_chunk(&png_bytes(2000, 8)).await.unwrap();
        handle.file.flush().await.unwrap();
        let temp = handle.temp.take().unwrap();
        let (_, path) = temp.keep().unwrap();
        drop(handle);
        assert!(fs::try_exists(&path).await.unwrap());

        let kept = store
            .sweep_orphans(Duration::from_secs(3600), 100)
            .await
            .unwrap();
        assert_eq!(kept.removed, 0);

        let swept = store.sweep_orphans(Duration::ZERO, 100).await.unwrap();
        assert_eq!(swept.removed, 1);
        assert_eq!(swept.bytes, 2008);
        assert!(!fs::try_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        let file_id = {
            let store = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();
            upload(&store, &png_bytes(300, 6), 100)
                .await
                .unwrap()
                .stored
                .file_id
        };

        let reopened = ObjectStore::open(ObjectStoreConfig::new(dir.path())).await.unwrap();
        assert!(reopened.exists(&file_id).await);
        assert_eq!(reopened.stats().await.total_files, 1);
    }
}
