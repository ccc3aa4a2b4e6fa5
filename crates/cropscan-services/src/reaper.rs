use chrono::{DateTime, Utc};
use cropscan_core::Config;
use cropscan_db::{JobFileReferences, JobStore};
use cropscan_storage::{DeleteOutcome, ObjectStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Upper bound on pages a single forced cleanup may run.
const FORCE_CLEANUP_MAX_PAGES: usize = 100;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Max items handled per duty per tick.
    pub page_size: usize,
    pub job_retention: Duration,
    pub orphan_grace_period: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            page_size: 500,
            job_retention: Duration::from_secs(7 * 86_400),
            orphan_grace_period: Duration::from_secs(900),
        }
    }
}

impl From<&Config> for ReaperConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.cleanup_interval,
            page_size: config.cleanup_page_size,
            job_retention: config.job_retention,
            orphan_grace_period: config.orphan_grace_period,
        }
    }
}

/// Work done by one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted_files: u64,
    pub space_reclaimed_bytes: u64,
    pub jobs_reaped: u64,
    pub orphans_swept: u64,
    /// Expired files kept because a job still needs them.
    pub referenced_files_skipped: u64,
}

impl CleanupReport {
    fn did_work(&self) -> bool {
        self.deleted_files + self.jobs_reaped + self.orphans_swept > 0
    }

    fn merge(&mut self, other: &CleanupReport) {
        self.deleted_files += other.deleted_files;
        self.space_reclaimed_bytes += other.space_reclaimed_bytes;
        self.jobs_reaped += other.jobs_reaped;
        self.orphans_swept += other.orphans_swept;
        self.referenced_files_skipped += other.referenced_files_skipped;
    }
}

/// Running totals since startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaperStats {
    pub files_deleted: u64,
    pub space_reclaimed_bytes: u64,
    pub jobs_reaped: u64,
    pub orphans_swept: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Periodic space reclamation.
///
/// Each tick handles at most one page per duty: expired files (skipping those
/// an unfinished job references), terminal jobs past retention, and abandoned
/// temp uploads. Expired files are walked with a rotating cursor so a run of
/// referenced files cannot starve the rest of the backlog.
pub struct Reaper {
    files: Arc<ObjectStore>,
    jobs: Arc<dyn JobStore>,
    config: ReaperConfig,
    cursor: Mutex<Option<String>>,
    stats: RwLock<ReaperStats>,
}

impl Reaper {
    pub fn new(files: Arc<ObjectStore>, jobs: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self {
            files,
            jobs,
            config,
            cursor: Mutex::new(None),
            stats: RwLock::new(ReaperStats::default()),
        }
    }

    /// Start the background cleanup task. Returns a JoinHandle for shutdown.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                interval_secs = self.config.interval.as_secs(),
                page_size = self.config.page_size,
                "Reaper started"
            );

            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// Run one page of every duty.
    pub async fn tick(&self) -> CleanupReport {
        self.run_page().await.0
    }

    /// Keep ticking until a tick finds nothing to do or the page cap is hit.
    #[tracing::instrument(skip(self))]
    pub async fn force_cleanup(&self) -> CleanupReport {
        let mut total = CleanupReport::default();
        for _ in 0..FORCE_CLEANUP_MAX_PAGES {
            let (report, more_pending) = self.run_page().await;
            total.merge(&report);
            if !report.did_work() && !more_pending {
                break;
            }
        }
        tracing::info!(
            deleted_files = total.deleted_files,
            space_reclaimed_bytes = total.space_reclaimed_bytes,
            jobs_reaped = total.jobs_reaped,
            orphans_swept = total.orphans_swept,
            "Forced cleanup finished"
        );
        total
    }

    pub async fn stats(&self) -> ReaperStats {
        self.stats.read().await.clone()
    }

    /// Returns the page report and whether the file cursor has more pages.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "tick"))]
    async fn run_page(&self) -> (CleanupReport, bool) {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        let more_pending = self.expire_files(now, &mut report).await;
        self.reap_jobs(now, &mut report).await;
        self.sweep_orphans(&mut report).await;

        {
            let mut stats = self.stats.write().await;
            stats.files_deleted += report.deleted_files;
            stats.space_reclaimed_bytes += report.space_reclaimed_bytes;
            stats.jobs_reaped += report.jobs_reaped;
            stats.orphans_swept += report.orphans_swept;
            stats.last_run_at = Some(now);
        }

        if report.did_work() {
            tracing::info!(
                deleted_files = report.deleted_files,
                space_reclaimed_bytes = report.space_reclaimed_bytes,
                jobs_reaped = report.jobs_reaped,
                orphans_swept = report.orphans_swept,
                referenced_skipped = report.referenced_files_skipped,
                "Cleanup tick completed"
            );
        } else {
            tracing::debug!(
                referenced_skipped = report.referenced_files_skipped,
                "Cleanup tick found nothing to reclaim"
            );
        }
        (report, more_pending)
    }

    async fn expire_files(&self, now: DateTime<Utc>, report: &mut CleanupReport) -> bool {
        let mut cursor = self.cursor.lock().await;
        let page = self
            .files
            .list_expired(now, cursor.as_deref(), self.config.page_size)
            .await;
        let references = JobFileReferences(self.jobs.clone());

        for file in &page {
            match self
                .files
                .delete_if_expired(&file.file_id, now, &references)
                .await
            {
                Ok(DeleteOutcome::Deleted { size_bytes }) => {
                    report.deleted_files += 1;
                    report.space_reclaimed_bytes += size_bytes;
                }
                Ok(DeleteOutcome::Referenced) => report.referenced_files_skipped += 1,
                Ok(DeleteOutcome::NotExpired | DeleteOutcome::Missing) => {}
                Err(e) => {
                    tracing::warn!(file_id = %file.file_id, error = %e, "Failed to delete expired file");
                }
            }
        }

        let full_page = self.config.page_size > 0 && page.len() >= self.config.page_size;
        *cursor = if full_page {
            page.last().map(|f| f.file_id.clone())
        } else {
            None
        };
        full_page
    }

    async fn reap_jobs(&self, now: DateTime<Utc>, report: &mut CleanupReport) {
        let retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return;
        };
        match self
            .jobs
            .delete_terminal_before(cutoff, self.config.page_size)
            .await
        {
            Ok(count) => report.jobs_reaped += count,
            Err(e) => tracing::warn!(error = %e, "Failed to reap finished jobs"),
        }
    }

    async fn sweep_orphans(&self, report: &mut CleanupReport) {
        match self
            .files
            .sweep_orphans(self.config.orphan_grace_period, self.config.page_size)
            .await
        {
            Ok(sweep) => report.orphans_swept += sweep.removed,
            Err(e) => tracing::warn!(error = %e, "Failed to sweep orphaned uploads"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropscan_core::{AnalysisParameters, AnalysisType, JobEvent, NewJob};
    use cropscan_db::InMemoryJobStore;
    use cropscan_storage::ObjectStoreConfig;
    use uuid::Uuid;

    async fn store_expired(files: &ObjectStore, seed: u8) -> String {
        let mut png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend([seed; 64]);
        let mut handle = files.begin_upload("image/png", 1 << 20).await.unwrap();
        handle.write_chunk(&png).await.unwrap();
        files
            .commit_upload_with_ttl(handle, Duration::ZERO)
            .await
            .unwrap()
            .stored
            .file_id
    }

    async fn setup(
        config: ReaperConfig,
    ) -> (tempfile::TempDir, Arc<ObjectStore>, Arc<InMemoryJobStore>, Reaper) {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(
            ObjectStore::open(ObjectStoreConfig::new(dir.path()))
                .await
                .unwrap(),
        );
        let jobs = Arc::new(InMemoryJobStore::new());
        let reaper = Reaper::new(files.clone(), jobs.clone(), config);
        (dir, files, jobs, reaper)
    }

    #[tokio::test]
    async fn test_tick_deletes_unreferenced_expired_files() {
        let (_dir, files, jobs, reaper) = setup(ReaperConfig::default()).await;
        let free = store_expired(&files, 1).await;
        let held = store_expired(&files, 2).await;
        jobs.create(NewJob {
            job_id: Uuid::new_v4(),
            stored_file_id: held.clone(),
            analysis_type: AnalysisType::Disease,
            parameters: AnalysisParameters::default(),
        })
        .await
        .unwrap();

        let report = reaper.tick().await;
        assert_eq!(report.deleted_files, 1);
        assert_eq!(report.referenced_files_skipped, 1);
        assert!(!files.exists(&free).await);
        assert!(files.exists(&held).await);

        let stats = reaper.stats().await;
        assert_eq!(stats.files_deleted, 1);
        assert!(stats.space_reclaimed_bytes > 0);
        assert!(stats.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_referenced_page_does_not_starve_backlog() {
        let (_dir, files, jobs, reaper) = setup(ReaperConfig {
            page_size: 2,
            ..ReaperConfig::default()
        })
        .await;
        let mut ids = Vec::new();
        for seed in 0..6 {
            ids.push(store_expired(&files, seed).await);
        }
        ids.sort();
        // The first page in id order is entirely referenced.
        for id in &ids[..2] {
            jobs.create(NewJob {
                job_id: Uuid::new_v4(),
                stored_file_id: id.clone(),
                analysis_type: AnalysisType::Pest,
                parameters: AnalysisParameters::default(),
            })
            .await
            .unwrap();
        }

        let first = reaper.tick().await;
        assert_eq!(first.deleted_files, 0);
        assert_eq!(first.referenced_files_skipped, 2);

        let second = reaper.tick().await;
        assert_eq!(second.deleted_files, 2);

        let report = reaper.force_cleanup().await;
        assert_eq!(report.deleted_files, 2);
        assert_eq!(files.stats().await.total_files, 2);
    }

    #[tokio::test]
    async fn test_finished_jobs_reaped_after_retention() {
        let (_dir, _files, jobs, reaper) = setup(ReaperConfig {
            job_retention: Duration::ZERO,
            ..ReaperConfig::default()
        })
        .await;

        let running = jobs
            .create(NewJob {
                job_id: Uuid::new_v4(),
                stored_file_id: "aa".repeat(32),
                analysis_type: AnalysisType::Pest,
                parameters: AnalysisParameters::default(),
            })
            .await
            .unwrap();
        let done = jobs
            .create(NewJob {
                job_id: Uuid::new_v4(),
                stored_file_id: "bb".repeat(32),
                analysis_type: AnalysisType::Pest,
                parameters: AnalysisParameters::default(),
            })
            .await
            .unwrap();
        jobs.apply(done.job_id, JobEvent::CancelObserved).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = reaper.tick().await;
        assert_eq!(report.jobs_reaped, 1);
        assert!(jobs.get(done.job_id).await.unwrap().is_none());
        assert!(jobs.get(running.job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_orphaned_temp_uploads_are_swept() {
        let (_dir, files, _jobs, reaper) = setup(ReaperConfig {
            orphan_grace_period: Duration::ZERO,
            ..ReaperConfig::default()
        })
        .await;
        std::fs::write(files.tmp_dir().join("upload-crashed"), b"partial").unwrap();

        let report = reaper.tick().await;
        assert_eq!(report.orphans_swept, 1);
        assert_eq!(reaper.stats().await.orphans_swept, 1);
    }
}
