use crate::error::{Result, ResultIoExt};
use crate::models::StorageUsage;
use crate::store::UploadStore;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Answers "can N more bytes be written?" against the configured storage
/// budget.
///
/// Usage is measured from the filesystem at call time, so admission is
/// advisory: racing writers may oversubscribe by at most one in-flight
/// chunk each before the next admission check reconciles.
#[derive(Clone)]
pub struct QuotaAccountant {
    uploads_path: PathBuf,
    files_path: PathBuf,
    max_storage_size: Option<u64>,
    store: UploadStore,
}

async fn dir_size(path: &Path) -> Result<u64> {
    if !fs::try_exists(path).await.map_io_err(path)? {
        return Ok(0);
    }

    let mut total = 0;
    let mut entries = fs::read_dir(path).await.map_io_err(path)?;
    while let Some(entry) = entries.next_entry().await.map_io_err(path)? {
        if let Ok(metadata) = entry.metadata().await
            && metadata.is_file()
        {
            total += metadata.len();
        }
    }

    Ok(total)
}

impl QuotaAccountant {
    pub fn new(
        uploads_path: impl Into<PathBuf>,
        files_path: impl Into<PathBuf>,
        max_storage_size: Option<u64>,
        store: UploadStore,
    ) -> Self {
        Self {
            uploads_path: uploads_path.into(),
            files_path: files_path.into(),
            max_storage_size,
            store,
        }
    }

    /// Snapshot of on-disk usage plus record counts.
    pub async fn get_storage_usage(&self) -> Result<StorageUsage> {
        let used = dir_size(&self.uploads_path).await? + dir_size(&self.files_path).await?;

        let files_count = self.store.list_files().await?.len();
        let uploads_count = self.store.list_uploads(false, true).await?.len();

        let usage = match self.max_storage_size {
            Some(max) => StorageUsage {
                used,
                max: Some(max),
                available: Some(max.saturating_sub(used)),
                usage_percent: if max > 0 {
                    ((used as f64 / max as f64) * 10000.0).round() / 100.0
                } else {
                    0.0
                },
                is_full: used >= max,
                files_count,
                uploads_count,
            },
            None => StorageUsage {
                used,
                max: None,
                available: None,
                usage_percent: 0.0,
                is_full: false,
                files_count,
                uploads_count,
            },
        };

        Ok(usage)
    }

    /// True iff `additional` more bytes fit under the budget (or the budget
    /// is unlimited). Also returns the usage snapshot for error reporting.
    pub async fn check_quota(&self, additional: u64) -> Result<(bool, StorageUsage)> {
        let usage = self.get_storage_usage().await?;

        let allowed = match self.max_storage_size {
            Some(max) => usage.used + additional <= max,
            None => true,
        };

        Ok((allowed, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateManager;
    use tempfile::TempDir;

    fn accountant(dir: &TempDir, max: Option<u64>) -> QuotaAccountant {
        let uploads = dir.path().join("uploads");
        let files = dir.path().join("files");
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::create_dir_all(&files).unwrap();
        QuotaAccountant::new(uploads, files, max, UploadStore::new(StateManager::memory()))
    }

    #[tokio::test]
    async fn test_unlimited_quota_always_admits() {
        let dir = TempDir::new().unwrap();
        let quota = accountant(&dir, None);

        let (allowed, usage) = quota.check_quota(u64::MAX / 2).await.unwrap();
        assert!(allowed);
        assert!(usage.max.is_none());
        assert!(!usage.is_full);
        assert_eq!(usage.usage_percent, 0.0);
    }

    #[tokio::test]
    async fn test_usage_sums_both_directories() {
        let dir = TempDir::new().unwrap();
        let quota = accountant(&dir, Some(100));

        std::fs::write(dir.path().join("uploads/a"), vec![0u8; 30]).unwrap();
        std::fs::write(dir.path().join("files/b_data.bin"), vec![0u8; 20]).unwrap();

        let usage = quota.get_storage_usage().await.unwrap();
        assert_eq!(usage.used, 50);
        assert_eq!(usage.available, Some(50));
        assert_eq!(usage.usage_percent, 50.0);
        assert!(!usage.is_full);
    }

    #[tokio::test]
    async fn test_admission_boundary() {
        let dir = TempDir::new().unwrap();
        let quota = accountant(&dir, Some(100));

        std::fs::write(dir.path().join("uploads/a"), vec![0u8; 60]).unwrap();

        let (allowed, _) = quota.check_quota(40).await.unwrap();
        assert!(allowed, "exactly filling the budget is admitted");

        let (allowed, usage) = quota.check_quota(41).await.unwrap();
        assert!(!allowed);
        assert_eq!(usage.used, 60);

        std::fs::write(dir.path().join("uploads/a"), vec![0u8; 100]).unwrap();
        let usage = quota.get_storage_usage().await.unwrap();
        assert!(usage.is_full);
    }
}
