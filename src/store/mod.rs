//! Upload and completed-file records over the state backend, plus the
//! per-upload distributed lock.

use crate::error::{Error, Result};
use crate::models::{FileRecord, RetentionPolicy, UploadRecord};
use crate::state::{SetOptions, StateManager};
use chrono::Utc;
use std::time::Duration;

const UPLOAD_PREFIX: &str = "upload:";
const FILE_PREFIX: &str = "file:";
const LOCK_PREFIX: &str = "lock:";

/// Upload records expire from the state store after a week; every write
/// renews the clock.
const UPLOAD_RECORD_TTL: Duration = Duration::from_secs(86400 * 7);

/// Default lifetime of a held lock; lapsed locks self-heal via this TTL.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of recording a completed download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub should_delete: bool,
    pub retention: RetentionPolicy,
    pub download_count: u64,
}

#[derive(Clone)]
pub struct UploadStore {
    state: StateManager,
}

fn upload_key(file_id: &str) -> String {
    format!("{}{}", UPLOAD_PREFIX, file_id)
}

fn file_key(file_id: &str) -> String {
    format!("{}{}", FILE_PREFIX, file_id)
}

fn lock_key(file_id: &str) -> String {
    format!("{}{}", LOCK_PREFIX, file_id)
}

impl UploadStore {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    pub async fn create_upload(&self, upload: &UploadRecord) -> Result<()> {
        let value = serde_json::to_string(upload)?;
        self.state
            .set(
                &upload_key(&upload.file_id),
                &value,
                SetOptions::new().ttl(UPLOAD_RECORD_TTL),
            )
            .await?;
        Ok(())
    }

    pub async fn get_upload(&self, file_id: &str) -> Result<Option<UploadRecord>> {
        let Some(data) = self.state.get(&upload_key(file_id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&data) {
            Ok(upload) => Ok(Some(upload)),
            Err(e) => {
                tracing::warn!(file_id, error = %e, "Dropping unreadable upload record");
                Ok(None)
            }
        }
    }

    /// Persist an updated record, stamping `updated_at` and renewing the TTL.
    pub async fn update_upload(&self, upload: &mut UploadRecord) -> Result<()> {
        upload.updated_at = Utc::now();
        let value = serde_json::to_string(upload)?;
        self.state
            .set(
                &upload_key(&upload.file_id),
                &value,
                SetOptions::new().ttl(UPLOAD_RECORD_TTL),
            )
            .await?;
        Ok(())
    }

    pub async fn put_file_record(&self, record: &FileRecord) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.state
            .set(&file_key(&record.file_id), &value, SetOptions::new())
            .await?;
        Ok(())
    }

    pub async fn get_file_record(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let Some(data) = self.state.get(&file_key(file_id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&data) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(file_id, error = %e, "Dropping unreadable file record");
                Ok(None)
            }
        }
    }

    /// Remove both the upload and completed-file records.
    pub async fn remove_records(&self, file_id: &str) -> Result<()> {
        self.state.delete(&upload_key(file_id)).await?;
        self.state.delete(&file_key(file_id)).await?;
        Ok(())
    }

    pub async fn list_uploads(
        &self,
        include_completed: bool,
        include_partial: bool,
    ) -> Result<Vec<UploadRecord>> {
        let keys = self.state.scan_keys(UPLOAD_PREFIX).await?;
        let mut uploads = Vec::new();

        for key in keys {
            let Some(data) = self.state.get(&key).await? else {
                continue;
            };
            let Ok(upload) = serde_json::from_str::<UploadRecord>(&data) else {
                tracing::warn!(key, "Skipping unreadable upload record");
                continue;
            };

            if upload.is_final && !include_completed {
                continue;
            }
            if !upload.is_final && !include_partial {
                continue;
            }
            uploads.push(upload);
        }

        Ok(uploads)
    }

    pub async fn list_files(&self) -> Result<Vec<FileRecord>> {
        let keys = self.state.scan_keys(FILE_PREFIX).await?;
        let mut files = Vec::new();

        for key in keys {
            let Some(data) = self.state.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<FileRecord>(&data) {
                Ok(record) => files.push(record),
                Err(_) => tracing::warn!(key, "Skipping unreadable file record"),
            }
        }

        Ok(files)
    }

    /// Merged metadata view: the completed-file record when one exists,
    /// otherwise a partial view of the upload record with
    /// `available_size = offset`.
    pub async fn get_file_info(&self, file_id: &str) -> Result<Option<FileRecord>> {
        if let Some(record) = self.get_file_record(file_id).await? {
            return Ok(Some(record));
        }

        Ok(self
            .get_upload(file_id)
            .await?
            .map(|upload| FileRecord::from_partial(&upload)))
    }

    /// Record a completed download, bumping `download_count` on whichever
    /// record owns the file. Reports whether retention demands deletion.
    pub async fn record_download(&self, file_id: &str) -> Result<DownloadOutcome> {
        if let Some(mut record) = self.get_file_record(file_id).await? {
            record.download_count += 1;
            self.put_file_record(&record).await?;
            return Ok(DownloadOutcome {
                should_delete: record.retention == RetentionPolicy::DownloadOnce,
                retention: record.retention,
                download_count: record.download_count,
            });
        }

        if let Some(mut upload) = self.get_upload(file_id).await? {
            upload.download_count += 1;
            let retention = upload.retention;
            let download_count = upload.download_count;
            self.update_upload(&mut upload).await?;
            return Ok(DownloadOutcome {
                should_delete: retention == RetentionPolicy::DownloadOnce,
                retention,
                download_count,
            });
        }

        Err(Error::NotFound {
            file_id: file_id.to_string(),
        })
    }

    /// Try to take the per-upload lock. Built on the backend's atomic
    /// set-if-absent with expiry, so no read-modify-write race exists.
    pub async fn acquire_lock(&self, file_id: &str) -> Result<bool> {
        self.state
            .set(
                &lock_key(file_id),
                "1",
                SetOptions::new().if_absent().ttl(LOCK_TIMEOUT),
            )
            .await
    }

    pub async fn release_lock(&self, file_id: &str) -> Result<()> {
        self.state.delete(&lock_key(file_id)).await?;
        Ok(())
    }
}
