pub mod cleanup;
pub mod quota;

use crate::error::{Error, Result, ResultIoExt};
use crate::models::{FileRecord, RetentionPolicy, UploadRecord};
use crate::store::UploadStore;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Pause before the single lock-acquisition retry.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on a single chunk write; a write that exceeds it has its
/// lock released and reports a retryable failure.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Reduce a client-supplied filename to a single safe path component.
/// Client names are never trusted for filesystem traversal.
fn sanitize_filename(filename: &str) -> String {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .replace('\0', "");

    if name.is_empty() || name == "." || name == ".." {
        "file".to_string()
    } else {
        name
    }
}

/// On-disk byte storage for uploads.
///
/// Layout under the storage root:
/// - `uploads/<file_id>` — in-progress bytes, no filename in the path
/// - `files/<file_id>_<filename>` — final location after finalization
/// - `temp/` — scratch space for atomic writes
pub struct ChunkStorage {
    uploads_path: PathBuf,
    files_path: PathBuf,
    temp_path: PathBuf,
    store: UploadStore,
}

impl ChunkStorage {
    pub fn new(storage_path: impl Into<PathBuf>, store: UploadStore) -> Self {
        let storage_path = storage_path.into();
        Self {
            uploads_path: storage_path.join("uploads"),
            files_path: storage_path.join("files"),
            temp_path: storage_path.join("temp"),
            store,
        }
    }

    /// Create the directory layout.
    pub async fn initialize(&self) -> Result<()> {
        for path in [&self.uploads_path, &self.files_path, &self.temp_path] {
            fs::create_dir_all(path).await.map_io_err(path)?;
        }
        Ok(())
    }

    pub fn uploads_path(&self) -> &Path {
        &self.uploads_path
    }

    pub fn files_path(&self) -> &Path {
        &self.files_path
    }

    /// Path of the in-progress bytes for an upload.
    pub fn upload_path(&self, file_id: &str) -> PathBuf {
        self.uploads_path.join(file_id)
    }

    /// Final path of a completed file.
    pub fn final_path(&self, file_id: &str, filename: &str) -> PathBuf {
        self.files_path
            .join(format!("{}_{}", file_id, sanitize_filename(filename)))
    }

    /// Create the (empty) upload file. No pre-allocation, so storage quota
    /// is only consumed as chunks arrive.
    pub async fn create_upload_file(&self, file_id: &str) -> Result<()> {
        let path = self.upload_path(file_id);
        fs::File::create(&path).await.map_io_err(&path)?;
        Ok(())
    }

    /// Write a chunk at `offset` under the per-upload lock.
    ///
    /// Lock acquisition retries once after 100 ms; exhausting the retry is a
    /// conflict (the competing PATCH holds the lock). The write itself is
    /// flushed before the lock is released, and the upload record is NOT
    /// updated here; the caller persists the new offset after success.
    pub async fn write_chunk(&self, file_id: &str, data: &[u8], offset: u64) -> Result<usize> {
        if !self.store.acquire_lock(file_id).await? {
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
            if !self.store.acquire_lock(file_id).await? {
                return Err(Error::Conflict {
                    msg: format!("Upload {} is locked by another writer", file_id),
                });
            }
        }

        let io_result =
            tokio::time::timeout(WRITE_TIMEOUT, self.write_chunk_locked(file_id, data, offset))
                .await;

        self.store.release_lock(file_id).await?;

        match io_result {
            Ok(result) => result,
            Err(_) => Err(Error::Backend {
                msg: format!("chunk write for {} timed out", file_id),
                transient: true,
            }),
        }
    }

    async fn write_chunk_locked(&self, file_id: &str, data: &[u8], offset: u64) -> Result<usize> {
        let path = self.upload_path(file_id);

        let len = fs::metadata(&path).await.map_io_err(&path)?.len();

        // TUS offset discipline: the admitted offset equals the current file
        // length, so position-and-write on a non-empty file, append otherwise.
        let mut file = if len > 0 {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_io_err(&path)?;
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_io_err(&path)?;
            file
        } else {
            fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .await
                .map_io_err(&path)?
        };

        file.write_all(data).await.map_io_err(&path)?;
        file.flush().await.map_io_err(&path)?;
        file.sync_all().await.map_io_err(&path)?;

        Ok(data.len())
    }

    /// Read up to `length` bytes at `offset`. Prefers the in-progress file;
    /// falls back to the finalized location once the upload has completed.
    /// Short reads happen at EOF.
    pub async fn read_chunk(&self, file_id: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut path = self.upload_path(file_id);

        if !fs::try_exists(&path).await.map_io_err(&path)? {
            path = self.locate_final(file_id).await?;
        }

        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    file_id: file_id.to_string(),
                });
            }
            Err(e) => return Err(e).map_io_err(&path),
        };

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_io_err(&path)?;

        let mut buf = Vec::with_capacity(length);
        file.take(length as u64)
            .read_to_end(&mut buf)
            .await
            .map_io_err(&path)?;

        Ok(buf)
    }

    /// Resolve the on-disk location of a finalized file.
    async fn locate_final(&self, file_id: &str) -> Result<PathBuf> {
        if let Some(upload) = self.store.get_upload(file_id).await?
            && upload.is_final
        {
            return Ok(self.final_path(file_id, &upload.filename));
        }

        if let Some(record) = self.store.get_file_record(file_id).await? {
            return Ok(PathBuf::from(record.storage_path));
        }

        Err(Error::NotFound {
            file_id: file_id.to_string(),
        })
    }

    /// Move a completed upload into the files directory and write the
    /// completed-file record. Requires `offset == size`.
    pub async fn finalize_upload(&self, file_id: &str) -> Result<()> {
        let Some(mut upload) = self.store.get_upload(file_id).await? else {
            return Err(Error::NotFound {
                file_id: file_id.to_string(),
            });
        };

        if !upload.is_complete() {
            return Err(Error::Internal {
                msg: format!(
                    "finalize of incomplete upload {} ({}/{} bytes)",
                    file_id, upload.offset, upload.size
                ),
            });
        }

        let src = self.upload_path(file_id);
        let dst = self.final_path(file_id, &upload.filename);

        if fs::try_exists(&src).await.map_io_err(&src)? {
            fs::rename(&src, &dst).await.map_io_err(&dst)?;
        }

        let completed_at = Utc::now();
        let retention_expires_at = match (upload.retention, upload.retention_ttl) {
            (RetentionPolicy::Ttl, Some(ttl)) => {
                Some(completed_at + chrono::Duration::seconds(ttl))
            }
            _ => None,
        };
        upload.retention_expires_at = retention_expires_at;

        let record = FileRecord {
            file_id: upload.file_id.clone(),
            filename: upload.filename.clone(),
            size: upload.size,
            available_size: upload.size,
            mime_type: upload.mime_type.clone(),
            checksum: upload.checksum.clone(),
            is_complete: true,
            created_at: upload.created_at,
            updated_at: upload.updated_at,
            expires_at: None,
            completed_at: Some(completed_at),
            storage_path: dst.display().to_string(),
            retention: upload.retention,
            retention_ttl: upload.retention_ttl,
            retention_expires_at,
            download_count: upload.download_count,
            owner_id: upload.owner_id.clone(),
        };
        self.store.put_file_record(&record).await?;

        upload.is_final = true;
        upload.storage_path = dst.display().to_string();
        self.store.update_upload(&mut upload).await?;

        tracing::info!(file_id, size = upload.size, "Upload finalized");
        Ok(())
    }

    /// Remove an upload entirely: both state records, the in-progress file,
    /// any finalized file, and any held lock. Missing pieces are ignored.
    pub async fn delete_upload(&self, file_id: &str) -> Result<()> {
        self.store.remove_records(file_id).await?;

        let upload_path = self.upload_path(file_id);
        if let Err(e) = fs::remove_file(&upload_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            return Err(e).map_io_err(&upload_path);
        }

        // Final filenames carry the original name; match on the id prefix
        let prefix = format!("{}_", file_id);
        if fs::try_exists(&self.files_path)
            .await
            .map_io_err(&self.files_path)?
        {
            let mut entries = fs::read_dir(&self.files_path)
                .await
                .map_io_err(&self.files_path)?;
            while let Some(entry) = entries.next_entry().await.map_io_err(&self.files_path)? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(&prefix)
                    && let Err(e) = fs::remove_file(entry.path()).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    return Err(e).map_io_err(&entry.path());
                }
            }
        }

        self.store.release_lock(file_id).await?;
        Ok(())
    }

    /// Re-run finalization for uploads interrupted between the terminal
    /// PATCH and the file move. Returns how many were repaired.
    pub async fn recover_interrupted_finalizations(&self) -> Result<u32> {
        let uploads = self.store.list_uploads(true, true).await?;
        let mut recovered = 0;

        for upload in uploads {
            if !upload.is_complete() {
                continue;
            }
            let has_record = self
                .store
                .get_file_record(&upload.file_id)
                .await?
                .is_some();
            if upload.is_final && has_record {
                continue;
            }

            match self.finalize_upload(&upload.file_id).await {
                Ok(()) => {
                    tracing::warn!(
                        file_id = upload.file_id,
                        "Recovered interrupted finalization"
                    );
                    recovered += 1;
                }
                Err(e) => {
                    tracing::error!(
                        file_id = upload.file_id,
                        error = %e,
                        "Failed to recover interrupted finalization"
                    );
                }
            }
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateManager;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_storage(dir: &TempDir) -> (ChunkStorage, UploadStore) {
        let store = UploadStore::new(StateManager::memory());
        (ChunkStorage::new(dir.path(), store.clone()), store)
    }

    async fn seed_upload(store: &UploadStore, file_id: &str, size: u64) -> UploadRecord {
        let now = Utc::now();
        let upload = UploadRecord {
            file_id: file_id.to_string(),
            filename: "data.bin".to_string(),
            size,
            offset: 0,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            expires_at: Some(now + chrono::Duration::hours(24)),
            is_final: false,
            storage_path: String::new(),
            mime_type: None,
            checksum: None,
            retention: RetentionPolicy::Permanent,
            retention_ttl: None,
            retention_expires_at: None,
            download_count: 0,
            owner_id: None,
        };
        store.create_upload(&upload).await.unwrap();
        upload
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_filename(".."), "file");
        assert_eq!(sanitize_filename(""), "file");
    }

    #[tokio::test]
    async fn test_write_chunks_sequentially() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        seed_upload(&store, "w1", 10).await;
        storage.create_upload_file("w1").await.unwrap();

        assert_eq!(storage.write_chunk("w1", b"hello", 0).await.unwrap(), 5);
        assert_eq!(storage.write_chunk("w1", b"world", 5).await.unwrap(), 5);

        let bytes = fs::read(storage.upload_path("w1")).await.unwrap();
        assert_eq!(&bytes, b"helloworld");

        // Lock was released after each write
        assert!(store.acquire_lock("w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_chunk_overwrites_stale_tail() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        seed_upload(&store, "w2", 10).await;
        storage.create_upload_file("w2").await.unwrap();

        storage.write_chunk("w2", b"aaaaa", 0).await.unwrap();
        // A disconnected client left partial bytes; the retried PATCH at the
        // authoritative offset overwrites them
        storage.write_chunk("w2", b"bbbbb", 5).await.unwrap();
        storage.write_chunk("w2", b"XXXXX", 5).await.unwrap();

        let bytes = fs::read(storage.upload_path("w2")).await.unwrap();
        assert_eq!(&bytes, b"aaaaaXXXXX");
    }

    #[tokio::test]
    async fn test_write_chunk_conflicts_while_locked() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        seed_upload(&store, "w3", 10).await;
        storage.create_upload_file("w3").await.unwrap();

        assert!(store.acquire_lock("w3").await.unwrap());

        let err = storage.write_chunk("w3", b"hello", 0).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        // The contender must not have clobbered the held lock
        assert!(!store.acquire_lock("w3").await.unwrap());
    }

    #[tokio::test]
    async fn test_finalize_moves_file_and_writes_record() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        let mut upload = seed_upload(&store, "f1", 4).await;
        storage.create_upload_file("f1").await.unwrap();
        storage.write_chunk("f1", b"data", 0).await.unwrap();

        upload.offset = 4;
        store.update_upload(&mut upload).await.unwrap();

        storage.finalize_upload("f1").await.unwrap();

        assert!(!storage.upload_path("f1").exists());
        let final_path = storage.final_path("f1", "data.bin");
        assert_eq!(fs::read(&final_path).await.unwrap(), b"data");

        let record = store.get_file_record("f1").await.unwrap().unwrap();
        assert!(record.is_complete);
        assert_eq!(record.available_size, 4);
        assert!(record.completed_at.is_some());

        let upload = store.get_upload("f1").await.unwrap().unwrap();
        assert!(upload.is_final);
        assert_eq!(upload.storage_path, final_path.display().to_string());
    }

    #[tokio::test]
    async fn test_finalize_stamps_retention_expiry() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        let mut upload = seed_upload(&store, "f2", 1).await;
        upload.retention = RetentionPolicy::Ttl;
        upload.retention_ttl = Some(120);
        upload.offset = 1;
        store.update_upload(&mut upload).await.unwrap();

        storage.create_upload_file("f2").await.unwrap();
        storage.write_chunk("f2", b"x", 0).await.unwrap();
        storage.finalize_upload("f2").await.unwrap();

        let record = store.get_file_record("f2").await.unwrap().unwrap();
        let expires = record.retention_expires_at.expect("expiry not stamped");
        let completed = record.completed_at.unwrap();
        let delta = (expires - completed).num_seconds();
        assert!((119..=121).contains(&delta), "delta was {}", delta);
    }

    #[tokio::test]
    async fn test_finalize_rejects_incomplete() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        seed_upload(&store, "f3", 100).await;
        storage.create_upload_file("f3").await.unwrap();

        assert!(storage.finalize_upload("f3").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_upload_removes_everything() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        let mut upload = seed_upload(&store, "d1", 4).await;
        storage.create_upload_file("d1").await.unwrap();
        storage.write_chunk("d1", b"data", 0).await.unwrap();
        upload.offset = 4;
        store.update_upload(&mut upload).await.unwrap();
        storage.finalize_upload("d1").await.unwrap();

        storage.delete_upload("d1").await.unwrap();

        assert!(store.get_upload("d1").await.unwrap().is_none());
        assert!(store.get_file_record("d1").await.unwrap().is_none());
        assert!(!storage.final_path("d1", "data.bin").exists());

        // Idempotent with respect to bytes on disk
        storage.delete_upload("d1").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_chunk_follows_finalized_file() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        let mut upload = seed_upload(&store, "r1", 10).await;
        storage.create_upload_file("r1").await.unwrap();
        storage.write_chunk("r1", b"0123456789", 0).await.unwrap();

        assert_eq!(storage.read_chunk("r1", 2, 4).await.unwrap(), b"2345");
        // Short read at EOF
        assert_eq!(storage.read_chunk("r1", 8, 10).await.unwrap(), b"89");

        upload.offset = 10;
        store.update_upload(&mut upload).await.unwrap();
        storage.finalize_upload("r1").await.unwrap();

        assert_eq!(storage.read_chunk("r1", 0, 10).await.unwrap(), b"0123456789");

        let err = storage.read_chunk("missing", 0, 1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_recover_interrupted_finalization() {
        let dir = TempDir::new().unwrap();
        let (storage, store) = test_storage(&dir);
        storage.initialize().await.unwrap();

        // Crash happened after the terminal PATCH persisted offset == size
        // but before finalize ran
        let mut upload = seed_upload(&store, "rec1", 3).await;
        storage.create_upload_file("rec1").await.unwrap();
        storage.write_chunk("rec1", b"abc", 0).await.unwrap();
        upload.offset = 3;
        store.update_upload(&mut upload).await.unwrap();

        let recovered = storage.recover_interrupted_finalizations().await.unwrap();
        assert_eq!(recovered, 1);

        let record = store.get_file_record("rec1").await.unwrap().unwrap();
        assert!(record.is_complete);
        assert!(!storage.upload_path("rec1").exists());

        // Second pass is a no-op
        assert_eq!(
            storage.recover_interrupted_finalizations().await.unwrap(),
            0
        );
    }
}
