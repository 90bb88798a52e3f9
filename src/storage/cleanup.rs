use crate::error::Result;
use crate::storage::ChunkStorage;
use crate::store::UploadStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Optional hook notified when reclaimed bytes should be credited back to a
/// caller principal.
#[async_trait]
pub trait StorageAccounting: Send + Sync {
    /// `delta` is negative when bytes are reclaimed.
    async fn adjust(&self, owner_id: &str, delta: i64);
}

/// Reclaims expired incomplete uploads and TTL-expired completed files.
///
/// Sweeps are serialized: the periodic loop and the manual cleanup endpoint
/// share one gate, so a new sweep never starts while another is in flight.
#[derive(Clone)]
pub struct CleanupRunner {
    storage: Arc<ChunkStorage>,
    store: UploadStore,
    accounting: Option<Arc<dyn StorageAccounting>>,
    sweep_gate: Arc<Mutex<()>>,
}

impl CleanupRunner {
    pub fn new(
        storage: Arc<ChunkStorage>,
        store: UploadStore,
        accounting: Option<Arc<dyn StorageAccounting>>,
    ) -> Self {
        Self {
            storage,
            store,
            accounting,
            sweep_gate: Arc::new(Mutex::new(())),
        }
    }

    async fn credit(&self, owner_id: Option<&str>, bytes: u64) {
        if let (Some(accounting), Some(owner_id)) = (&self.accounting, owner_id) {
            accounting.adjust(owner_id, -(bytes as i64)).await;
        }
    }

    /// Run one sweep. Returns the number of reclaimed items.
    pub async fn sweep(&self) -> Result<u32> {
        let _guard = self.sweep_gate.lock().await;

        let now = Utc::now();
        let mut cleaned = 0;

        // Incomplete uploads past their upload deadline
        let uploads = self.store.list_uploads(false, true).await?;
        for upload in uploads {
            if !upload.is_expired(now) {
                continue;
            }

            // Skip victims currently being written to
            if !self.store.acquire_lock(&upload.file_id).await? {
                tracing::debug!(file_id = upload.file_id, "Skipping locked upload in sweep");
                continue;
            }

            self.credit(upload.owner_id.as_deref(), upload.offset).await;

            match self.storage.delete_upload(&upload.file_id).await {
                Ok(()) => {
                    tracing::info!(file_id = upload.file_id, "Reclaimed expired upload");
                    cleaned += 1;
                }
                Err(e) => {
                    tracing::warn!(file_id = upload.file_id, error = %e, "Failed to reclaim expired upload");
                }
            }
        }

        // Completed files past their retention deadline
        let files = self.store.list_files().await?;
        for file in files {
            let Some(expires) = file.retention_expires_at else {
                continue;
            };
            if expires >= now {
                continue;
            }

            if !self.store.acquire_lock(&file.file_id).await? {
                tracing::debug!(file_id = file.file_id, "Skipping locked file in sweep");
                continue;
            }

            self.credit(file.owner_id.as_deref(), file.size).await;

            match self.storage.delete_upload(&file.file_id).await {
                Ok(()) => {
                    tracing::info!(file_id = file.file_id, "Reclaimed retention-expired file");
                    cleaned += 1;
                }
                Err(e) => {
                    tracing::warn!(file_id = file.file_id, error = %e, "Failed to reclaim retention-expired file");
                }
            }
        }

        Ok(cleaned)
    }
}

/// Spawn the background task that periodically sweeps expired uploads and
/// retention-expired files.
pub fn spawn_cleanup_task(runner: CleanupRunner, interval_secs: u64) {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(interval_secs.max(1));

        loop {
            tokio::time::sleep(interval).await;

            match runner.sweep().await {
                Ok(cleaned) if cleaned > 0 => {
                    tracing::info!(cleaned, "Cleanup sweep reclaimed expired items");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Cleanup sweep failed");
                }
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RetentionPolicy, UploadRecord};
    use crate::state::StateManager;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::TempDir;

    struct RecordingAccounting {
        total: AtomicI64,
    }

    #[async_trait]
    impl StorageAccounting for RecordingAccounting {
        async fn adjust(&self, _owner_id: &str, delta: i64) {
            self.total.fetch_add(delta, Ordering::SeqCst);
        }
    }

    async fn seed_expired_upload(
        store: &UploadStore,
        storage: &ChunkStorage,
        file_id: &str,
        owner: Option<&str>,
    ) {
        let now = Utc::now();
        let mut upload = UploadRecord {
            file_id: file_id.to_string(),
            filename: "stale.bin".to_string(),
            size: 100,
            offset: 0,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            expires_at: Some(now - chrono::Duration::seconds(5)),
            is_final: false,
            storage_path: String::new(),
            mime_type: None,
            checksum: None,
            retention: RetentionPolicy::Permanent,
            retention_ttl: None,
            retention_expires_at: None,
            download_count: 0,
            owner_id: owner.map(str::to_string),
        };
        store.create_upload(&upload).await.unwrap();
        storage.create_upload_file(file_id).await.unwrap();
        storage.write_chunk(file_id, b"0123", 0).await.unwrap();
        upload.offset = 4;
        // update_upload stamps updated_at; expires_at stays in the past
        store.update_upload(&mut upload).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_uploads() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(StateManager::memory());
        let storage = Arc::new(ChunkStorage::new(dir.path(), store.clone()));
        storage.initialize().await.unwrap();

        seed_expired_upload(&store, &storage, "e1", Some("tok-1")).await;

        let accounting = Arc::new(RecordingAccounting {
            total: AtomicI64::new(0),
        });
        let runner = CleanupRunner::new(
            Arc::clone(&storage),
            store.clone(),
            Some(accounting.clone()),
        );

        assert_eq!(runner.sweep().await.unwrap(), 1);
        assert!(store.get_upload("e1").await.unwrap().is_none());
        assert!(!storage.upload_path("e1").exists());
        assert_eq!(accounting.total.load(Ordering::SeqCst), -4);

        // Nothing left to reclaim
        assert_eq!(runner.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_victims() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(StateManager::memory());
        let storage = Arc::new(ChunkStorage::new(dir.path(), store.clone()));
        storage.initialize().await.unwrap();

        seed_expired_upload(&store, &storage, "e2", None).await;
        assert!(store.acquire_lock("e2").await.unwrap());

        let runner = CleanupRunner::new(Arc::clone(&storage), store.clone(), None);
        assert_eq!(runner.sweep().await.unwrap(), 0);
        assert!(store.get_upload("e2").await.unwrap().is_some());

        store.release_lock("e2").await.unwrap();
        assert_eq!(runner.sweep().await.unwrap(), 1);
    }
}
