use crate::error::{Error, Result, ResultIoExt};
use crate::state::{SetOptions, StateBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Expiry sidecar stored next to each value file.
#[derive(Debug, Serialize, Deserialize, Default)]
struct EntryMeta {
    expires_at: Option<DateTime<Utc>>,
}

/// File-backed state store: one value file per key plus a `.meta` sidecar
/// recording expiry. Writes land in a scratch directory first and are
/// renamed into place, so a crash never leaves a torn value.
///
/// Filenames are the lowercase hex of the key bytes, which keeps prefix
/// scans exact (hex of a key prefix is a prefix of the hex filename).
pub struct FileStateBackend {
    base_dir: PathBuf,
    scratch_dir: PathBuf,
    // Serializes mutations so set-if-absent stays atomic within the process
    write_lock: tokio::sync::Mutex<()>,
}

fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len() * 2);
    for byte in key.as_bytes() {
        let _ = write!(encoded, "{:02x}", byte);
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(name.len() / 2);
    for chunk in name.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).ok()?;
        bytes.push(u8::from_str_radix(pair, 16).ok()?);
    }
    String::from_utf8(bytes).ok()
}

impl FileStateBackend {
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let scratch_dir = base_dir.join("tmp");

        fs::create_dir_all(&scratch_dir)
            .await
            .map_io_err(&scratch_dir)?;

        Ok(Self {
            base_dir,
            scratch_dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(encode_key(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.meta", encode_key(key)))
    }

    /// Write via a scratch file and rename into place.
    async fn write_atomic(&self, dest: &Path, contents: &[u8]) -> Result<()> {
        let scratch = self
            .scratch_dir
            .join(uuid::Uuid::new_v4().simple().to_string());

        fs::write(&scratch, contents).await.map_io_err(&scratch)?;
        fs::rename(&scratch, dest).await.map_io_err(dest)?;

        Ok(())
    }

    async fn read_meta(&self, key: &str) -> Result<EntryMeta> {
        let meta_path = self.meta_path(key);
        match fs::read_to_string(&meta_path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EntryMeta::default()),
            Err(e) => Err(Error::Backend {
                msg: format!("failed to read state sidecar {}: {}", meta_path.display(), e),
                transient: true,
            }),
        }
    }

    async fn remove_entry(&self, key: &str) -> Result<bool> {
        let existed = match fs::remove_file(self.value_path(key)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(Error::Backend {
                    msg: format!("failed to delete state entry: {}", e),
                    transient: true,
                });
            }
        };

        if let Err(e) = fs::remove_file(self.meta_path(key)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            return Err(Error::Backend {
                msg: format!("failed to delete state sidecar: {}", e),
                transient: true,
            });
        }

        Ok(existed)
    }

    /// Returns the live value for a key, treating an expired entry as absent
    /// (and unlinking it).
    async fn read_live(&self, key: &str) -> Result<Option<String>> {
        let value_path = self.value_path(key);
        let value = match fs::read_to_string(&value_path).await {
            Ok(value) => value,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Backend {
                    msg: format!("failed to read state entry {}: {}", value_path.display(), e),
                    transient: true,
                });
            }
        };

        let meta = self.read_meta(key).await?;
        if meta.expires_at.is_some_and(|expires| expires <= Utc::now()) {
            self.remove_entry(key).await?;
            return Ok(None);
        }

        Ok(Some(value))
    }
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read_live(key).await
    }

    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        if opts.if_absent && self.read_live(key).await?.is_some() {
            return Ok(false);
        }

        let expires_at = opts
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);

        let meta = serde_json::to_vec(&EntryMeta { expires_at })?;
        self.write_atomic(&self.value_path(key), value.as_bytes())
            .await?;
        self.write_atomic(&self.meta_path(key), &meta).await?;

        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.remove_entry(key).await
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => {
                return Err(Error::Backend {
                    msg: format!("failed to scan state directory: {}", e),
                    transient: true,
                });
            }
        };

        let now = Utc::now();
        while let Some(entry) = entries.next_entry().await.map_io_err(&self.base_dir)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == "tmp" || name.ends_with(".meta") {
                continue;
            }

            let Some(key) = decode_key(name) else { continue };
            if !key.starts_with(prefix) {
                continue;
            }

            let meta = self.read_meta(&key).await?;
            if meta.expires_at.is_some_and(|expires| expires <= now) {
                self.remove_entry(&key).await?;
                continue;
            }

            keys.push(key);
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_key_encoding_roundtrip() {
        for key in ["upload:abc123", "file:00ff", "lock:x", ""] {
            assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
        }
        assert_eq!(decode_key("zz"), None);
        assert_eq!(decode_key("abc"), None);
    }

    #[tokio::test]
    async fn test_set_get_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let backend = FileStateBackend::open(dir.path()).await.unwrap();
            backend
                .set("upload:a", "{\"offset\":0}", SetOptions::new())
                .await
                .unwrap();
        }

        let backend = FileStateBackend::open(dir.path()).await.unwrap();
        assert_eq!(
            backend.get("upload:a").await.unwrap().as_deref(),
            Some("{\"offset\":0}")
        );
    }

    #[tokio::test]
    async fn test_if_absent_and_ttl() {
        let dir = TempDir::new().unwrap();
        let backend = FileStateBackend::open(dir.path()).await.unwrap();

        assert!(
            backend
                .set(
                    "lock:a",
                    "1",
                    SetOptions::new().if_absent().ttl(Duration::from_millis(20))
                )
                .await
                .unwrap()
        );
        assert!(
            !backend
                .set("lock:a", "2", SetOptions::new().if_absent())
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Lapsed entry reads as absent and the slot is reusable
        assert_eq!(backend.get("lock:a").await.unwrap(), None);
        assert!(
            backend
                .set("lock:a", "3", SetOptions::new().if_absent())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_scan_keys_skips_foreign_prefixes() {
        let dir = TempDir::new().unwrap();
        let backend = FileStateBackend::open(dir.path()).await.unwrap();

        backend.set("upload:a", "1", SetOptions::new()).await.unwrap();
        backend.set("file:a", "2", SetOptions::new()).await.unwrap();

        let keys = backend.scan_keys("upload:").await.unwrap();
        assert_eq!(keys, vec!["upload:a"]);
    }
}
