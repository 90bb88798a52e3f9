//! Pluggable key-value state storage.
//!
//! Upload records, completed-file records and distributed locks all live in
//! one of three interchangeable backends selected at startup: in-memory
//! (single process), file-on-disk (persistence without external services)
//! or Redis (multi-worker deployments).

mod file;
mod memory;
mod redis;

pub use self::file::FileStateBackend;
pub use self::memory::MemoryStateBackend;
pub use self::redis::RedisStateBackend;

use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Options for a `set` operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Expire the entry after this duration
    pub ttl: Option<Duration>,
    /// Only apply if the key is currently absent (atomic SETNX)
    pub if_absent: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn if_absent(mut self) -> Self {
        self.if_absent = true;
        self
    }
}

/// Capability set every state backend provides.
///
/// All operations are async and non-blocking. Transient failures (network,
/// disk) surface as `Error::Backend { transient: true }` so callers can
/// retry idempotently.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value. Returns whether the write was applied (always true
    /// unless `if_absent` was requested and the key already exists).
    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Enumerate keys starting with `prefix`. Yields every key present when
    /// the scan began; keys added concurrently may or may not appear.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Redis,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::File => f.write_str("file"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

/// Thin facade over the backend chosen at startup.
#[derive(Clone)]
pub struct StateManager {
    backend: Arc<dyn StateBackend>,
}

impl StateManager {
    /// Connect the configured backend. The file backend keeps its entries in
    /// a `state/` directory alongside the byte storage.
    pub async fn connect(
        kind: BackendKind,
        storage_path: &Path,
        redis_url: &str,
    ) -> Result<Self> {
        let backend: Arc<dyn StateBackend> = match kind {
            BackendKind::Memory => Arc::new(MemoryStateBackend::new()),
            BackendKind::File => {
                Arc::new(FileStateBackend::open(storage_path.join("state")).await?)
            }
            BackendKind::Redis => Arc::new(RedisStateBackend::connect(redis_url).await?),
        };

        Ok(Self { backend })
    }

    /// In-memory manager, used by tests and single-process setups.
    pub fn memory() -> Self {
        Self {
            backend: Arc::new(MemoryStateBackend::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(key).await
    }

    pub async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool> {
        self.backend.set(key, value, opts).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    pub async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.backend.scan_keys(prefix).await
    }
}
