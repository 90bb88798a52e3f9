use crate::error::Result;
use crate::state::{SetOptions, StateBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// In-memory state backend.
///
/// Expiry is emulated per entry: lapsed entries read as absent and are
/// pruned on the access that observes them.
#[derive(Clone, Default)]
pub struct MemoryStateBackend {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();

        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Observed an expired entry; prune it
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;

        if opts.if_absent
            && entries.get(key).is_some_and(|entry| !entry.is_expired(now))
        {
            return Ok(false);
        }

        let expires_at = opts
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );

        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some())
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let entries = self.entries.read().await;

        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
