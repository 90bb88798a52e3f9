use crate::error::{Error, Result};
use crate::state::{SetOptions, StateBackend};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry};

/// Redis-backed state store for multi-worker deployments.
///
/// Maps directly onto native primitives: `SET` with `NX`/`EX`, `SCAN MATCH`
/// and `DEL`. The connection manager reconnects transparently, so failures
/// surface as transient backend errors.
#[derive(Clone)]
pub struct RedisStateBackend {
    conn: ConnectionManager,
}

fn redis_err(context: &str, e: redis::RedisError) -> Error {
    Error::Backend {
        msg: format!("redis {}: {}", context, e),
        transient: true,
    }
}

impl RedisStateBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| redis_err("open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| redis_err("connect", e))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl StateBackend for RedisStateBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| redis_err("get", e))
    }

    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool> {
        let mut conn = self.conn.clone();

        let mut set_opts = redis::SetOptions::default();
        if opts.if_absent {
            set_opts = set_opts.conditional_set(ExistenceCheck::NX);
        }
        if let Some(ttl) = opts.ttl {
            set_opts = set_opts.with_expiration(SetExpiry::EX(ttl.as_secs().max(1)));
        }

        // SET replies nil when an NX condition is not met
        let reply: redis::Value = conn
            .set_options(key, value, set_opts)
            .await
            .map_err(|e| redis_err("set", e))?;

        Ok(!matches!(reply, redis::Value::Nil))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(|e| redis_err("del", e))?;
        Ok(removed > 0)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);

        let mut iter = conn
            .scan_match::<_, String>(&pattern)
            .await
            .map_err(|e| redis_err("scan", e))?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await.transpose().map_err(|e| redis_err("scan", e))? {
            keys.push(key);
        }

        Ok(keys)
    }
}
