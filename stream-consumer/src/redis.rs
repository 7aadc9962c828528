use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::timeout;

const REDIS_TIMEOUT_MILLISECS: u64 = 100;

/// A simple redis wrapper exposing the primitives membership needs.
#[async_trait]
pub trait Client: Send + Sync {
    /// `SET k v NX EX ttl`. Returns true if the key was set, false if it already existed.
    async fn set_nx_ex(&self, k: String, v: String, ttl_secs: u64) -> Result<bool>;

    /// `DEL k`. Returns true if the key existed.
    async fn del(&self, k: String) -> Result<bool>;
}

/// One managed connection shared by every call. The manager reconnects in the
/// background after a failure; each call is bounded by `REDIS_TIMEOUT_MILLISECS`.
pub struct RedisClient {
    conn: ConnectionManager,
}

impl RedisClient {
    /// Connect to `addr`, giving up after `connect_timeout`.
    pub async fn new(addr: String, connect_timeout: Duration) -> Result<RedisClient> {
        let client = redis::Client::open(addr)?;
        let conn = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow!("timed out connecting to redis"))??;

        Ok(RedisClient { conn })
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        let results = cmd.query_async::<_, T>(&mut conn);
        let fut = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| anyhow!("redis command timed out"))?;

        Ok(fut?)
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn set_nx_ex(&self, k: String, v: String, ttl_secs: u64) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(k).arg(v).arg("NX").arg("EX").arg(ttl_secs);

        let set: Option<String> = self.query(&cmd).await?;
        Ok(set.is_some())
    }

    async fn del(&self, k: String) -> Result<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(k);

        let removed: u64 = self.query(&cmd).await?;
        Ok(removed > 0)
    }
}

/// In-process stand-in for tests. Clones share their keys.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    keys: Arc<Mutex<HashSet<String>>>,
    unavailable: bool,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        Self::default()
    }

    /// Make every call fail, as an unreachable server would.
    pub fn unavailable(&mut self) -> Self {
        self.unavailable = true;

        self.clone()
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn set_nx_ex(&self, k: String, _v: String, _ttl_secs: u64) -> Result<bool> {
        if self.unavailable {
            return Err(anyhow!("connection refused"));
        }
        let mut keys = self.keys.lock().map_err(|_| anyhow!("poisoned mock lock"))?;

        Ok(keys.insert(k))
    }

    async fn del(&self, k: String) -> Result<bool> {
        if self.unavailable {
            return Err(anyhow!("connection refused"));
        }
        let mut keys = self.keys.lock().map_err(|_| anyhow!("poisoned mock lock"))?;

        Ok(keys.remove(&k))
    }
}
