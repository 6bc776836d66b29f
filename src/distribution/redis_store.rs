//! Redis-backed stream, cache, and diagnostics.
//!
//! One multiplexed [`ConnectionManager`] serves every invocation; it
//! reconnects on its own and is cheap to clone per command.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Value};
use tracing::debug;

use super::{
    redact_url, CacheStore, ConsumerGroupInfo, StoreDiagnostics, StoreError, StreamStore,
};

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 200;

/// Redis client wrapper
#[derive(Clone)]
pub struct RedisStore {
    url: String,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &redact_url(&self.url))
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `redis://[:password@]host:port/db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        debug!(url = %redact_url(url), "connected to Redis");
        Ok(Self {
            url: url.to_string(),
            conn,
        })
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
    ) -> Result<Option<String>, StoreError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(value.as_str());
        }
        let mut conn = self.conn.clone();
        let id: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(format!("XADD failed: {e}")))?;
        Ok(id)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(format!("SET failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(format!("GET failed: {e}")))
    }
}

#[async_trait]
impl StoreDiagnostics for RedisStore {
    async fn consumer_groups(&self, stream: &str) -> Result<Vec<ConsumerGroupInfo>, StoreError> {
        let mut conn = self.conn.clone();
        let groups: Vec<HashMap<String, Value>> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(format!("XINFO GROUPS failed: {e}")))?;

        Ok(groups
            .iter()
            .map(|group| ConsumerGroupInfo {
                name: field::<String>(group, "name").unwrap_or_default(),
                consumers: field::<u64>(group, "consumers").unwrap_or(0),
                pending: field::<u64>(group, "pending").unwrap_or(0),
                last_delivered_id: field::<String>(group, "last-delivered-id"),
            })
            .collect())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Command(format!("SCAN failed: {e}")))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn field<T: FromRedisValue>(map: &HashMap<String, Value>, name: &str) -> Option<T> {
    map.get(name)
        .and_then(|value| redis::from_redis_value(value).ok())
}
