use super::{CacheError, L2Cache};
use crate::config::RedisConfig;
use async_trait::async_trait;
use bytes::Bytes;
use redis::{Connection, ConnectionLike};
use std::time::Duration;
use tracing::{info, warn};

/// Redis implementation of the L2 tier.
///
/// Uses the blocking Redis client behind an r2d2 pool; every command runs on
/// tokio's blocking pool so concurrent requests use separate connections and
/// never stall the async workers.
///
/// The pool is built unchecked: an unreachable server at startup leaves the
/// manager running L1-only until Redis comes back.
///
/// # Compatibility
///
/// - Redis 6.x, 7.x: Fully supported
/// - Valkey: Likely compatible but not officially supported
struct RedisConnectionManager {
    client: redis::Client,
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.client.get_connection()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        redis::cmd("PING").query::<String>(conn).map(|_| ())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_open()
    }
}

pub struct RedisL2 {
    pool: r2d2::Pool<RedisConnectionManager>,
    key_prefix: String,
}

impl RedisL2 {
    /// Create the pool. Fails on an empty key prefix or an unparsable URL.
    pub fn new(config: &RedisConfig) -> Result<Self, CacheError> {
        if config.key_prefix.is_empty() {
            return Err(CacheError::Config(
                "redis key prefix must not be empty".to_string(),
            ));
        }
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CacheError::Config(format!("invalid redis url: {e}")))?;

        let pool = r2d2::Pool::builder()
            .max_size(config.pool_size.max(1) as u32)
            .min_idle(Some(0))
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
            .build_unchecked(RedisConnectionManager { client });

        info!(
            "Redis L2 configured with prefix={}, pool_size={}",
            config.key_prefix, config.pool_size
        );

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut Connection) -> redis::RedisResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            f(&mut conn).map_err(|e| CacheError::Backend(format!("redis {op} failed: {e}")))
        })
        .await
        .map_err(|e| CacheError::Backend(format!("redis {op} task failed: {e}")))?
    }
}

#[async_trait]
impl L2Cache for RedisL2 {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let key = self.make_key(key);
        let value: Option<Vec<u8>> = self
            .run("GET", move |conn| redis::cmd("GET").arg(&key).query(conn))
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<Duration>)>, CacheError> {
        let key = self.make_key(key);
        let (value, pttl): (Option<Vec<u8>>, i64) = self
            .run("GET/PTTL", move |conn| {
                redis::pipe()
                    .cmd("GET")
                    .arg(&key)
                    .cmd("PTTL")
                    .arg(&key)
                    .query(conn)
            })
            .await?;
        // PTTL is -1 without expiry and -2 once the key is gone.
        let remaining = u64::try_from(pttl).ok().map(Duration::from_millis);
        Ok(value.map(|v| (Bytes::from(v), remaining)))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let key = self.make_key(key);
        let ttl_ms = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        self.run("SET", move |conn| {
            redis::cmd("SET")
                .arg(&key)
                .arg(value.to_vec())
                .arg("PX")
                .arg(ttl_ms)
                .query::<()>(conn)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = self.make_key(key);
        self.run("DEL", move |conn| {
            redis::cmd("DEL").arg(&key).query::<i64>(conn).map(|_| ())
        })
        .await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        // Only keys under our prefix; never FLUSHDB a shared instance.
        let pattern = format!("{}*", self.key_prefix);
        let removed = self
            .run("SCAN/DEL", move |conn| {
                let mut cursor: u64 = 0;
                let mut removed: u64 = 0;
                loop {
                    let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(500)
                        .query(conn)?;
                    if !keys.is_empty() {
                        removed += redis::cmd("DEL").arg(&keys).query::<u64>(conn)?;
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Ok(removed)
            })
            .await?;
        info!("Cleared {} keys from Redis L2", removed);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let result = self
            .run("PING", |conn| redis::cmd("PING").query::<String>(conn))
            .await;
        if let Err(ref e) = result {
            warn!("Redis health check failed: {}", e);
        }
        result.map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
