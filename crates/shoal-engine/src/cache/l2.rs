//! L2 - distributed warm tier.
//!
//! The trait is async so network backends can be plugged in; the manager
//! treats every error from it as a degradation, never as a request failure.

use super::CacheError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[async_trait]
pub trait L2Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Value plus its remaining lifetime, when the backend knows it.
    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<Duration>)>, CacheError> {
        Ok(self.get(key).await?.map(|value| (value, None)))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key owned by this cache.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Health check against the backend.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Backend name for logs and stats
    fn backend(&self) -> &'static str;
}

/// Process-local L2, for single-instance deployments and tests.
///
/// Expired keys are removed lazily on access and opportunistically on write.
#[derive(Default)]
pub struct InMemoryL2 {
    data: Mutex<HashMap<String, (Bytes, Instant)>>,
}

impl InMemoryL2 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .lock()
            .values()
            .filter(|(_, expiry)| *expiry > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl L2Cache for InMemoryL2 {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.get_with_ttl(key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<Duration>)>, CacheError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        match data.get(key) {
            Some((value, expiry)) if *expiry > now => {
                Ok(Some((value.clone(), Some(*expiry - now))))
            }
            Some(_) => {
                data.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        if let Some((_, expiry)) = data.get(key) {
            if *expiry <= now {
                data.remove(key);
            }
        }
        data.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.data.lock().clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "inmemory"
    }
}
