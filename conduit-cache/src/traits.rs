//! Cache store trait definition.

use crate::error::CacheResult;
use async_trait::async_trait;
use conduit_core::Reply;
use std::time::Duration;

/// Cache store trait for different cache backends.
///
/// Values are shared handler replies; a hit hands out the same allocation
/// the first caller received.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a live value from the cache.
    ///
    /// Returns `Ok(None)` for missing and expired keys.
    async fn get(&self, key: &str) -> CacheResult<Option<Reply>>;

    /// Set a value in the cache.
    ///
    /// # Arguments
    ///
    /// * `key` - The cache key
    /// * `value` - The reply to share
    /// * `ttl` - Optional time-to-live; `None` never expires
    async fn set(&self, key: &str, value: Reply, ttl: Option<Duration>) -> CacheResult<()>;

    /// Set a value and attach invalidation tags to it.
    async fn set_with_tags(
        &self,
        key: &str,
        value: Reply,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> CacheResult<()>;

    /// Delete a key from the cache. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Delete every key matching a glob pattern (`*` and `?` wildcards).
    ///
    /// Returns the number of evicted entries.
    async fn clear_pattern(&self, pattern: &str) -> CacheResult<usize>;

    /// Delete every key carrying `tag`. Returns the number of evicted entries.
    async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize>;

    /// Check if a live key exists in the cache.
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Clear all keys from the cache.
    async fn clear(&self) -> CacheResult<()>;

    /// Delete multiple keys in parallel.
    async fn delete_many(&self, keys: &[&str]) -> CacheResult<usize> {
        use futures::future::try_join_all;

        let removed = try_join_all(keys.iter().map(|key| self.delete(key))).await?;
        Ok(removed.into_iter().filter(|r| *r).count())
    }
}
