//! In-process cache store.

use crate::error::CacheResult;
use crate::pattern::KeyPattern;
use crate::traits::CacheStore;
use async_trait::async_trait;
use conduit_core::{Clock, Reply, system_clock};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Stored value with its expiry bookkeeping.
#[derive(Clone)]
pub struct CacheEntry {
    pub value: Reply,
    pub created_at: Instant,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl CacheEntry {
    /// `now > created_at + ttl`; entries without a TTL never expire.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.ttl.is_some_and(|ttl| now > self.created_at + ttl)
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("created_at", &self.created_at)
            .field("ttl", &self.ttl)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Concurrent in-memory cache.
///
/// Expired entries are dropped lazily on access and by
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug, Clone)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    tags: Arc<DashMap<String, HashSet<String>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    /// Create new in-memory cache
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            tags: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently tagged with `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = self.remove_where(|_, entry| entry.is_expired(now));
        if !removed.is_empty() {
            debug!(count = removed.len(), "Purged expired cache entries");
        }
        removed.len()
    }

    fn remove_where<F>(&self, mut predicate: F) -> Vec<(String, CacheEntry)>
    where
        F: FnMut(&str, &CacheEntry) -> bool,
    {
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            if predicate(key, entry) {
                removed.push((key.clone(), entry.clone()));
                false
            } else {
                true
            }
        });
        for (key, entry) in &removed {
            self.unindex(key, &entry.tags);
        }
        removed
    }

    fn index(&self, key: &str, tags: &[String]) {
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex(&self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(mut keys) = self.tags.get_mut(tag) {
                keys.remove(key);
            }
            self.tags.remove_if(tag, |_, keys| keys.is_empty());
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Reply>> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        if let Some((_, expired)) = self.entries.remove_if(key, |_, e| e.is_expired(now)) {
            self.unindex(key, &expired.tags);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Reply, ttl: Option<Duration>) -> CacheResult<()> {
        self.set_with_tags(key, value, ttl, &[]).await
    }

    async fn set_with_tags(
        &self,
        key: &str,
        value: Reply,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> CacheResult<()> {
        let entry = CacheEntry {
            value,
            created_at: self.clock.now(),
            ttl,
            tags: tags.to_vec(),
        };

        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            self.unindex(key, &previous.tags);
        }
        self.index(key, tags);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = self.clock.now();
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.unindex(key, &entry.tags);
                Ok(!entry.is_expired(now))
            }
            None => Ok(false),
        }
    }

    async fn clear_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let pattern = KeyPattern::new(pattern)?;
        let now = self.clock.now();

        let removed = self.remove_where(|key, _| pattern.matches(key));
        let evicted = removed
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .count();

        debug!(pattern = pattern.as_str(), evicted, "Cleared cache pattern");
        Ok(evicted)
    }

    async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize> {
        let Some((_, keys)) = self.tags.remove(tag) else {
            return Ok(0);
        };

        let now = self.clock.now();
        let mut evicted = 0;
        for key in keys {
            // The key may have been overwritten without this tag since indexing.
            if let Some((_, entry)) = self
                .entries
                .remove_if(&key, |_, e| e.tags.iter().any(|t| t == tag))
            {
                self.unindex(&key, &entry.tags);
                if !entry.is_expired(now) {
                    evicted += 1;
                }
            }
        }

        debug!(tag, evicted, "Invalidated cache tag");
        Ok(evicted)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.entries.clear();
        self.tags.clear();
        Ok(())
    }
}
