//! Query result caching.

use crate::traits::CacheStore;
use async_trait::async_trait;
use conduit_core::config::CacheSettings;
use conduit_core::{DispatchResult, Envelope, MessageKind, Middleware, Next, Query};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Serves repeated queries from the cache.
///
/// Only queries returning a [`Query::cache_key`] are cached, under
/// `query:{type_name}:{cache_key}` where `type_name` is the fully qualified
/// query type. Successful replies are stored with the
/// query's TTL (or the default) and its tags; errors are never stored.
pub struct QueryCacheMiddleware {
    store: Arc<dyn CacheStore>,
    default_ttl: Duration,
}

impl QueryCacheMiddleware {
    pub fn new(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn from_settings(store: Arc<dyn CacheStore>, settings: &CacheSettings) -> Self {
        Self::new(store, settings.query_ttl())
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cache key of a query result, given the query's full type name.
    pub fn cache_key(type_name: &str, query_key: &str) -> String {
        format!("query:{}:{}", type_name, query_key)
    }

    /// Cache key of a `Q` result whose query key is `query_key`.
    pub fn key_of<Q: Query>(query_key: &str) -> String {
        Self::cache_key(std::any::type_name::<Q>(), query_key)
    }

    /// Cache key `query` is stored under, if it is cacheable.
    pub fn key_for<Q: Query>(query: &Q) -> Option<String> {
        query.cache_key().map(|key| Self::key_of::<Q>(&key))
    }
}

#[async_trait]
impl Middleware for QueryCacheMiddleware {
    fn name(&self) -> &'static str {
        "query_cache"
    }

    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        if envelope.kind() != MessageKind::Query {
            return next.run(envelope).await;
        }
        let Some(policy) = envelope.cache_policy().cloned() else {
            return next.run(envelope).await;
        };
        let key = Self::cache_key(envelope.type_name(), &policy.key);

        match self.store.get(&key).await {
            Ok(Some(reply)) => {
                debug!(key, "Query cache hit");
                return Ok(reply);
            }
            Ok(None) => debug!(key, "Query cache miss"),
            Err(err) => warn!(key, error = %err, "Query cache lookup failed"),
        }

        let result = next.run(envelope).await;
        if let Ok(reply) = &result {
            let ttl = Some(policy.ttl.unwrap_or(self.default_ttl));
            let stored = if policy.tags.is_empty() {
                self.store.set(&key, reply.clone(), ttl).await
            } else {
                self.store
                    .set_with_tags(&key, reply.clone(), ttl, &policy.tags)
                    .await
            };
            if let Err(err) = stored {
                warn!(key, error = %err, "Failed to cache query result");
            }
        }
        result
    }
}
