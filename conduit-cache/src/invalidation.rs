//! Event-driven cache invalidation.

use crate::error::CacheResult;
use crate::query_cache::QueryCacheMiddleware;
use crate::traits::CacheStore;
use async_trait::async_trait;
use conduit_core::{BusError, DispatchContext, Event, EventBus, EventHandler, Query};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// One thing to evict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Glob over full cache keys, e.g. `*user:42*`
    Pattern(String),
    /// Every entry carrying the tag
    Tag(String),
    /// A single full cache key
    Key(String),
}

impl Invalidation {
    /// Cached results of `Q` whose query key matches `key_pattern`.
    pub fn query<Q: Query>(key_pattern: &str) -> Self {
        Self::Pattern(QueryCacheMiddleware::key_of::<Q>(key_pattern))
    }

    /// Every cached result of `Q`.
    pub fn all_of<Q: Query>() -> Self {
        Self::query::<Q>("*")
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag(tag.into())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern(pattern.into())
    }
}

/// Clears cached query results when domain events are published.
///
/// ```rust,ignore
/// let strategy = CacheInvalidationStrategy::new(cache.clone());
/// strategy.on::<UserRenamed, _>(&mut event_bus, |event| {
///     vec![Invalidation::pattern(format!("*user:{}*", event.user_id))]
/// });
/// ```
///
/// Invalidation is eventually consistent: a query running concurrently with
/// the mutating command may cache a stale result until the event arrives.
#[derive(Clone)]
pub struct CacheInvalidationStrategy {
    store: Arc<dyn CacheStore>,
}

impl CacheInvalidationStrategy {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Subscribe to `E` on `bus`, evicting what `derive` returns for each event.
    pub fn on<E, F>(&self, bus: &mut EventBus, derive: F)
    where
        E: Event,
        F: Fn(&E) -> Vec<Invalidation> + Send + Sync + 'static,
    {
        bus.subscribe::<E, _>(InvalidationSubscriber {
            store: self.store.clone(),
            derive,
            _event: PhantomData,
        });
    }

    /// Evict everything described by `invalidations`. Returns the eviction count.
    pub async fn invalidate(&self, invalidations: &[Invalidation]) -> CacheResult<usize> {
        apply(self.store.as_ref(), invalidations).await
    }
}

async fn apply(store: &dyn CacheStore, invalidations: &[Invalidation]) -> CacheResult<usize> {
    let mut evicted = 0;
    for invalidation in invalidations {
        evicted += match invalidation {
            Invalidation::Pattern(pattern) => store.clear_pattern(pattern).await?,
            Invalidation::Tag(tag) => store.invalidate_tag(tag).await?,
            Invalidation::Key(key) => usize::from(store.delete(key).await?),
        };
    }
    Ok(evicted)
}

struct InvalidationSubscriber<E, F> {
    store: Arc<dyn CacheStore>,
    derive: F,
    _event: PhantomData<fn(&E)>,
}

#[async_trait]
impl<E, F> EventHandler<E> for InvalidationSubscriber<E, F>
where
    E: Event,
    F: Fn(&E) -> Vec<Invalidation> + Send + Sync + 'static,
{
    async fn handle(&self, event: &E, _ctx: &DispatchContext) -> Result<(), BusError> {
        let invalidations = (self.derive)(event);
        if invalidations.is_empty() {
            debug!(event = E::message_name(), "Nothing to invalidate");
            return Ok(());
        }

        let evicted = apply(self.store.as_ref(), &invalidations).await?;
        info!(
            event = E::message_name(),
            evicted,
            rules = invalidations.len(),
            "Cache invalidated"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "cache-invalidation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCache;
    use conduit_core::{EventBusConfig, Message, Reply};

    #[derive(Debug)]
    struct UserRenamed {
        user_id: u64,
    }

    impl Message for UserRenamed {}
    impl Event for UserRenamed {}

    #[derive(Debug)]
    struct CatalogRebuilt;

    impl Message for CatalogRebuilt {}
    impl Event for CatalogRebuilt {}

    #[derive(Debug)]
    struct GetUser;

    impl Message for GetUser {}

    impl Query for GetUser {
        type Output = String;
    }

    mod staff {
        use super::*;

        #[derive(Debug)]
        pub struct GetUser;

        impl Message for GetUser {}

        impl Query for GetUser {
            type Output = String;
        }
    }

    fn user_key(query_key: &str) -> String {
        QueryCacheMiddleware::key_of::<GetUser>(query_key)
    }

    fn staff_key(query_key: &str) -> String {
        QueryCacheMiddleware::key_of::<staff::GetUser>(query_key)
    }

    fn reply() -> Reply {
        Arc::new(())
    }

    async fn seeded() -> InMemoryCache {
        let cache = InMemoryCache::new();
        let catalog = vec!["catalog".to_string()];
        cache.set(&user_key("user:42"), reply(), None).await.unwrap();
        cache.set("query:ListOrders:user:42:page:1", reply(), None).await.unwrap();
        cache.set(&user_key("user:7"), reply(), None).await.unwrap();
        cache.set(&staff_key("user:42"), reply(), None).await.unwrap();
        cache
            .set_with_tags("query:ListProducts:all", reply(), None, &catalog)
            .await
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn test_event_clears_matching_pattern() {
        let cache = seeded().await;
        let strategy = CacheInvalidationStrategy::new(Arc::new(cache.clone()));
        let mut bus = EventBus::with_config(EventBusConfig {
            raise_on_error: true,
            ..Default::default()
        });
        strategy.on::<UserRenamed, _>(&mut bus, |event| {
            vec![Invalidation::pattern(format!("*user:{}*", event.user_id))]
        });

        bus.publish(UserRenamed { user_id: 42 }).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.exists(&user_key("user:7")).await.unwrap());
    }

    #[tokio::test]
    async fn test_tag_and_query_rules() {
        let cache = seeded().await;
        let strategy = CacheInvalidationStrategy::new(Arc::new(cache.clone()));
        let mut bus = EventBus::new();
        strategy.on::<CatalogRebuilt, _>(&mut bus, |_| vec![Invalidation::tag("catalog")]);
        assert_eq!(bus.handler_count::<CatalogRebuilt>(), 1);

        bus.publish(CatalogRebuilt).await.unwrap();
        assert!(!cache.exists("query:ListProducts:all").await.unwrap());

        let evicted = strategy
            .invalidate(&[
                Invalidation::all_of::<GetUser>(),
                Invalidation::Key("query:ListOrders:user:42:page:1".into()),
                Invalidation::Key("query:missing".into()),
            ])
            .await
            .unwrap();
        assert_eq!(evicted, 3);
        assert_eq!(cache.len(), 1);
        assert!(cache.exists(&staff_key("user:42")).await.unwrap());
    }

    #[test]
    fn test_query_patterns() {
        assert_eq!(
            Invalidation::query::<GetUser>("user:42"),
            Invalidation::Pattern(user_key("user:42"))
        );
        assert_eq!(
            Invalidation::all_of::<GetUser>(),
            Invalidation::Pattern(user_key("*"))
        );
        assert_ne!(
            Invalidation::all_of::<GetUser>(),
            Invalidation::all_of::<staff::GetUser>()
        );
    }
}
