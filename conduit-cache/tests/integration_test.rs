//! Integration tests for conduit-cache

use async_trait::async_trait;
use conduit_cache::*;
use conduit_core::{
    BusError, DispatchContext, Event, EventBus, Message, Query, QueryBus, QueryHandler,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct GetUserName {
    user_id: u64,
}

impl Message for GetUserName {}

impl Query for GetUserName {
    type Output = String;

    fn cache_key(&self) -> Option<String> {
        Some(format!("user:{}", self.user_id))
    }
}

#[derive(Debug)]
struct UserRenamed {
    user_id: u64,
}

impl Message for UserRenamed {}
impl Event for UserRenamed {}

struct GetUserNameHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl QueryHandler<GetUserName> for GetUserNameHandler {
    async fn handle(&self, query: &GetUserName, _ctx: &DispatchContext) -> Result<String, BusError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("user-{}-v{}", query.user_id, n))
    }
}

#[tokio::test]
async fn test_query_bus_cache_and_event_invalidation() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new());
    let calls = Arc::new(AtomicU32::new(0));

    let mut queries = QueryBus::new();
    queries.use_middleware(QueryCacheMiddleware::new(cache.clone(), Duration::from_secs(60)));
    queries
        .register::<GetUserName, _>(GetUserNameHandler {
            calls: calls.clone(),
        })
        .unwrap();

    let mut events = EventBus::new();
    CacheInvalidationStrategy::new(cache.clone()).on::<UserRenamed, _>(&mut events, |e| {
        vec![Invalidation::pattern(format!("*user:{}", e.user_id))]
    });

    let first = queries.dispatch(GetUserName { user_id: 42 }).await.unwrap();
    let second = queries.dispatch(GetUserName { user_id: 42 }).await.unwrap();
    assert_eq!(first, "user-42-v1");
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    events.publish(UserRenamed { user_id: 42 }).await.unwrap();

    let third = queries.dispatch(GetUserName { user_id: 42 }).await.unwrap();
    assert_eq!(third, "user-42-v2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidation_of_unrelated_user_keeps_entry() {
    let cache = InMemoryCache::new();
    cache
        .set("query:GetUserName:user:4", Arc::new(()), None)
        .await
        .unwrap();

    let strategy = CacheInvalidationStrategy::new(Arc::new(cache.clone()));
    let evicted = strategy
        .invalidate(&[Invalidation::pattern("*user:42")])
        .await
        .unwrap();

    assert_eq!(evicted, 0);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_cache_error_display() {
    let err = CacheError::Backend("Failed to connect".to_string());
    assert!(err.to_string().contains("Failed to connect"));

    let bus: BusError = err.into();
    assert!(matches!(bus, BusError::Internal(_)));
}
