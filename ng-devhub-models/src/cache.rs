use async_trait::async_trait;
use futures::future::BoxFuture;
use ng_devhub_error::HubResult;
use std::sync::Arc;

/// Why an entry left a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    /// Removed by an explicit invalidation.
    Explicit,
    /// Overwritten by a newer value for the same key.
    Replaced,
    /// Dropped to stay under the capacity bound.
    Size,
    /// Expired after its idle/live time.
    Expired,
}

pub type EvictionFuture = BoxFuture<'static, ()>;

/// Asynchronous eviction callback; invoked once per removed entry.
pub type EvictionListener<K, V> = Arc<dyn Fn(K, V, EvictionCause) -> EvictionFuture + Send + Sync>;

/// Loading key/value cache.
///
/// Concurrent `get_or_load` calls for the same key run the loader once and
/// share its result (including a failure).
#[async_trait]
pub trait NGCache<K, V>: Send + Sync + 'static
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Get cache name
    fn name(&self) -> &str;

    async fn get(&self, key: &K) -> Option<V>;

    async fn get_or_load(&self, key: K, loader: BoxFuture<'_, HubResult<V>>) -> HubResult<V>;

    async fn insert(&self, key: K, value: V);

    async fn invalidate(&self, key: &K);

    /// Applies pending maintenance (evictions, listener notifications).
    async fn sync(&self);

    fn entry_count(&self) -> u64;

    fn values(&self) -> Vec<V>;
}
