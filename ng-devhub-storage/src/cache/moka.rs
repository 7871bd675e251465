use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use moka::{
    future::{Cache as MokaInner, CacheBuilder},
    notification::{ListenerFuture, RemovalCause},
};
use ng_devhub_error::HubResult;
use ng_devhub_models::cache::{EvictionCause, EvictionListener, NGCache};
use std::{hash::Hash, sync::Arc, time::Duration};
use tracing::trace;

/// Moka-based in-memory loading cache.
pub struct MokaCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Logical cache name for logging and debugging
    name: String,
    /// The underlying moka cache
    inner: MokaInner<K, V>,
}

impl<K, V> MokaCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache.
    ///
    /// # Arguments
    /// * `name` - Logical cache name
    /// * `max_capacity` - Entry bound; unbounded when `None`
    /// * `time_to_idle` - Idle expiry; entries never expire when `None`
    /// * `listener` - Invoked asynchronously for every evicted entry
    pub fn new(
        name: impl Into<String>,
        max_capacity: Option<u64>,
        time_to_idle: Option<Duration>,
        listener: Option<EvictionListener<K, V>>,
    ) -> Self {
        let name = name.into();
        let mut builder: CacheBuilder<K, V, MokaInner<K, V>> = MokaInner::builder().name(&name);
        if let Some(capacity) = max_capacity {
            builder = builder.max_capacity(capacity);
        }
        if let Some(tti) = time_to_idle {
            builder = builder.time_to_idle(tti);
        }
        if let Some(listener) = listener {
            let cache_name = name.clone();
            builder = builder.async_eviction_listener(
                move |key: Arc<K>, value: V, cause: RemovalCause| -> ListenerFuture {
                    trace!(cache = %cache_name, ?cause, "Cache entry evicted");
                    listener((*key).clone(), value, map_cause(cause)).boxed()
                },
            );
        }
        Self {
            name,
            inner: builder.build(),
        }
    }

    /// Unbounded cache without expiry or listener.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, None, None, None)
    }
}

#[inline]
fn map_cause(cause: RemovalCause) -> EvictionCause {
    match cause {
        RemovalCause::Explicit => EvictionCause::Explicit,
        RemovalCause::Replaced => EvictionCause::Replaced,
        RemovalCause::Size => EvictionCause::Size,
        RemovalCause::Expired => EvictionCause::Expired,
    }
}

#[async_trait]
impl<K, V> NGCache<K, V> for MokaCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).await
    }

    async fn get_or_load(&self, key: K, loader: BoxFuture<'_, HubResult<V>>) -> HubResult<V> {
        self.inner
            .try_get_with(key, loader)
            .await
            .map_err(|e| (*e).clone())
    }

    async fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value).await
    }

    async fn invalidate(&self, key: &K) {
        self.inner.invalidate(key).await
    }

    async fn sync(&self) {
        self.inner.run_pending_tasks().await
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    fn values(&self) -> Vec<V> {
        self.inner.iter().map(|(_, v)| v).collect()
    }
}
