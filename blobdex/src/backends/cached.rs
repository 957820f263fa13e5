use super::{blocking, Handle, ObjectClass, ObjectStore, Result};
use crate::{cache::Cache, id::ObjectId};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{trace, warn};

/// Serves immutable metadata from a local [`Cache`] before asking
/// `upstream`.
///
/// Only classes that report [`ObjectClass::is_cacheable`] ever touch
/// the cache. Cache failures are logged and otherwise ignored.
pub struct Cached<S> {
    upstream: S,
    cache: Arc<Cache>,
}

impl<S> Cached<S> {
    pub fn new(upstream: S, cache: Arc<Cache>) -> Self {
        Cached { upstream, cache }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn upstream(&self) -> &S {
        &self.upstream
    }

    async fn fill(&self, handle: Handle, data: Vec<u8>) {
        let cache = self.cache.clone();
        let stored = blocking(move || Ok(cache.put(handle.class, &handle.id, &data))).await;

        match stored {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, %handle, "failed to populate cache"),
            Err(error) => warn!(%error, %handle, "cache task failed"),
        }
    }

    async fn evict(&self, handle: Handle) -> Result<bool> {
        let cache = self.cache.clone();
        let removed = blocking(move || Ok(cache.remove(handle.class, &handle.id))).await?;

        match removed {
            Ok(removed) => Ok(removed),
            Err(error) => {
                warn!(%error, %handle, "failed to evict cache entry");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for Cached<S> {
    async fn save(&self, handle: Handle, data: Vec<u8>) -> Result<()> {
        if !handle.class.is_cacheable() {
            return self.upstream.save(handle, data).await;
        }

        self.upstream.save(handle, data.clone()).await?;
        self.fill(handle, data).await;

        Ok(())
    }

    async fn load(&self, handle: Handle) -> Result<Vec<u8>> {
        if !handle.class.is_cacheable() {
            return self.upstream.load(handle).await;
        }

        let cache = self.cache.clone();
        let hit = blocking(move || Ok(cache.load(handle.class, &handle.id))).await?;
        if let Some(data) = hit {
            trace!(%handle, "cache hit");
            return Ok(data);
        }

        let data = self.upstream.load(handle).await?;
        self.fill(handle, data.clone()).await;

        Ok(data)
    }

    async fn stat(&self, handle: Handle) -> Result<u64> {
        self.upstream.stat(handle).await
    }

    async fn list(&self, class: ObjectClass) -> Result<Vec<(ObjectId, u64)>> {
        self.upstream.list(class).await
    }

    async fn remove(&self, handle: Handle) -> Result<()> {
        self.upstream.remove(handle).await?;

        if handle.class.is_cacheable() {
            self.evict(handle).await?;
        }

        Ok(())
    }

    async fn invalidate(&self, handle: Handle) -> Result<bool> {
        if !handle.class.is_cacheable() {
            return self.upstream.invalidate(handle).await;
        }

        self.evict(handle).await
    }
}
