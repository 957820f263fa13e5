//! An open repository: the configured store, sealed and cached, with
//! its master index.
use crate::{
    backends::{self, BackendError, Cached, Handle, ObjectClass, ObjectStore, Sealed},
    cache::Cache,
    config::Config,
    crypto::Key,
    id::ObjectId,
    index::IndexError,
    master::MasterIndex,
};

use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Backend error: {source}")]
    Backend {
        #[from]
        source: BackendError,
    },
    #[error("Index error: {source}")]
    Index {
        #[from]
        source: IndexError,
    },
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

pub struct Repository {
    store: Arc<dyn ObjectStore>,
    index: MasterIndex,
    cache: Option<Arc<Cache>>,
    compact_threshold: usize,
}

impl Repository {
    /// Set up the object store described by `config`.
    ///
    /// Objects are sealed with a key derived from `key`. The local cache
    /// is best effort: if it can't be opened, the repository works
    /// without one.
    pub fn open(config: &Config, key: &Key) -> Result<Repository> {
        let upstream = backends::from_config(&config.backend)?;
        let cache = if config.cache.enabled {
            open_cache(config, key)
        } else {
            None
        };

        let store: Arc<dyn ObjectStore> = match &cache {
            Some(cache) => Arc::new(Sealed::new(
                Cached::new(upstream, cache.clone()),
                key.seal_key(),
            )),
            None => Arc::new(Sealed::new(upstream, key.seal_key())),
        };

        Ok(Repository {
            index: MasterIndex::new(store.clone(), config.index.clone()),
            store,
            cache,
            compact_threshold: config.index.compact_threshold,
        })
    }

    pub fn index(&self) -> &MasterIndex {
        &self.index
    }

    /// The plaintext view of the store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    /// Load every index in the store. Returns how many were new.
    pub async fn load(&self) -> Result<usize> {
        Ok(self.index.load().await?)
    }

    /// Finalize and upload the current session index, if it has records.
    pub async fn commit(&self) -> Result<Option<ObjectId>> {
        Ok(self.index.finalize_session().await?)
    }

    /// Compact small indexes, then delete the ones that were replaced.
    ///
    /// A failed delete leaves a superseded index behind, which is
    /// harmless; it is retried on the next compaction.
    pub async fn compact(&self) -> Result<Vec<ObjectId>> {
        let superseded = self.index.compact(self.compact_threshold).await?;

        for id in superseded.iter() {
            if let Err(error) = self.store.remove(Handle::index(*id)).await {
                warn!(%error, %id, "failed to remove superseded index");
            }
        }

        Ok(superseded)
    }

    /// Drop cached index objects that no longer exist in the store.
    pub async fn prune_cache(&self) -> Result<usize> {
        let Some(cache) = self.cache.clone() else {
            return Ok(0);
        };

        let valid: HashSet<ObjectId> = self
            .store
            .list(ObjectClass::Index)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let removed = tokio::task::spawn_blocking(move || cache.retain(ObjectClass::Index, &valid))
            .await
            .map_err(BackendError::from)?;

        match removed {
            Ok(removed) => Ok(removed),
            Err(error) => {
                warn!(%error, "failed to prune cache");
                Ok(0)
            }
        }
    }
}

fn open_cache(config: &Config, key: &Key) -> Option<Arc<Cache>> {
    let Some(base) = config.cache.dir.clone().or_else(Cache::default_dir) else {
        warn!("no cache directory available; running without a cache");
        return None;
    };

    match Cache::new(&base, &key.repository_id()) {
        Ok(cache) => {
            if cache.created() {
                info!(path = ?cache.path(), "created new cache");
            } else {
                debug!(path = ?cache.path(), "using existing cache");
            }
            Some(Arc::new(cache))
        }
        Err(error) => {
            warn!(%error, ?base, "failed to open cache; running without one");
            None
        }
    }
}
