//! Object store collaborators.
//!
//! Everything the index layer needs from storage goes through
//! [`ObjectStore`]. Implementations can be stacked: a typical repository
//! uses `Sealed<Cached<Directory>>`, so the cache only ever holds sealed
//! bytes and the index layer only ever sees plaintext.
use crate::{crypto::CryptoError, id::ObjectId};

use async_trait::async_trait;
use std::{fmt, io, path::PathBuf, sync::Arc};

mod cached;
mod directory;
mod memory;
mod sealed;

pub use cached::Cached;
pub use directory::Directory;
pub use memory::InMemory;
pub use sealed::Sealed;

pub(crate) use directory::atomic_write;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("No object found: {handle}")]
    NotFound { handle: Handle },
    #[error("Crypto error: {source}")]
    Crypto {
        #[from]
        source: CryptoError,
    },
    #[error("Background task failed: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Backend Error: {source}")]
    Generic {
        #[from]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Kinds of objects a repository stores.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Config,
    Key,
    Lock,
    Snapshot,
    Index,
    Pack,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 6] = [
        ObjectClass::Config,
        ObjectClass::Key,
        ObjectClass::Lock,
        ObjectClass::Snapshot,
        ObjectClass::Index,
        ObjectClass::Pack,
    ];

    /// Directory name used by on-disk layouts.
    pub fn dir(&self) -> &'static str {
        match self {
            ObjectClass::Config => "config",
            ObjectClass::Key => "keys",
            ObjectClass::Lock => "locks",
            ObjectClass::Snapshot => "snapshots",
            ObjectClass::Index => "index",
            ObjectClass::Pack => "data",
        }
    }

    /// Only content-addressed objects that are never rewritten may be
    /// mirrored locally.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, ObjectClass::Index | ObjectClass::Snapshot)
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// Name of a single object in a store.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Handle {
    pub class: ObjectClass,
    pub id: ObjectId,
}

impl Handle {
    #[inline(always)]
    pub fn new(class: ObjectClass, id: ObjectId) -> Self {
        Handle { class, id }
    }

    #[inline(always)]
    pub fn index(id: ObjectId) -> Self {
        Handle::new(ObjectClass::Index, id)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.id)
    }
}

/// Typed, named storage of immutable objects.
///
/// Retries, authentication and transport security are the
/// implementation's business. `list` must eventually return every
/// object of a class that was successfully saved.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn save(&self, handle: Handle, data: Vec<u8>) -> Result<()>;
    async fn load(&self, handle: Handle) -> Result<Vec<u8>>;
    async fn stat(&self, handle: Handle) -> Result<u64>;
    async fn list(&self, class: ObjectClass) -> Result<Vec<(ObjectId, u64)>>;
    async fn remove(&self, handle: Handle) -> Result<()>;

    /// Drop any local copy of the object so the next `load` goes to
    /// the source. Returns whether there was a copy to drop.
    async fn invalidate(&self, _handle: Handle) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn save(&self, handle: Handle, data: Vec<u8>) -> Result<()> {
        (**self).save(handle, data).await
    }

    async fn load(&self, handle: Handle) -> Result<Vec<u8>> {
        (**self).load(handle).await
    }

    async fn stat(&self, handle: Handle) -> Result<u64> {
        (**self).stat(handle).await
    }

    async fn list(&self, class: ObjectClass) -> Result<Vec<(ObjectId, u64)>> {
        (**self).list(class).await
    }

    async fn remove(&self, handle: Handle) -> Result<()> {
        (**self).remove(handle).await
    }

    async fn invalidate(&self, handle: Handle) -> Result<bool> {
        (**self).invalidate(handle).await
    }
}

/// Which store to construct.
///
/// Selection is explicit: whoever opens a repository passes one of
/// these instead of consulting a global table of schemes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(tag = "type")]
pub enum BackendConfig {
    /// Use a directory on a local filesystem
    #[serde(rename = "fs")]
    #[allow(missing_docs)]
    Filesystem { path: PathBuf },

    /// Keep everything in memory for the lifetime of the process
    #[serde(rename = "memory")]
    Memory,
}

pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn ObjectStore>> {
    use BackendConfig::*;

    let backend: Arc<dyn ObjectStore> = match config {
        Filesystem { path } => Arc::new(Directory::new(path)?),
        Memory => Arc::new(InMemory::default()),
    };

    Ok(backend)
}

pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[cfg(any(test, feature = "test"))]
pub mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Wraps a store and fails the selected operations on demand.
    #[derive(Default)]
    pub struct Failing<S> {
        inner: S,
        fail_save: AtomicBool,
        fail_load: AtomicBool,
        fail_list: AtomicBool,
        saves: AtomicUsize,
        loads: AtomicUsize,
    }

    impl<S> Failing<S> {
        pub fn new(inner: S) -> Self {
            Failing {
                inner,
                fail_save: AtomicBool::new(false),
                fail_load: AtomicBool::new(false),
                fail_list: AtomicBool::new(false),
                saves: AtomicUsize::new(0),
                loads: AtomicUsize::new(0),
            }
        }

        pub fn inner(&self) -> &S {
            &self.inner
        }

        pub fn fail_saves(&self, fail: bool) {
            self.fail_save.store(fail, Ordering::SeqCst);
        }

        pub fn fail_loads(&self, fail: bool) {
            self.fail_load.store(fail, Ordering::SeqCst);
        }

        pub fn fail_lists(&self, fail: bool) {
            self.fail_list.store(fail, Ordering::SeqCst);
        }

        /// Number of successful saves so far.
        pub fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        /// Number of loads that reached the inner store.
        pub fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    fn injected(op: &str) -> BackendError {
        BackendError::Generic {
            source: anyhow::anyhow!("injected {op} failure"),
        }
    }

    #[async_trait]
    impl<S: ObjectStore> ObjectStore for Failing<S> {
        async fn save(&self, handle: Handle, data: Vec<u8>) -> Result<()> {
            if self.fail_save.load(Ordering::SeqCst) {
                return Err(injected("save"));
            }
            self.inner.save(handle, data).await?;
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn load(&self, handle: Handle) -> Result<Vec<u8>> {
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(injected("load"));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(handle).await
        }

        async fn stat(&self, handle: Handle) -> Result<u64> {
            self.inner.stat(handle).await
        }

        async fn list(&self, class: ObjectClass) -> Result<Vec<(ObjectId, u64)>> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(injected("list"));
            }
            self.inner.list(class).await
        }

        async fn remove(&self, handle: Handle) -> Result<()> {
            self.inner.remove(handle).await
        }

        async fn invalidate(&self, handle: Handle) -> Result<bool> {
            self.inner.invalidate(handle).await
        }
    }
}
