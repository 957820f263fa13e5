use super::{BackendError, Handle, ObjectClass, ObjectStore, Result};
use crate::{compress, crypto::CryptoProvider, id::ObjectId};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Compresses and seals objects on the way into `upstream`, and opens
/// them on the way out.
///
/// Anything above a `Sealed` store deals in plaintext only.
pub struct Sealed<S> {
    upstream: S,
    crypto: Arc<dyn CryptoProvider>,
}

impl<S> Sealed<S> {
    pub fn new(upstream: S, crypto: impl CryptoProvider + 'static) -> Self {
        Sealed {
            upstream,
            crypto: Arc::new(crypto),
        }
    }

    pub fn upstream(&self) -> &S {
        &self.upstream
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.crypto.open(sealed)?;
        compress::decompress(&compressed).map_err(BackendError::from)
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for Sealed<S> {
    async fn save(&self, handle: Handle, data: Vec<u8>) -> Result<()> {
        let sealed = self.crypto.seal(&compress::compress(&data)?)?;
        self.upstream.save(handle, sealed).await
    }

    /// A local copy that fails to open is dropped and the object is
    /// fetched once more from the source.
    async fn load(&self, handle: Handle) -> Result<Vec<u8>> {
        let sealed = self.upstream.load(handle).await?;

        let error = match self.unseal(&sealed) {
            Ok(data) => return Ok(data),
            Err(error) => error,
        };

        if !self.upstream.invalidate(handle).await? {
            return Err(error);
        }

        warn!(%error, %handle, "dropped unreadable local copy");
        let sealed = self.upstream.load(handle).await?;
        self.unseal(&sealed)
    }

    async fn stat(&self, handle: Handle) -> Result<u64> {
        self.upstream.stat(handle).await
    }

    async fn list(&self, class: ObjectClass) -> Result<Vec<(ObjectId, u64)>> {
        self.upstream.list(class).await
    }

    async fn remove(&self, handle: Handle) -> Result<()> {
        self.upstream.remove(handle).await
    }

    async fn invalidate(&self, handle: Handle) -> Result<bool> {
        self.upstream.invalidate(handle).await
    }
}
