use super::{BackendError, Handle, ObjectClass, ObjectStore, Result};
use crate::id::ObjectId;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// A store that lives and dies with the process.
///
/// Clones share the same contents.
#[derive(Clone, Default)]
pub struct InMemory(Arc<Mutex<HashMap<Handle, Arc<[u8]>>>>);

impl InMemory {
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn contains(&self, handle: &Handle) -> bool {
        self.0.lock().contains_key(handle)
    }
}

#[async_trait]
impl ObjectStore for InMemory {
    async fn save(&self, handle: Handle, data: Vec<u8>) -> Result<()> {
        self.0.lock().insert(handle, data.into());
        Ok(())
    }

    async fn load(&self, handle: Handle) -> Result<Vec<u8>> {
        self.0
            .lock()
            .get(&handle)
            .map(|data| data.to_vec())
            .ok_or(BackendError::NotFound { handle })
    }

    async fn stat(&self, handle: Handle) -> Result<u64> {
        self.0
            .lock()
            .get(&handle)
            .map(|data| data.len() as u64)
            .ok_or(BackendError::NotFound { handle })
    }

    async fn list(&self, class: ObjectClass) -> Result<Vec<(ObjectId, u64)>> {
        Ok(self
            .0
            .lock()
            .iter()
            .filter(|(h, _)| h.class == class)
            .map(|(h, data)| (h.id, data.len() as u64))
            .collect())
    }

    async fn remove(&self, handle: Handle) -> Result<()> {
        self.0.lock().remove(&handle);
        Ok(())
    }
}
