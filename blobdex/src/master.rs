//! The repository-wide view over every index.
//!
//! A [`MasterIndex`] keeps three kinds of state:
//!
//!  * the *permanent* set of merged, final indexes together with an
//!    accelerator mapping every [`BlobHandle`] to its authoritative
//!    location. This is replaced wholesale on every merge, so readers
//!    see either the old or the new set in full.
//!  * the *open* state: the session index that is still being written,
//!    indexes whose upload is in flight, final indexes waiting for the
//!    next merge, and handles reserved by [`MasterIndex::add_pending`].
//!  * a writer lock that serializes everything that changes the
//!    permanent set.
//!
//! When an index moves from open to permanent, the permanent state is
//! swapped first and the open state updated second. Readers look at the
//! open state first, so a record is never invisible in between.
use crate::{
    backends::{Handle, ObjectClass, ObjectStore},
    blob::{Blob, BlobHandle, BlobType, PackedBlob},
    config::{DuplicatePolicy, IndexConfig},
    id::{BlobId, ObjectId, PackId},
    index::{Index, IndexError, Result},
};

use futures::{stream, StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    mem,
    sync::Arc,
};
use tracing::{debug, info, warn};

pub struct MasterIndex {
    store: Arc<dyn ObjectStore>,
    config: IndexConfig,
    permanent: RwLock<Arc<Merged>>,
    open: Mutex<Open>,
    writer: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Open {
    session: Index,
    uploading: Vec<Arc<Index>>,
    unmerged: Vec<Arc<Index>>,
    reserved: HashSet<BlobHandle>,
}

impl Open {
    fn lookup(&self, handle: &BlobHandle) -> Option<PackedBlob> {
        self.session
            .get(handle)
            .or_else(|| {
                self.uploading
                    .iter()
                    .rev()
                    .chain(self.unmerged.iter().rev())
                    .find_map(|index| index.get(handle))
            })
            .copied()
    }
}

#[derive(Default)]
struct Merged {
    indexes: Vec<Arc<Index>>,
    lookup: HashMap<BlobHandle, PackedBlob>,
}

impl Merged {
    /// Merge `indexes` in the given order.
    ///
    /// An index is always applied after every index it supersedes;
    /// otherwise later indexes win.
    fn build(indexes: Vec<Arc<Index>>, policy: DuplicatePolicy) -> Result<Merged> {
        if indexes.iter().any(|index| !index.is_final()) {
            return Err(IndexError::Merge);
        }

        let mut sources: HashMap<BlobHandle, (PackedBlob, usize)> = HashMap::new();
        let mut duplicates = 0usize;

        for pos in merge_order(&indexes) {
            let index = &indexes[pos];

            for blob in index.iter() {
                let handle = blob.handle();
                let Some((previous, from)) = sources.insert(handle, (*blob, pos)) else {
                    continue;
                };

                if previous.same_location(blob) || related(&indexes[from], index) {
                    continue;
                }

                match policy {
                    DuplicatePolicy::Reject => return Err(IndexError::Duplicate { handle }),
                    DuplicatePolicy::Warn | DuplicatePolicy::LastWins => duplicates += 1,
                }
            }
        }

        if duplicates > 0 && policy == DuplicatePolicy::Warn {
            warn!(
                duplicates,
                "blobs found in more than one location; using the most recently merged"
            );
        }

        Ok(Merged {
            indexes,
            lookup: sources
                .into_iter()
                .map(|(handle, (blob, _))| (handle, blob))
                .collect(),
        })
    }

    /// A new state with `extra` merged after the current indexes.
    ///
    /// Indexes that are already part of the set are skipped.
    fn with(
        &self,
        extra: impl IntoIterator<Item = Arc<Index>>,
        policy: DuplicatePolicy,
    ) -> Result<Merged> {
        let mut known = self.ids();
        let mut indexes = self.indexes.clone();

        for index in extra {
            match index.id() {
                Some(id) if !known.insert(id) => continue,
                _ => indexes.push(index),
            }
        }

        Merged::build(indexes, policy)
    }

    fn ids(&self) -> HashSet<ObjectId> {
        self.indexes.iter().filter_map(|index| index.id()).collect()
    }
}

fn related(a: &Index, b: &Index) -> bool {
    let supersedes =
        |x: &Index, y: &Index| y.id().is_some_and(|id| x.supersedes().contains(&id));
    supersedes(a, b) || supersedes(b, a)
}

/// Positions of `indexes` in merge order, except that an index is
/// pulled forward to just before the first index superseding it.
///
/// Unrelated indexes keep their relative order, so whatever was merged
/// last still wins.
fn merge_order(indexes: &[Arc<Index>]) -> Vec<usize> {
    fn visit(
        pos: usize,
        indexes: &[Arc<Index>],
        position: &HashMap<ObjectId, usize>,
        visited: &mut [bool],
        order: &mut Vec<usize>,
    ) {
        // a cycle would need a hash collision, but don't recurse forever
        if std::mem::replace(&mut visited[pos], true) {
            return;
        }

        for id in indexes[pos].supersedes() {
            if let Some(&p) = position.get(id) {
                visit(p, indexes, position, visited, order);
            }
        }

        order.push(pos);
    }

    let position: HashMap<ObjectId, usize> = indexes
        .iter()
        .enumerate()
        .filter_map(|(pos, index)| index.id().map(|id| (id, pos)))
        .collect();

    let mut visited = vec![false; indexes.len()];
    let mut order = Vec::with_capacity(indexes.len());
    for pos in 0..indexes.len() {
        visit(pos, indexes, &position, &mut visited, &mut order);
    }

    order
}

/// Puts an index whose upload did not complete back into the session.
struct Uploading<'a> {
    master: &'a MasterIndex,
    index: Arc<Index>,
    committed: bool,
}

impl Uploading<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Uploading<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let mut open = self.master.open.lock();
        open.uploading.retain(|i| !Arc::ptr_eq(i, &self.index));

        // records inserted while the upload was in flight are newer
        let mut session = self.index.reopen();
        session.extend(open.session.records().iter().copied());
        session.extend_supersedes(open.session.supersedes().iter().copied());
        open.session = session;

        debug!(blobs = open.session.len(), "rolled back session index");
    }
}

async fn fetch(store: &dyn ObjectStore, id: ObjectId) -> Result<Index> {
    let bytes = store
        .load(Handle::index(id))
        .await
        .map_err(|source| IndexError::Load { id, source })?;

    Index::deserialize(id, &bytes)
}

/// Stream every index object in `store` into `f`.
///
/// `f` receives each index or the error that prevented loading it, in
/// no particular order. An error returned by `f` stops the walk.
pub async fn for_all_indexes<E, F>(
    store: &dyn ObjectStore,
    concurrency: usize,
    mut f: F,
) -> std::result::Result<(), E>
where
    E: From<IndexError>,
    F: FnMut(ObjectId, Result<Index>) -> std::result::Result<(), E>,
{
    let ids = store
        .list(ObjectClass::Index)
        .await
        .map_err(|source| IndexError::List { source })?;

    let mut indexes = stream::iter(ids)
        .map(|(id, _)| async move { (id, fetch(store, id).await) })
        .buffer_unordered(concurrency.max(1));

    while let Some((id, index)) = indexes.next().await {
        f(id, index)?;
    }

    Ok(())
}

impl MasterIndex {
    pub fn new(store: Arc<dyn ObjectStore>, config: IndexConfig) -> Self {
        MasterIndex {
            store,
            config,
            permanent: RwLock::default(),
            open: Mutex::default(),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn lookup(&self, id: &BlobId, blob_type: BlobType) -> Option<PackedBlob> {
        self.get(&BlobHandle::new(*id, blob_type))
    }

    pub fn get(&self, handle: &BlobHandle) -> Option<PackedBlob> {
        if let Some(found) = self.open.lock().lookup(handle) {
            return Some(found);
        }

        self.permanent.read().lookup.get(handle).copied()
    }

    /// Whether the blob is stored, or about to be stored by someone
    /// who called [`add_pending`](Self::add_pending).
    pub fn has(&self, id: &BlobId, blob_type: BlobType) -> bool {
        let handle = BlobHandle::new(*id, blob_type);
        if self.open.lock().reserved.contains(&handle) {
            return true;
        }

        self.get(&handle).is_some()
    }

    /// Reserve `handle` for the caller if nobody has stored or reserved
    /// it yet.
    ///
    /// Returns `true` exactly once per unknown handle. The reservation
    /// ends when the blob is inserted, or with
    /// [`release_pending`](Self::release_pending).
    pub fn add_pending(&self, handle: BlobHandle) -> bool {
        let mut open = self.open.lock();

        if open.reserved.contains(&handle)
            || open.lookup(&handle).is_some()
            || self.permanent.read().lookup.contains_key(&handle)
        {
            return false;
        }

        open.reserved.insert(handle)
    }

    /// Give up a reservation, e.g. because writing the blob failed.
    pub fn release_pending(&self, handle: &BlobHandle) -> bool {
        self.open.lock().reserved.remove(handle)
    }

    pub fn insert_session_record(&self, blob: PackedBlob) -> Result<()> {
        let mut open = self.open.lock();
        open.session.add(blob)?;
        open.reserved.remove(&blob.handle());

        Ok(())
    }

    /// Record every blob of a pack that was just written.
    pub fn store_pack(&self, pack: PackId, blobs: impl IntoIterator<Item = Blob>) -> Result<()> {
        let blobs: Vec<Blob> = blobs.into_iter().collect();

        let mut open = self.open.lock();
        open.session.store_pack(pack, blobs.iter().copied())?;
        for blob in blobs.iter() {
            open.reserved.remove(&blob.handle);
        }

        Ok(())
    }

    pub fn session_len(&self) -> usize {
        self.open.lock().session.len()
    }

    pub fn session_is_full(&self) -> bool {
        self.open.lock().session.is_full(&self.config)
    }

    /// Finalize the session index only if it has grown past the
    /// configured limits.
    pub async fn finalize_full_session(&self) -> Result<Option<ObjectId>> {
        if !self.session_is_full() {
            return Ok(None);
        }

        self.finalize_session().await
    }

    /// Finalize, upload and merge the session index, then start a new one.
    ///
    /// Returns `None` if the session had no records. If the upload fails
    /// or this future is dropped before it completes, the records are
    /// put back into the session, together with anything inserted in
    /// the meantime.
    pub async fn finalize_session(&self) -> Result<Option<ObjectId>> {
        let _writer = self.writer.lock().await;

        let (id, index) = {
            let mut open = self.open.lock();
            if open.session.is_empty() {
                return Ok(None);
            }

            let mut session = mem::take(&mut open.session);
            let id = match session.finalize() {
                Ok(id) => id,
                Err(error) => {
                    open.session = session;
                    return Err(error);
                }
            };

            let index = Arc::new(session);
            open.uploading.push(index.clone());
            (id, index)
        };

        let guard = Uploading {
            master: self,
            index: index.clone(),
            committed: false,
        };

        let bytes = index.serialize()?;
        let merged = self
            .permanent
            .read()
            .clone()
            .with([index.clone()], self.config.duplicates)?;

        self.store
            .save(Handle::index(id), bytes)
            .await
            .map_err(|source| IndexError::Upload { id, source })?;

        self.swap(merged, |open| {
            open.uploading.retain(|i| !Arc::ptr_eq(i, &index));
        });
        guard.commit();

        debug!(%id, blobs = index.len(), "finalized session index");
        Ok(Some(id))
    }

    /// Queue an index that was finalized elsewhere for the next
    /// [`merge_final_indexes`](Self::merge_final_indexes).
    ///
    /// Its records are visible to lookups right away.
    pub fn insert_final(&self, index: Index) -> Result<()> {
        if !index.is_final() {
            return Err(IndexError::NotFinal);
        }

        self.open.lock().unmerged.push(Arc::new(index));
        Ok(())
    }

    /// Merge every queued final index into the permanent set.
    ///
    /// Returns the number of indexes merged and the size of the
    /// permanent set afterwards.
    pub async fn merge_final_indexes(&self) -> Result<(usize, usize)> {
        let _writer = self.writer.lock().await;

        let pending = self.open.lock().unmerged.clone();
        let current = self.permanent.read().clone();
        if pending.is_empty() {
            return Ok((0, current.indexes.len()));
        }

        let merged = current.with(pending.iter().cloned(), self.config.duplicates)?;
        let total = merged.indexes.len();

        self.swap(merged, |open| {
            open.unmerged
                .retain(|i| !pending.iter().any(|p| Arc::ptr_eq(p, i)));
        });

        debug!(merged = pending.len(), total, "merged final indexes");
        Ok((pending.len(), total))
    }

    /// Load every index object in the store that isn't merged yet.
    ///
    /// Returns the number of indexes loaded. Nothing changes unless
    /// every one of them could be loaded and merged.
    pub async fn load(&self) -> Result<usize> {
        let _writer = self.writer.lock().await;

        let current = self.permanent.read().clone();
        let known = current.ids();

        let mut ids: Vec<ObjectId> = self
            .store
            .list(ObjectClass::Index)
            .await
            .map_err(|source| IndexError::List { source })?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !known.contains(id))
            .collect();
        ids.sort_unstable();
        ids.dedup();

        if ids.is_empty() {
            return Ok(0);
        }

        let store = self.store.as_ref();
        let loaded: Vec<Arc<Index>> = stream::iter(ids)
            .map(|id| fetch(store, id))
            .buffered(self.config.load_concurrency.max(1))
            .map_ok(Arc::new)
            .try_collect()
            .await?;

        let count = loaded.len();
        let merged = current.with(loaded, self.config.duplicates)?;
        let total = merged.indexes.len();
        let ids = merged.ids();

        self.swap(merged, |open| {
            open.unmerged
                .retain(|i| !i.id().is_some_and(|id| ids.contains(&id)));
        });

        info!(loaded = count, total, "loaded indexes");
        Ok(count)
    }

    /// Replace small indexes with a single one that supersedes them.
    ///
    /// Returns the IDs of the replaced indexes, which the caller may
    /// then delete from the store. Nothing changes if the new index
    /// can't be uploaded.
    pub async fn compact(&self, threshold: usize) -> Result<Vec<ObjectId>> {
        let _writer = self.writer.lock().await;

        let current = self.permanent.read().clone();
        let dead: HashSet<ObjectId> = current
            .indexes
            .iter()
            .flat_map(|index| index.supersedes().iter().copied())
            .collect();

        let candidates: Vec<&Arc<Index>> = current
            .indexes
            .iter()
            .filter(|index| index.len() < threshold)
            .filter(|index| index.id().is_some_and(|id| !dead.contains(&id)))
            .collect();

        if candidates.len() < 2 {
            return Ok(vec![]);
        }

        let mut compacted = Index::new();
        let mut superseded = vec![];
        for index in candidates.iter() {
            if let Some(id) = index.id() {
                compacted.add_to_supersedes(id)?;
                superseded.push(id);
            }

            for blob in index.iter() {
                if current.lookup.get(&blob.handle()) == Some(blob) {
                    compacted.add(*blob)?;
                }
            }
        }
        superseded.sort_unstable();

        let id = compacted.finalize()?;
        let bytes = compacted.serialize()?;
        let compacted = Arc::new(compacted);

        let remaining = current
            .indexes
            .iter()
            .filter(|index| !candidates.iter().any(|c| Arc::ptr_eq(c, index)))
            .cloned()
            .chain([compacted.clone()])
            .collect();
        let merged = Merged::build(remaining, self.config.duplicates)?;

        self.store
            .save(Handle::index(id), bytes)
            .await
            .map_err(|source| IndexError::Upload { id, source })?;

        self.swap(merged, |_| {});

        info!(
            %id,
            blobs = compacted.len(),
            superseded = superseded.len(),
            "compacted indexes"
        );
        Ok(superseded)
    }

    fn swap(&self, merged: Merged, update: impl FnOnce(&mut Open)) {
        *self.permanent.write() = Arc::new(merged);
        update(&mut self.open.lock());
    }

    /// IDs of the merged indexes, sorted.
    pub fn index_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.permanent.read().ids().into_iter().collect();
        ids.sort_unstable();
        ids
    }

    pub fn index_count(&self) -> usize {
        self.permanent.read().indexes.len()
    }

    /// Every pack referenced by a merged index.
    pub fn packs(&self) -> BTreeSet<PackId> {
        self.permanent
            .read()
            .lookup
            .values()
            .map(|blob| blob.pack)
            .collect()
    }

    /// Number of distinct blobs of `blob_type` in the merged indexes.
    pub fn count(&self, blob_type: BlobType) -> usize {
        self.permanent
            .read()
            .lookup
            .keys()
            .filter(|handle| handle.blob_type == blob_type)
            .count()
    }

    /// Call `f` with the authoritative record of every merged blob.
    pub fn each(&self, mut f: impl FnMut(&PackedBlob)) {
        let merged = self.permanent.read().clone();
        for blob in merged.lookup.values() {
            f(blob);
        }
    }
}
