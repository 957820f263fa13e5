//! Mapping of blobs to their location in packs.
//!
//! An [`Index`] is written by a single session. While open it accepts
//! new records; once finalized it is immutable and named by the digest
//! of its serialized form, which is also how it's stored.
//!
//! Within one index a later record for the same [`BlobHandle`] shadows
//! earlier ones. Only the latest record per handle is persisted.
use crate::{
    backends::BackendError,
    blob::{Blob, BlobHandle, BlobType, PackedBlob},
    config::IndexConfig,
    id::{BlobId, ObjectId, PackId},
};

use std::{
    collections::{BTreeSet, HashMap},
    time::Instant,
};
use thiserror::Error;

mod format;
use format::IndexFile;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index is already final")]
    AlreadyFinal,
    #[error("Index is not final")]
    NotFinal,
    #[error("Only final indexes can be merged")]
    Merge,
    #[error("Index {id} is corrupt: {reason}")]
    Corrupt { id: ObjectId, reason: String },
    #[error("Failed to list indexes: {source}")]
    List { source: BackendError },
    #[error("Failed to load index {id}: {source}")]
    Load { id: ObjectId, source: BackendError },
    #[error("Failed to upload index {id}: {source}")]
    Upload { id: ObjectId, source: BackendError },
    #[error("Blob {handle} is stored in more than one location")]
    Duplicate { handle: BlobHandle },
    #[error("Serialize failed: {source}")]
    Serialize {
        #[from]
        source: rmp_serde::encode::Error,
    },
}

impl IndexError {
    /// Misuse of the API rather than a failure of storage or data.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            IndexError::AlreadyFinal | IndexError::NotFinal | IndexError::Merge
        )
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Clone, Debug)]
pub struct Index {
    blobs: Vec<PackedBlob>,
    latest: HashMap<BlobHandle, usize>,
    supersedes: BTreeSet<ObjectId>,
    id: Option<ObjectId>,
    created: Instant,
}

impl Default for Index {
    fn default() -> Self {
        Index {
            blobs: vec![],
            latest: HashMap::new(),
            supersedes: BTreeSet::new(),
            id: None,
            created: Instant::now(),
        }
    }
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the index is finalized.
    #[inline(always)]
    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    #[inline(always)]
    pub fn is_final(&self) -> bool {
        self.id.is_some()
    }

    pub fn add(&mut self, blob: PackedBlob) -> Result<()> {
        if self.is_final() {
            return Err(IndexError::AlreadyFinal);
        }

        self.push(blob);
        Ok(())
    }

    /// Record every blob of a freshly written pack.
    pub fn store_pack(&mut self, pack: PackId, blobs: impl IntoIterator<Item = Blob>) -> Result<()> {
        if self.is_final() {
            return Err(IndexError::AlreadyFinal);
        }

        for blob in blobs {
            self.push(blob.in_pack(pack));
        }
        Ok(())
    }

    fn push(&mut self, blob: PackedBlob) {
        self.latest.insert(blob.handle(), self.blobs.len());
        self.blobs.push(blob);
    }

    pub fn lookup(&self, id: &BlobId, blob_type: BlobType) -> Option<PackedBlob> {
        self.get(&BlobHandle::new(*id, blob_type)).copied()
    }

    pub fn get(&self, handle: &BlobHandle) -> Option<&PackedBlob> {
        self.latest.get(handle).map(|&pos| &self.blobs[pos])
    }

    pub fn has(&self, handle: &BlobHandle) -> bool {
        self.latest.contains_key(handle)
    }

    pub fn add_to_supersedes(&mut self, id: ObjectId) -> Result<()> {
        if self.is_final() {
            return Err(IndexError::AlreadyFinal);
        }

        self.supersedes.insert(id);
        Ok(())
    }

    pub fn supersedes(&self) -> &BTreeSet<ObjectId> {
        &self.supersedes
    }

    /// Number of distinct blobs.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn count(&self, blob_type: BlobType) -> usize {
        self.latest
            .keys()
            .filter(|h| h.blob_type == blob_type)
            .count()
    }

    pub fn packs(&self) -> BTreeSet<PackId> {
        self.iter().map(|b| b.pack).collect()
    }

    /// Latest record of every blob, ordered by pack, then offset.
    pub fn iter(&self) -> impl Iterator<Item = &PackedBlob> + '_ {
        let mut current: Vec<&PackedBlob> =
            self.latest.values().map(|&pos| &self.blobs[pos]).collect();

        current.sort_unstable_by(|a, b| {
            (a.pack, a.offset, a.handle()).cmp(&(b.pack, b.offset, b.handle()))
        });
        current.into_iter()
    }

    /// Whether an open index should be finalized and a new one started.
    pub fn is_full(&self, config: &IndexConfig) -> bool {
        if self.is_final() || self.is_empty() {
            return false;
        }

        self.len() >= config.max_blobs || self.created.elapsed() >= config.max_age()
    }

    /// Freeze the index and give it its ID.
    pub fn finalize(&mut self) -> Result<ObjectId> {
        if self.is_final() {
            return Err(IndexError::AlreadyFinal);
        }

        let id = ObjectId::hash(self.encode()?);
        self.id = Some(id);

        Ok(id)
    }

    /// The bytes whose digest is the ID of this index.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if !self.is_final() {
            return Err(IndexError::NotFinal);
        }

        self.encode()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let file = IndexFile::new(&self.supersedes, self.iter());
        Ok(rmp_serde::to_vec_named(&file)?)
    }

    /// Decode a stored index object, checking it against its name.
    pub fn deserialize(id: ObjectId, bytes: &[u8]) -> Result<Index> {
        if ObjectId::hash(bytes) != id {
            return Err(IndexError::Corrupt {
                id,
                reason: "contents do not match the object ID".into(),
            });
        }

        let file: IndexFile = rmp_serde::from_slice(bytes).map_err(|e| IndexError::Corrupt {
            id,
            reason: e.to_string(),
        })?;

        let mut index = Index::new();
        index.supersedes.extend(file.supersedes.iter().copied());
        for blob in file.into_blobs() {
            index.push(blob);
        }
        index.id = Some(id);

        Ok(index)
    }

    /// An open copy with the same records, without an ID.
    pub(crate) fn reopen(&self) -> Index {
        Index {
            id: None,
            ..self.clone()
        }
    }

    pub(crate) fn extend(&mut self, blobs: impl IntoIterator<Item = PackedBlob>) {
        for blob in blobs {
            self.push(blob);
        }
    }

    /// Unlike [`Index::add_to_supersedes`], this can't fail: only call
    /// it on an index that is not final.
    pub(crate) fn extend_supersedes(&mut self, ids: impl IntoIterator<Item = ObjectId>) {
        debug_assert!(!self.is_final());
        self.supersedes.extend(ids);
    }

    /// Every record in insertion order, shadowed ones included.
    pub(crate) fn records(&self) -> &[PackedBlob] {
        &self.blobs
    }
}
