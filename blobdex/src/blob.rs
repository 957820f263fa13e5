use crate::id::{BlobId, PackId};

use std::fmt;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobType::Data => f.write_str("data"),
            BlobType::Tree => f.write_str("tree"),
        }
    }
}

/// The identity of a blob for deduplication purposes.
///
/// The same digest under a different type is a different blob.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlobHandle {
    pub id: BlobId,
    pub blob_type: BlobType,
}

impl BlobHandle {
    #[inline(always)]
    pub fn new(id: BlobId, blob_type: BlobType) -> Self {
        BlobHandle { id, blob_type }
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}/{}>", self.blob_type, self.id.short())
    }
}

/// A blob as written into a pack, before the pack ID is attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Blob {
    pub handle: BlobHandle,
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: u32,
}

impl Blob {
    pub fn in_pack(self, pack: PackId) -> PackedBlob {
        PackedBlob {
            id: self.handle.id,
            blob_type: self.handle.blob_type,
            pack,
            offset: self.offset,
            length: self.length,
            uncompressed_length: self.uncompressed_length,
        }
    }
}

/// Where exactly a blob lives.
///
/// `offset` and `length` describe the sealed region inside the pack.
/// `uncompressed_length` is the plaintext size, or 0 when unknown or
/// the blob is stored uncompressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackedBlob {
    pub id: BlobId,
    pub blob_type: BlobType,
    pub pack: PackId,
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: u32,
}

impl PackedBlob {
    #[inline(always)]
    pub fn handle(&self) -> BlobHandle {
        BlobHandle::new(self.id, self.blob_type)
    }

    /// Plaintext size of the blob, falling back to the stored length.
    pub fn data_length(&self) -> u32 {
        if self.uncompressed_length > 0 {
            self.uncompressed_length
        } else {
            self.length
        }
    }

    /// Whether two records describe the same physical location.
    pub fn same_location(&self, other: &PackedBlob) -> bool {
        self.pack == other.pack && self.offset == other.offset && self.length == other.length
    }
}
