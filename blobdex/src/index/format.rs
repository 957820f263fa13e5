//! On-disk shape of an index object.
//!
//! The encoding is MessagePack with named fields. Packs are sorted by
//! ID, blobs within a pack by offset, and `supersedes` is sorted, so
//! the same record set always produces the same bytes.
use crate::{
    blob::{BlobType, PackedBlob},
    id::{BlobId, ObjectId, PackId},
};

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexFile {
    pub supersedes: Vec<ObjectId>,
    pub packs: Vec<PackEntry>,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PackEntry {
    pub id: PackId,
    pub blobs: Vec<BlobEntry>,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BlobEntry {
    pub id: BlobId,
    #[serde(rename = "type")]
    pub blob_type: BlobType,
    pub offset: u32,
    pub length: u32,
    #[serde(default)]
    pub uncompressed_length: u32,
}

impl IndexFile {
    /// Group records by pack. `blobs` must already be sorted by pack,
    /// then offset.
    pub fn new<'a>(
        supersedes: impl IntoIterator<Item = &'a ObjectId>,
        blobs: impl IntoIterator<Item = &'a PackedBlob>,
    ) -> Self {
        let mut packs: Vec<PackEntry> = vec![];

        for blob in blobs {
            let entry = BlobEntry {
                id: blob.id,
                blob_type: blob.blob_type,
                offset: blob.offset,
                length: blob.length,
                uncompressed_length: blob.uncompressed_length,
            };

            match packs.last_mut() {
                Some(pack) if pack.id == blob.pack => pack.blobs.push(entry),
                _ => packs.push(PackEntry {
                    id: blob.pack,
                    blobs: vec![entry],
                }),
            }
        }

        IndexFile {
            supersedes: supersedes.into_iter().copied().collect(),
            packs,
        }
    }

    pub fn into_blobs(self) -> impl Iterator<Item = PackedBlob> {
        self.packs.into_iter().flat_map(|pack| {
            let pack_id = pack.id;
            pack.blobs.into_iter().map(move |b| PackedBlob {
                id: b.id,
                blob_type: b.blob_type,
                pack: pack_id,
                offset: b.offset,
                length: b.length,
                uncompressed_length: b.uncompressed_length,
            })
        })
    }
}
