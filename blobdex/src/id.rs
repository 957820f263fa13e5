use crate::crypto::{secure_hash, Digest};

pub use hex::FromHexError;

use std::{convert::TryFrom, fmt, str::FromStr};

/// Content address of anything stored in a repository.
///
/// Blobs, packs and index objects share the same 32 byte digest space;
/// the object class (or [`BlobType`](crate::blob::BlobType)) next to
/// an `ObjectId` tells them apart.
#[derive(Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Digest);

/// Identifies a blob by the digest of its plaintext.
pub type BlobId = ObjectId;

/// Identifies a pack object in the store.
pub type PackId = ObjectId;

impl ObjectId {
    /// The digest of `content`. This is how every stored object gets its name.
    #[inline(always)]
    pub fn hash(content: impl AsRef<[u8]>) -> ObjectId {
        ObjectId(secure_hash(content.as_ref()))
    }

    #[inline(always)]
    pub const fn from_digest(digest: Digest) -> ObjectId {
        ObjectId(digest)
    }

    /// Shorthand used in log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl AsRef<[u8]> for ObjectId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&str> for ObjectId {
    type Error = FromHexError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut id = ObjectId::default();
        hex::decode_to_slice(value, &mut id.0)?;
        Ok(id)
    }
}

impl FromStr for ObjectId {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::try_from(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}
