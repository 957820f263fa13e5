//! Deduplicating index layer for encrypted, pack-based backup
//! repositories.
//!
//! Blobs are named by the digest of their plaintext and written into
//! packs. Which pack holds which blob is recorded in small immutable
//! [`Index`] objects, one batch per writer session. A [`MasterIndex`]
//! merges all of them into one lookup table and owns the protocol for
//! adding, merging and compacting indexes.
#![deny(clippy::all)]

#[macro_use]
extern crate serde_derive;

pub mod backends;
pub mod blob;
pub mod cache;
pub(crate) mod compress;
pub mod config;
pub mod crypto;
pub mod hardlinks;
pub mod id;
pub mod index;
pub mod master;
pub mod repository;

pub use crate::backends::{BackendConfig, Handle, ObjectClass, ObjectStore};
pub use crate::blob::{Blob, BlobHandle, BlobType, PackedBlob};
pub use crate::config::{Config, DuplicatePolicy};
pub use crate::crypto::Key;
pub use crate::hardlinks::HardlinkIndex;
pub use crate::id::{BlobId, ObjectId, PackId};
pub use crate::index::{Index, IndexError};
pub use crate::master::{for_all_indexes, MasterIndex};
pub use crate::repository::Repository;

pub use anyhow;
