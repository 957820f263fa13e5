//! Local mirror of immutable repository metadata.
//!
//! The layout on disk is
//!
//! ```text
//! <base>/CACHEDIR.TAG
//! <base>/<repository id>/version
//! <base>/<repository id>/<class>/<first two hex chars>/<object id>
//! ```
//!
//! The cache is purely an optimization. Any entry that can't be read
//! back is dropped and reported as a miss.
use crate::{
    backends::{atomic_write, ObjectClass},
    id::ObjectId,
};

use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

const CACHE_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";
const CACHEDIR_TAG_FILE: &str = "CACHEDIR.TAG";
const CACHEDIR_TAG: &[u8] = b"Signature: 8a477f597d28d172789f06886806bc55
# This file is a cache directory tag created by blobdex.
# For information about cache directory tags, see:
#\thttps://bford.info/cachedir/
";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("Objects of class {class} must not be cached")]
    NotCacheable { class: ObjectClass },
}

pub type Result<T> = std::result::Result<T, CacheError>;

pub struct Cache {
    path: PathBuf,
    created: bool,
}

impl Cache {
    /// Open the cache for one repository below `base`, creating it if needed.
    ///
    /// A cache written by an incompatible version is wiped.
    pub fn new(base: impl AsRef<Path>, repository: &ObjectId) -> Result<Cache> {
        let base = base.as_ref();
        fs::create_dir_all(base)?;

        let tag = base.join(CACHEDIR_TAG_FILE);
        if !tag.exists() {
            atomic_write(&tag, CACHEDIR_TAG)?;
        }

        let path = base.join(repository.to_string());
        let created = match read_version(&path) {
            Some(CACHE_VERSION) => false,
            Some(version) => {
                warn!(
                    ?path,
                    version,
                    expected = CACHE_VERSION,
                    "incompatible cache version; recreating"
                );
                fs::remove_dir_all(&path)?;
                true
            }
            None => true,
        };

        for class in ObjectClass::ALL.iter().filter(|c| c.is_cacheable()) {
            fs::create_dir_all(path.join(class.dir()))?;
        }

        if created {
            atomic_write(
                &path.join(VERSION_FILE),
                CACHE_VERSION.to_string().as_bytes(),
            )?;
            debug!(?path, "created cache");
        }

        Ok(Cache { path, created })
    }

    /// The per-user default location, if the platform has one.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("blobdex"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this cache directory was (re)created when opened.
    pub fn created(&self) -> bool {
        self.created
    }

    fn entry_path(&self, class: ObjectClass, id: &ObjectId) -> PathBuf {
        let name = id.to_string();
        self.path.join(class.dir()).join(&name[..2]).join(name)
    }

    /// Local path of a cached object, or `None` on a miss.
    pub fn get(&self, class: ObjectClass, id: &ObjectId) -> Option<PathBuf> {
        if !class.is_cacheable() {
            return None;
        }

        let path = self.entry_path(class, id);
        match fs::metadata(&path) {
            Ok(md) if md.is_file() => Some(path),
            _ => None,
        }
    }

    /// Contents of a cached object, or `None` on a miss.
    pub fn load(&self, class: ObjectClass, id: &ObjectId) -> Option<Vec<u8>> {
        let path = self.get(class, id)?;

        match fs::read(&path) {
            Ok(data) => Some(data),
            Err(error) => {
                warn!(%error, ?path, "unreadable cache entry; dropping it");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    pub fn put(&self, class: ObjectClass, id: &ObjectId, data: &[u8]) -> Result<()> {
        if !class.is_cacheable() {
            return Err(CacheError::NotCacheable { class });
        }

        atomic_write(&self.entry_path(class, id), data)?;
        Ok(())
    }

    /// Drop an entry. Returns whether there was one.
    pub fn remove(&self, class: ObjectClass, id: &ObjectId) -> Result<bool> {
        match fs::remove_file(self.entry_path(class, id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every entry of every class.
    pub fn clear(&self) -> Result<()> {
        for class in ObjectClass::ALL.iter().filter(|c| c.is_cacheable()) {
            let dir = self.path.join(class.dir());
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&dir)?;
        }

        Ok(())
    }

    /// IDs of all cached objects of `class`.
    pub fn list(&self, class: ObjectClass) -> Result<HashSet<ObjectId>> {
        Ok(self.entries(class)?.into_iter().map(|(id, _)| id).collect())
    }

    /// Remove cached objects of `class` that are not in `valid`.
    ///
    /// Returns the number of entries removed.
    pub fn retain(&self, class: ObjectClass, valid: &HashSet<ObjectId>) -> Result<usize> {
        let mut removed = 0;
        for (id, path) in self.entries(class)? {
            if !valid.contains(&id) {
                fs::remove_file(path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(%class, removed, "removed stale cache entries");
        }
        Ok(removed)
    }

    fn entries(&self, class: ObjectClass) -> Result<Vec<(ObjectId, PathBuf)>> {
        let mut found = vec![];
        if !class.is_cacheable() {
            return Ok(found);
        }

        let dir = self.path.join(class.dir());
        for prefix in fs::read_dir(dir)? {
            let prefix = prefix?;
            if !prefix.file_type()?.is_dir() {
                continue;
            }

            for entry in fs::read_dir(prefix.path())? {
                let entry = entry?;
                let parsed = entry.file_name().to_str().map(str::parse::<ObjectId>);
                if let Some(Ok(id)) = parsed {
                    found.push((id, entry.path()));
                }
            }
        }

        Ok(found)
    }
}

fn read_version(path: &Path) -> Option<u32> {
    fs::read_to_string(path.join(VERSION_FILE))
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> Cache {
        Cache::new(dir, &ObjectId::hash(b"repository")).unwrap()
    }

    #[test]
    fn put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let id = ObjectId::hash(b"index");

        assert!(cache.created());
        assert!(cache.get(ObjectClass::Index, &id).is_none());

        cache.put(ObjectClass::Index, &id, b"index").unwrap();

        let path = cache.get(ObjectClass::Index, &id).unwrap();
        assert!(path.starts_with(cache.path()));
        assert_eq!(cache.load(ObjectClass::Index, &id).unwrap(), b"index");

        // the same object is never an entry of another class
        assert!(cache.get(ObjectClass::Snapshot, &id).is_none());
    }

    #[test]
    fn repeated_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let id = ObjectId::hash(b"index");

        cache.put(ObjectClass::Index, &id, b"index").unwrap();
        cache.put(ObjectClass::Index, &id, b"index").unwrap();

        assert_eq!(cache.list(ObjectClass::Index).unwrap().len(), 1);
    }

    #[test]
    fn mutable_classes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let id = ObjectId::hash(b"lock");

        assert!(matches!(
            cache.put(ObjectClass::Lock, &id, b"lock"),
            Err(CacheError::NotCacheable {
                class: ObjectClass::Lock
            })
        ));
        assert!(cache.get(ObjectClass::Lock, &id).is_none());
    }

    #[test]
    fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let a = ObjectId::hash(b"a");
        let b = ObjectId::hash(b"b");

        cache.put(ObjectClass::Index, &a, b"a").unwrap();
        cache.put(ObjectClass::Snapshot, &b, b"b").unwrap();

        assert!(cache.remove(ObjectClass::Index, &a).unwrap());
        assert!(!cache.remove(ObjectClass::Index, &a).unwrap());
        assert!(cache.get(ObjectClass::Index, &a).is_none());

        cache.clear().unwrap();
        assert!(cache.get(ObjectClass::Snapshot, &b).is_none());
        assert!(cache.list(ObjectClass::Snapshot).unwrap().is_empty());
    }

    #[test]
    fn retain_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let keep = ObjectId::hash(b"keep");
        let stale = ObjectId::hash(b"stale");

        cache.put(ObjectClass::Index, &keep, b"keep").unwrap();
        cache.put(ObjectClass::Index, &stale, b"stale").unwrap();

        let valid = HashSet::from([keep]);
        assert_eq!(cache.retain(ObjectClass::Index, &valid).unwrap(), 1);
        assert_eq!(cache.list(ObjectClass::Index).unwrap(), valid);
    }

    #[test]
    fn reopening_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let id = ObjectId::hash(b"index");

        open(dir.path())
            .put(ObjectClass::Index, &id, b"index")
            .unwrap();

        let cache = open(dir.path());
        assert!(!cache.created());
        assert!(cache.get(ObjectClass::Index, &id).is_some());
        assert!(dir.path().join(CACHEDIR_TAG_FILE).is_file());
    }

    #[test]
    fn version_mismatch_wipes_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let id = ObjectId::hash(b"index");

        let cache = open(dir.path());
        cache.put(ObjectClass::Index, &id, b"index").unwrap();
        fs::write(cache.path().join(VERSION_FILE), b"0").unwrap();

        let cache = open(dir.path());
        assert!(cache.created());
        assert!(cache.get(ObjectClass::Index, &id).is_none());
    }

    #[test]
    fn directories_in_place_of_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let id = ObjectId::hash(b"index");

        fs::create_dir_all(cache.entry_path(ObjectClass::Index, &id)).unwrap();
        assert!(cache.load(ObjectClass::Index, &id).is_none());
    }
}
