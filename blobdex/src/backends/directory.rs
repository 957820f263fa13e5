use super::{blocking, BackendError, Handle, ObjectClass, ObjectStore, Result};
use crate::id::ObjectId;

use async_trait::async_trait;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::trace;

/// Objects as files under a local directory.
///
/// Packs fan out into 256 subdirectories by the first byte of their
/// ID; every other class is a flat directory.
#[derive(Clone)]
pub struct Directory {
    target: Arc<PathBuf>,
}

impl Directory {
    pub fn new(target: impl AsRef<Path>) -> Result<Directory> {
        let target = target.as_ref();
        for class in ObjectClass::ALL {
            fs::create_dir_all(target.join(class.dir()))?;
        }

        Ok(Directory {
            target: Arc::new(target.into()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    fn filename(&self, handle: &Handle) -> PathBuf {
        let name = handle.id.to_string();
        let dir = self.target.join(handle.class.dir());

        match handle.class {
            ObjectClass::Pack => dir.join(&name[..2]).join(name),
            _ => dir.join(name),
        }
    }
}

/// Write to a temp file next to `path`, then rename it into place.
///
/// Readers either see the previous file or the complete new one.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

fn not_found(handle: Handle) -> impl FnOnce(io::Error) -> BackendError {
    move |error| match error.kind() {
        io::ErrorKind::NotFound => BackendError::NotFound { handle },
        _ => error.into(),
    }
}

fn list_files(dir: &Path, found: &mut Vec<(ObjectId, u64)>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            list_files(&entry.path(), found)?;
        } else if file_type.is_file() {
            // temp files from interrupted writes don't parse as IDs
            let parsed = entry.file_name().to_str().map(str::parse::<ObjectId>);
            if let Some(Ok(id)) = parsed {
                found.push((id, entry.metadata()?.len()));
            }
        }
    }

    Ok(())
}

#[async_trait]
impl ObjectStore for Directory {
    async fn save(&self, handle: Handle, data: Vec<u8>) -> Result<()> {
        let filename = self.filename(&handle);
        trace!(%handle, size = data.len(), "writing object");

        blocking(move || Ok(atomic_write(&filename, &data)?)).await
    }

    async fn load(&self, handle: Handle) -> Result<Vec<u8>> {
        let filename = self.filename(&handle);
        blocking(move || fs::read(filename).map_err(not_found(handle))).await
    }

    async fn stat(&self, handle: Handle) -> Result<u64> {
        let filename = self.filename(&handle);
        blocking(move || {
            fs::metadata(filename)
                .map(|md| md.len())
                .map_err(not_found(handle))
        })
        .await
    }

    async fn list(&self, class: ObjectClass) -> Result<Vec<(ObjectId, u64)>> {
        let dir = self.target.join(class.dir());
        blocking(move || {
            let mut found = vec![];
            list_files(&dir, &mut found)?;
            Ok(found)
        })
        .await
    }

    async fn remove(&self, handle: Handle) -> Result<()> {
        let filename = self.filename(&handle);
        blocking(move || match fs::remove_file(filename) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }
}
