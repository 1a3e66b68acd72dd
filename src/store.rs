//! [`KeyValueStore`] implementations.
use crate::traits::KeyValueStore;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Stores each blob as `<dir>/<key>.yml`.
///
/// Writes go to a temporary file that is renamed over the old blob, so a
/// crash while persisting leaves either the old or the new record behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (and creates, if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> io::Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(self.dir.join(format!("{key}.yml")))
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid store key '{key}'"),
            ))
        }
    }
}

impl KeyValueStore for FileStore {
    fn get_blob(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)?) {
            Ok(blob) => Ok(Some(blob)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn put_blob(&mut self, key: &str, value: &[u8]) -> io::Result<()> {
        let path = self.path(key)?;
        let tmp = path.with_extension("yml.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)
    }
}

/// Keeps blobs in memory; nothing survives the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: HashMap<String, Vec<u8>>,
    fail_writes: bool,
}

impl MemoryStore {
    /// Makes every following `put_blob` fail, to exercise error paths.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }
}

impl KeyValueStore for MemoryStore {
    fn get_blob(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).cloned())
    }

    fn put_blob(&mut self, key: &str, value: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::other("write rejected"));
        }
        self.blobs.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
