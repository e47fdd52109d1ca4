use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use arca_types::error::{ArcaError, Result};

use crate::StorageBackend;

/// A target directory on local or mounted disk. Also backs the local
/// pack cache.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: &str) -> Result<Self> {
        let root = PathBuf::from(root);
        // Resolve symlinked roots so listed paths strip cleanly.
        let root = if root.exists() {
            fs::canonicalize(&root)?
        } else {
            root
        };
        Ok(Self { root })
    }

    /// Map a `/`-separated key below the root. Keys that are absolute,
    /// contain backslashes or climb with `..` are refused.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let escapes = key.is_empty()
            || key.starts_with('/')
            || key.contains('\\')
            || Path::new(key)
                .components()
                .any(|c| matches!(c, Component::ParentDir));
        if escapes {
            return Err(ArcaError::InvalidFormat(format!(
                "storage key '{key}' leaves the target directory"
            )));
        }
        Ok(self.root.join(key))
    }

    /// Readers never see a half-written pack, index or head: data goes to
    /// a temp file next to the destination and is renamed over it.
    fn write_atomically(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let parts: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                keys.push(parts.join("/"));
            }
        }
        Ok(())
    }
}

fn absent_as_none<T>(result: io::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        absent_as_none(fs::read(self.path_for(key)?))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        self.write_atomically(&path, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        absent_as_none(fs::remove_file(self.path_for(key)?)).map(|_| ())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let meta = absent_as_none(fs::metadata(self.path_for(key)?))?;
        Ok(meta.is_some_and(|m| m.is_file()))
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        let meta = absent_as_none(fs::metadata(self.path_for(key)?))?;
        Ok(meta.filter(|m| m.is_file()).map(|m| m.len()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let trimmed = prefix.trim_end_matches('/');
        let dir = if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.path_for(trimmed)?
        };
        let mut keys = Vec::new();
        if dir.is_dir() {
            self.collect_keys(&dir, &mut keys)?;
        }
        Ok(keys)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let Some(mut file) = absent_as_none(fs::File::open(self.path_for(key)?))? else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(length).read_to_end(&mut buf)?;
        if buf.len() as u64 != length {
            return Err(ArcaError::Other(format!(
                "short read on {key} at offset {offset}: expected {length} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Some(buf))
    }
}
