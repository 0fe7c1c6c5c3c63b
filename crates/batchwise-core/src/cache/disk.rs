use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::store::{CacheEntry, CacheStore};
use crate::error::CachePersistenceError;
use crate::fingerprint::compute_digest;

const ENTRY_EXT: &str = "json";
const TMP_SUFFIX: &str = ".tmp";

/// One JSON file per entry under a directory, named by the key's digest.
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CachePersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| CachePersistenceError::io(&dir, err))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", compute_digest(key.as_bytes()), ENTRY_EXT))
    }

    fn read_entry(path: &Path) -> Result<Option<CacheEntry>, CachePersistenceError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CachePersistenceError::io(path, err)),
        }
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>, CachePersistenceError> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CachePersistenceError::io(&self.dir, err)),
        };
        let mut files = Vec::new();
        for ent in read_dir {
            let ent = ent.map_err(|err| CachePersistenceError::io(&self.dir, err))?;
            let path = ent.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXT) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl CacheStore for DiskStore {
    fn kind(&self) -> &'static str {
        "disk"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CachePersistenceError> {
        let entry = Self::read_entry(&self.entry_path(key))?;
        Ok(entry.filter(|entry| entry.key == key))
    }

    fn save(&self, entry: CacheEntry) -> Result<(), CachePersistenceError> {
        let path = self.entry_path(&entry.key);
        let bytes = serde_json::to_vec(&entry)?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &bytes).map_err(|err| CachePersistenceError::io(&tmp, err))?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(CachePersistenceError::io(&path, err));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CachePersistenceError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CachePersistenceError::io(&path, err)),
        }
    }

    fn clear(&self) -> Result<(), CachePersistenceError> {
        for path in self.entry_files()? {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    return Err(CachePersistenceError::io(&path, err));
                }
            }
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, CachePersistenceError> {
        let mut out = Vec::new();
        for path in self.entry_files()? {
            match Self::read_entry(&path) {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        "disk_store: skipping unreadable entry {}: {}",
                        path.display(),
                        err
                    );
                }
            }
        }
        Ok(out)
    }
}
