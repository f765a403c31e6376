use std::fs;
use std::io::ErrorKind;
use std::sync::Mutex;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::error::CacheError;
use crate::locator::Locator;

/// Filesystem-backed store of previously downloaded payloads, keyed by the
/// escaped locator string. The file's mtime is the last known version
/// timestamp used for conditional revalidation.
#[derive(Debug)]
pub struct FileCache {
    root: Utf8PathBuf,
    lock: Mutex<()>,
}

impl FileCache {
    pub fn new() -> Result<Self, CacheError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("terra-retriever"))
                    .ok()
            })
            .ok_or_else(|| CacheError("unable to resolve cache directory".to_string()))?;
        Ok(Self::with_root(root))
    }

    pub fn with_root(root: Utf8PathBuf) -> Self {
        Self {
            root,
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Absolute path a payload for this locator lives at, whether or not an
    /// entry currently exists.
    pub fn entry_path(&self, locator: &Locator) -> Utf8PathBuf {
        self.root.join(locator.cache_name())
    }

    /// Cached bytes for a locator, or `None` when no entry exists. A missing
    /// entry is not an error; only a failed read of an existing file is.
    pub fn lookup(&self, locator: &Locator) -> Result<Option<Vec<u8>>, CacheError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.entry_path(locator);
        match fs::read(path.as_std_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError(format!("read {path}: {err}"))),
        }
    }

    /// Overwrites the entry for a locator. Written to a temporary file first
    /// and renamed into place so readers never observe a partial payload.
    pub fn store(&self, locator: &Locator, bytes: &[u8]) -> Result<(), CacheError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.entry_path(locator);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| CacheError(format!("create {parent}: {err}")))?;
        }
        let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
        fs::write(tmp_path.as_std_path(), bytes)
            .map_err(|err| CacheError(format!("write {tmp_path}: {err}")))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| CacheError(format!("rename {tmp_path}: {err}")))?;
        Ok(())
    }

    pub fn last_modified(&self, locator: &Locator) -> Result<Option<SystemTime>, CacheError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.entry_path(locator);
        match fs::metadata(path.as_std_path()) {
            Ok(metadata) => {
                let mtime = metadata
                    .modified()
                    .map_err(|err| CacheError(format!("stat {path}: {err}")))?;
                Ok(Some(mtime))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError(format!("stat {path}: {err}"))),
        }
    }

    /// Deletes the entry for a locator; no-op when absent.
    pub fn invalidate(&self, locator: &Locator) -> Result<(), CacheError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.entry_path(locator);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError(format!("remove {path}: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (tempfile::TempDir, FileCache) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
        (temp, FileCache::with_root(root))
    }

    #[test]
    fn entry_path_uses_escaped_name() {
        let (_temp, cache) = temp_cache();
        let locator: Locator = "http://x/a:b*c".parse().unwrap();
        assert!(cache.entry_path(&locator).ends_with("http!//x/a!b!c"));
    }

    #[test]
    fn store_then_lookup_round_trip() {
        let (_temp, cache) = temp_cache();
        let locator: Locator = "http://host/tiles/3/4/5.png".parse().unwrap();

        cache.store(&locator, b"payload").unwrap();
        let bytes = cache.lookup(&locator).unwrap().unwrap();
        assert_eq!(bytes, b"payload");
        assert!(cache.last_modified(&locator).unwrap().is_some());
    }

    #[test]
    fn lookup_missing_is_absent_not_error() {
        let (_temp, cache) = temp_cache();
        let locator: Locator = "http://host/never-stored".parse().unwrap();
        assert!(cache.lookup(&locator).unwrap().is_none());
        assert!(cache.last_modified(&locator).unwrap().is_none());
    }

    #[test]
    fn store_overwrites_previous_entry() {
        let (_temp, cache) = temp_cache();
        let locator: Locator = "http://host/tile.png".parse().unwrap();

        cache.store(&locator, b"old").unwrap();
        cache.store(&locator, b"new").unwrap();
        assert_eq!(cache.lookup(&locator).unwrap().unwrap(), b"new");
    }

    #[test]
    fn invalidate_is_idempotent() {
        let (_temp, cache) = temp_cache();
        let locator: Locator = "http://host/tile.png".parse().unwrap();

        cache.store(&locator, b"payload").unwrap();
        cache.invalidate(&locator).unwrap();
        assert!(cache.lookup(&locator).unwrap().is_none());
        cache.invalidate(&locator).unwrap();
    }
}
