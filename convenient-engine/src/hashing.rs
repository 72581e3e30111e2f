//! Content hashes of project files, memoized for the duration of a build

use convenient_cache::ContentHash;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Source of file content hashes
pub trait FileHashLoader: Send + Sync {
    /// Hash of the project-relative `path`
    ///
    /// # Errors
    ///
    /// If the file cannot be read
    fn get(&self, path: &Path) -> io::Result<ContentHash>;
}

/// Memoizing [`FileHashLoader`] reading files below a project root
#[derive(Debug)]
pub struct FileHashCache {
    root: PathBuf,
    hashes: Mutex<HashMap<PathBuf, ContentHash>>,
}

impl FileHashCache {
    /// Cache for files below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Forget the hash of `path`, e.g. after a rule rewrote it
    pub fn invalidate(&self, path: &Path) {
        let mut hashes = self.hashes.lock().unwrap_or_else(PoisonError::into_inner);
        hashes.retain(|cached, _| !cached.starts_with(path));
    }

    /// Forget every hash; sources may change between builds
    pub fn clear(&self) {
        self.hashes.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl FileHashLoader for FileHashCache {
    fn get(&self, path: &Path) -> io::Result<ContentHash> {
        if let Some(hash) = self.hashes.lock().unwrap_or_else(PoisonError::into_inner).get(path) {
            return Ok(*hash);
        }

        let hash = ContentHash::from_file(&self.root.join(path))?;
        let _ = self
            .hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), hash);
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_memoized_until_invalidated() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), "one").unwrap();
        let cache = FileHashCache::new(dir.path());

        let first = cache.get(Path::new("src/a.txt")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), "two").unwrap();
        assert_eq!(cache.get(Path::new("src/a.txt")).unwrap(), first);

        cache.invalidate(Path::new("src"));
        assert_eq!(cache.get(Path::new("src/a.txt")).unwrap(), ContentHash::from_content(b"two"));

        std::fs::write(dir.path().join("src/a.txt"), "three").unwrap();
        cache.clear();
        assert_eq!(cache.get(Path::new("src/a.txt")).unwrap(), ContentHash::from_content(b"three"));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = FileHashCache::new(dir.path());
        assert!(cache.get(Path::new("nope")).is_err());
    }
}
