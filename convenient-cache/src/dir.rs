//! Local directory artifact cache
//!
//! Layout: `<root>/<xx>/<yy>/<key>` holds the artifact bytes and
//! `<root>/<xx>/<yy>/<key>.metadata.json` the [`ArtifactInfo`] it was stored with.

use crate::{ArtifactCache, ArtifactInfo, CacheError, CacheResult, FetchResult, RuleKey, StoreFuture};
use futures::future::FutureExt;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Write `data` produced by `fill` to `path` so readers never observe a partial file
pub(crate) fn atomic_write(path: &Path, fill: impl FnOnce(&mut File) -> io::Result<()>) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    fill(temp.as_file_mut())?;
    temp.as_file_mut().sync_all()?;
    let _ = temp.persist(path).map_err(|e| e.error)?;

    // Best effort: not every filesystem supports syncing a directory
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Artifact cache in a local directory
#[derive(Debug, Clone)]
pub struct DirArtifactCache {
    name: String,
    root: PathBuf,
    read_only: bool,
}

impl DirArtifactCache {
    /// Open (creating if needed) a cache rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if the directory cannot be created
    pub fn new(root: impl Into<PathBuf>, read_only: bool) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            name: format!("dir:{}", root.display()),
            root,
            read_only,
        })
    }

    /// Cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, key: &RuleKey) -> PathBuf {
        let hex = key.to_string();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    fn metadata_path(&self, key: &RuleKey) -> PathBuf {
        self.artifact_path(key).with_extension("metadata.json")
    }

    fn try_fetch(&self, key: &RuleKey, dest: &Path) -> CacheResult<Option<BTreeMap<String, String>>> {
        let source = self.artifact_path(key);
        let mut reader = match File::open(&source) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        atomic_write(dest, |out| io::copy(&mut reader, out).map(|_| ()))?;

        let metadata = match fs::read(self.metadata_path(key)) {
            Ok(bytes) => serde_json::from_slice::<ArtifactInfo>(&bytes)?.metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(metadata))
    }

    fn store_sync(&self, info: &ArtifactInfo, src: &Path) -> CacheResult<()> {
        let metadata = serde_json::to_vec_pretty(info)?;
        for key in &info.rule_keys {
            let mut reader = File::open(src)?;
            atomic_write(&self.artifact_path(key), |out| io::copy(&mut reader, out).map(|_| ()))?;
            atomic_write(&self.metadata_path(key), |out| out.write_all(&metadata))?;
            debug!("Stored {} for {} in {}", key, info.target, self.name);
        }
        Ok(())
    }
}

impl ArtifactCache for DirArtifactCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, key: &RuleKey, dest: &Path) -> FetchResult {
        match self.try_fetch(key, dest) {
            Ok(Some(metadata)) => FetchResult::Hit {
                cache: self.name.clone(),
                metadata,
            },
            Ok(None) => FetchResult::Miss,
            Err(e) => {
                warn!("Fetching {} from {} failed: {}", key, self.name, e);
                FetchResult::error(e)
            }
        }
    }

    fn store(&self, info: ArtifactInfo, src: &Path) -> StoreFuture {
        if self.read_only {
            return futures::future::ready(Err(CacheError::ReadOnly(self.name.clone()))).boxed();
        }
        let cache = self.clone();
        let src = src.to_path_buf();
        async move { cache.store_sync(&info, &src) }.boxed()
    }

    fn is_store_supported(&self) -> bool {
        !self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(key: RuleKey) -> ArtifactInfo {
        let mut info = ArtifactInfo::for_key(key, "//lib:core");
        let _ = info.metadata.insert("origin".into(), "test".into());
        info
    }

    #[test]
    fn test_store_then_fetch() {
        let dir = TempDir::new().unwrap();
        let cache = DirArtifactCache::new(dir.path().join("cache"), false).unwrap();
        let key = RuleKey::from_digest([0x12; 32]);
        let src = dir.path().join("artifact");
        fs::write(&src, b"packed outputs").unwrap();

        tokio_test::block_on(cache.store(info(key), &src)).unwrap();
        assert!(cache.artifact_path(&key).starts_with(dir.path().join("cache").join("12").join("12")));

        let dest = dir.path().join("out").join("fetched");
        match cache.fetch(&key, &dest) {
            FetchResult::Hit { metadata, .. } => assert_eq!(metadata.get("origin").map(String::as_str), Some("test")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fs::read(&dest).unwrap(), b"packed outputs");
    }

    #[test]
    fn test_missing_key_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = DirArtifactCache::new(dir.path(), false).unwrap();
        let dest = dir.path().join("dest");
        assert_eq!(cache.fetch(&RuleKey::from_digest([1; 32]), &dest), FetchResult::Miss);
        assert!(!dest.exists());
    }

    #[test]
    fn test_store_under_every_key() {
        let dir = TempDir::new().unwrap();
        let cache = DirArtifactCache::new(dir.path().join("c"), false).unwrap();
        let src = dir.path().join("a");
        fs::write(&src, b"x").unwrap();
        let keys = vec![RuleKey::from_digest([1; 32]), RuleKey::from_digest([2; 32])];
        let info = ArtifactInfo {
            rule_keys: keys.clone(),
            target: "//x:y".into(),
            ..ArtifactInfo::default()
        };

        tokio_test::block_on(cache.store(info, &src)).unwrap();
        for key in keys {
            assert!(cache.fetch(&key, &dir.path().join("d")).is_success());
        }
    }

    #[test]
    fn test_read_only_rejects_store() {
        let dir = TempDir::new().unwrap();
        let cache = DirArtifactCache::new(dir.path(), true).unwrap();
        assert!(!cache.is_store_supported());
        let result = tokio_test::block_on(cache.store(info(RuleKey::from_digest([3; 32])), Path::new("unused")));
        assert!(matches!(result, Err(CacheError::ReadOnly(_))));
    }

    #[test]
    fn test_corrupt_metadata_is_error() {
        let dir = TempDir::new().unwrap();
        let cache = DirArtifactCache::new(dir.path().join("c"), false).unwrap();
        let key = RuleKey::from_digest([4; 32]);
        let src = dir.path().join("a");
        fs::write(&src, b"x").unwrap();
        tokio_test::block_on(cache.store(info(key), &src)).unwrap();
        fs::write(cache.metadata_path(&key), b"{not json").unwrap();

        assert!(matches!(cache.fetch(&key, &dir.path().join("d")), FetchResult::Error { .. }));
    }
}
