//! Manifest-based caching of a single rule
//!
//! Manifests are stored gzip-compressed in the same artifact cache as rule
//! outputs, under the rule's manifest key, and kept uncompressed in the rule's
//! metadata directory. Every failure at this layer is reported in the result
//! types and treated as a cache miss by the engine.

use crate::artifact::ArtifactFetcher;
use crate::config::DepFiles;
use crate::error::ManifestError;
use crate::hashing::FileHashLoader;
use crate::manifest::{Manifest, ManifestStats};
use crate::rulekey::RuleKeyAndInputs;
use crate::rules::BuildRule;
use crate::target::BuildPaths;
use convenient_cache::compression::{self, CompressionAlgorithm};
use convenient_cache::{ArtifactCache, ArtifactInfo, ContentHash, FetchResult, RuleKey, StoreFuture};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Outcome of reading the on-disk manifest
#[derive(Debug, Default)]
pub struct ManifestLoadResult {
    /// The manifest, when it exists and decodes
    pub manifest: Option<Manifest>,
    /// Why loading failed, if it did
    pub error: Option<String>,
}

/// Serializable part of a [`ManifestStoreResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestStoreSummary {
    /// Whether the previous manifest was discarded or absent
    pub did_create_new_manifest: bool,
    /// Why the previous manifest could not be used
    pub manifest_load_error: Option<String>,
    /// Sizes of the manifest as stored
    pub manifest_stats: ManifestStats,
}

/// Outcome of [`ManifestRuleKeyManager::update_and_store_manifest`]
pub struct ManifestStoreResult {
    /// Whether the previous manifest was discarded or absent
    pub did_create_new_manifest: bool,
    /// Why the previous manifest could not be used
    pub manifest_load_error: Option<String>,
    /// Sizes of the manifest as stored
    pub manifest_stats: ManifestStats,
    /// Upload of the compressed manifest; removes the staging file when done
    pub store_future: Option<StoreFuture>,
}

impl ManifestStoreResult {
    /// Everything but the store future
    #[must_use]
    pub fn summary(&self) -> ManifestStoreSummary {
        ManifestStoreSummary {
            did_create_new_manifest: self.did_create_new_manifest,
            manifest_load_error: self.manifest_load_error.clone(),
            manifest_stats: self.manifest_stats,
        }
    }
}

/// Outcome of [`ManifestRuleKeyManager::perform_manifest_based_cache_fetch`]
///
/// Each field records how far the lookup got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestFetchResult {
    /// Fetch of the manifest itself
    pub manifest_cache_result: FetchResult,
    /// Why the fetched manifest could not be loaded
    pub manifest_load_error: Option<String>,
    /// Sizes of the loaded manifest
    pub manifest_stats: Option<ManifestStats>,
    /// Output key of the matching manifest entry
    pub dep_file_rule_key: Option<RuleKey>,
    /// Fetch of the rule's outputs under `dep_file_rule_key`
    pub rule_cache_result: Option<FetchResult>,
}

impl ManifestFetchResult {
    fn new(manifest_cache_result: FetchResult) -> Self {
        Self {
            manifest_cache_result,
            manifest_load_error: None,
            manifest_stats: None,
            dep_file_rule_key: None,
            rule_cache_result: None,
        }
    }

    /// Whether the rule's outputs were restored
    #[must_use]
    pub fn is_hit(&self) -> bool {
        self.rule_cache_result.as_ref().is_some_and(FetchResult::is_success)
    }
}

/// Manifest operations for one rule during one build
pub struct ManifestRuleKeyManager<'a> {
    dep_files: DepFiles,
    rule: &'a dyn BuildRule,
    hashes: &'a dyn FileHashLoader,
    max_entries: usize,
    cache: &'a dyn ArtifactCache,
    paths: &'a BuildPaths,
}

impl<'a> ManifestRuleKeyManager<'a> {
    /// Manager for `rule`
    pub fn new(
        dep_files: DepFiles,
        rule: &'a dyn BuildRule,
        hashes: &'a dyn FileHashLoader,
        max_entries: usize,
        cache: &'a dyn ArtifactCache,
        paths: &'a BuildPaths,
    ) -> Self {
        Self {
            dep_files,
            rule,
            hashes,
            max_entries,
            cache,
            paths,
        }
    }

    /// Whether manifests apply to this rule at all
    #[must_use]
    pub fn use_manifest_caching(&self) -> bool {
        self.dep_files == DepFiles::Cache
            && self.rule.is_cacheable()
            && self
                .rule
                .dep_file_support()
                .is_some_and(|support| support.use_dependency_file_rule_keys())
    }

    fn check_manifest_caching(&self) {
        assert!(
            self.use_manifest_caching(),
            "{} does not use manifest caching",
            self.rule.target()
        );
    }

    /// On-disk location of the rule's manifest
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.paths.manifest_path(self.rule.target())
    }

    fn manifest_dir(&self) -> io::Result<PathBuf> {
        let path = self.manifest_path();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("manifest path has no parent"))?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Download the manifest for `key` and move it into place.
    ///
    /// The on-disk manifest is replaced only once the download has been
    /// decompressed completely.
    ///
    /// # Panics
    ///
    /// If the rule does not use manifest caching
    pub fn fetch_manifest(&self, key: &RuleKey) -> FetchResult {
        self.check_manifest_caching();

        let staged = match self.manifest_dir().and_then(|dir| {
            let download = NamedTempFile::new_in(&dir)?.into_temp_path();
            Ok((dir, download))
        }) {
            Ok(staged) => staged,
            Err(e) => return FetchResult::error(e),
        };
        let (dir, download) = staged;

        let result = self.cache.fetch(key, &download);
        if !result.is_success() {
            debug!("{}: cache {} on manifest {}", self.rule.target(), result.label(), key);
            return result;
        }

        let installed = (|| -> io::Result<()> {
            let mut manifest = NamedTempFile::new_in(&dir)?;
            compression::decompress_stream(BufReader::new(File::open(&download)?), manifest.as_file_mut())?;
            let _ = manifest.persist(self.manifest_path()).map_err(|e| e.error)?;
            Ok(())
        })();
        match installed {
            Ok(()) => {
                debug!("{}: cache hit on manifest {}", self.rule.target(), key);
                result
            }
            Err(e) => {
                warn!("{}: failed to decompress manifest {}: {}", self.rule.target(), key, e);
                FetchResult::error(format!("decompressing manifest {key}: {e}"))
            }
        }
    }

    /// Read the on-disk manifest, expecting it to belong to `key`.
    ///
    /// A manifest recorded for another key is reported as an error.
    ///
    /// # Panics
    ///
    /// If the rule does not use manifest caching
    #[must_use]
    pub fn load_manifest(&self, key: &RuleKey) -> ManifestLoadResult {
        self.check_manifest_caching();

        let path = self.manifest_path();
        let loaded = File::open(&path)
            .map_err(ManifestError::from)
            .and_then(|file| Manifest::deserialize(BufReader::new(file)));
        match loaded {
            Ok(manifest) if manifest.key() == key => ManifestLoadResult {
                manifest: Some(manifest),
                error: None,
            },
            Ok(manifest) => {
                warn!(
                    "{}: manifest at {} has key {}, expected {}",
                    self.rule.target(),
                    path.display(),
                    manifest.key(),
                    key
                );
                ManifestLoadResult {
                    manifest: None,
                    error: Some(format!("manifest key mismatch: found {}", manifest.key())),
                }
            }
            Err(ManifestError::Io(e)) if e.kind() == io::ErrorKind::NotFound => ManifestLoadResult::default(),
            Err(e) => {
                warn!("{}: failed to load manifest for key {}: {}", self.rule.target(), key, e);
                ManifestLoadResult {
                    manifest: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Add `output_key` built from `used_inputs` to the rule's manifest,
    /// write it to disk and queue its upload.
    ///
    /// A manifest already holding the configured maximum of entries is
    /// discarded and started afresh.
    ///
    /// # Errors
    ///
    /// If hashing, serializing or staging fails
    ///
    /// # Panics
    ///
    /// If the rule does not use manifest caching
    pub fn update_and_store_manifest(
        &self,
        output_key: RuleKey,
        used_inputs: &BTreeSet<PathBuf>,
        manifest_key: &RuleKeyAndInputs,
        build_time_ms: u64,
    ) -> Result<ManifestStoreResult, ManifestError> {
        self.check_manifest_caching();

        let path = self.manifest_path();
        let dir = self.manifest_dir()?;

        let mut did_create_new_manifest = true;
        let mut manifest_load_error = None;
        let mut manifest = Manifest::new(manifest_key.rule_key);
        if path.exists() {
            let loaded = self.load_manifest(&manifest_key.rule_key);
            manifest_load_error = loaded.error;
            if let Some(existing) = loaded.manifest {
                manifest = existing;
                did_create_new_manifest = false;
            }
        }

        if manifest.size() >= self.max_entries {
            info!(
                "{}: manifest reached {} entries, starting a new one",
                self.rule.target(),
                manifest.size()
            );
            manifest = Manifest::new(manifest_key.rule_key);
            did_create_new_manifest = true;
        }

        manifest.add_entry(self.hashes, output_key, &manifest_key.inputs, used_inputs)?;
        let manifest_stats = manifest.stats();

        let mut on_disk = NamedTempFile::new_in(&dir)?;
        manifest.serialize(BufWriter::new(on_disk.as_file_mut()))?;
        let _ = on_disk.persist(&path).map_err(|e| e.error)?;

        let store_future = if self.cache.is_store_supported() {
            let mut staged = NamedTempFile::new_in(&dir)?;
            compression::compress_stream(
                BufReader::new(File::open(&path)?),
                staged.as_file_mut(),
                CompressionAlgorithm::Gzip,
            )?;
            let staged = staged.into_temp_path();

            let mut info = ArtifactInfo::for_key(manifest_key.rule_key, self.rule.target().to_string());
            info.build_time_ms = Some(build_time_ms);
            let _ = info.metadata.insert("kind".to_string(), "manifest".to_string());
            let store = self.cache.store(info, &staged);
            Some(
                async move {
                    let result = store.await;
                    drop(staged);
                    result
                }
                .boxed(),
            )
        } else {
            None
        };

        Ok(ManifestStoreResult {
            did_create_new_manifest,
            manifest_load_error,
            manifest_stats,
            store_future,
        })
    }

    /// Fetch the manifest, find the entry matching the current inputs and
    /// fetch the outputs recorded under it
    ///
    /// # Panics
    ///
    /// If the rule does not use manifest caching
    pub fn perform_manifest_based_cache_fetch(
        &self,
        manifest_key: &RuleKeyAndInputs,
        fetcher: &ArtifactFetcher<'_>,
    ) -> ManifestFetchResult {
        self.check_manifest_caching();

        let mut result = ManifestFetchResult::new(self.fetch_manifest(&manifest_key.rule_key));
        if !result.manifest_cache_result.is_success() {
            return result;
        }

        let loaded = self.load_manifest(&manifest_key.rule_key);
        let Some(manifest) = loaded.manifest else {
            result.manifest_load_error = Some(loaded.error.unwrap_or_else(|| "manifest disappeared".to_string()));
            return result;
        };
        result.manifest_stats = Some(manifest.stats());

        let current = self.current_hashes(&manifest, &manifest_key.inputs);
        let Some(dep_file_rule_key) = manifest.lookup(&current) else {
            debug!("{}: no manifest entry matches the current inputs", self.rule.target());
            return result;
        };
        result.dep_file_rule_key = Some(dep_file_rule_key);
        result.rule_cache_result = Some(fetcher.fetch_and_overlay(self.cache, &dep_file_rule_key, self.rule));
        result
    }

    /// Hashes of the covered inputs the manifest tracks; unreadable inputs are left out
    fn current_hashes(&self, manifest: &Manifest, covered: &BTreeSet<PathBuf>) -> BTreeMap<PathBuf, ContentHash> {
        manifest
            .tracked_inputs()
            .filter(|input| covered.contains(*input))
            .filter_map(|input| match self.hashes.get(input) {
                Ok(hash) => Some((input.to_path_buf(), hash)),
                Err(e) => {
                    debug!("{}: cannot hash {}: {}", self.rule.target(), input.display(), e);
                    None
                }
            })
            .collect()
    }
}
