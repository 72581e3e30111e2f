//! Artifact caches keyed by rule keys
//!
//! The build engine stores each rule's packed outputs under its [`RuleKey`]
//! and later fetches them back instead of rebuilding. This crate defines the
//! contract it uses ([`ArtifactCache`]) and the backends behind it.
//!
//! # Features
//!
//! - Local directory cache with sharded paths and atomic writes
//! - HTTP cache speaking the bazel-remote `/ac/` protocol via reqwest
//! - Fan-out over several caches
//! - zstd/lz4/gzip compression with format detection
//!
//! # Example
//!
//! ```no_run
//! use convenient_cache::{ArtifactCache, ArtifactInfo, DirArtifactCache, RuleKey};
//! use std::path::Path;
//!
//! let cache = DirArtifactCache::new("/tmp/artifacts", false)?;
//! let key = RuleKey::from_digest([7; 32]);
//!
//! futures::executor::block_on(cache.store(ArtifactInfo::for_key(key, "//app:bin"), Path::new("out.tar.zst")))?;
//! assert!(cache.fetch(&key, Path::new("fetched.tar.zst")).is_success());
//! # Ok::<(), convenient_cache::CacheError>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod compression;
mod dir;
mod hash;
mod http;

pub use dir::DirArtifactCache;
pub use hash::{ContentHash, RuleKey};
pub use http::HttpArtifactCache;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Error types for cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be (de)serialized
    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid hash format
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    /// Cache server error
    #[error("Server error: {0}")]
    ServerError(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Store attempted on a read-only cache
    #[error("Cache {0} is read-only")]
    ReadOnly(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Future completing once a store has finished
pub type StoreFuture = BoxFuture<'static, CacheResult<()>>;

/// Outcome of a cache fetch. Anything but `Hit` means the rule must be built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FetchResult {
    /// Artifact written to the destination
    Hit {
        /// Name of the cache that served it
        cache: String,
        /// Metadata recorded at store time
        metadata: BTreeMap<String, String>,
    },
    /// Key not present
    Miss,
    /// The cache failed; treated like a miss
    Error {
        /// Description of the failure
        message: String,
    },
    /// The fetch was not attempted
    Skipped,
}

impl FetchResult {
    /// Build an error result
    pub fn error(message: impl fmt::Display) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    /// Whether the artifact is now at the destination
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }

    /// Short label used in logs and reports
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Hit { .. } => "hit",
            Self::Miss => "miss",
            Self::Error { .. } => "error",
            Self::Skipped => "skipped",
        }
    }
}

/// What is being stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Every key the artifact is stored under
    pub rule_keys: Vec<RuleKey>,

    /// Target that produced it
    pub target: String,

    /// Free-form metadata returned with a hit
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Time the build took, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time_ms: Option<u64>,
}

impl ArtifactInfo {
    /// Info for a single key
    pub fn for_key(key: RuleKey, target: impl Into<String>) -> Self {
        Self {
            rule_keys: vec![key],
            target: target.into(),
            ..Self::default()
        }
    }
}

/// A cache of build artifacts keyed by [`RuleKey`]
pub trait ArtifactCache: Send + Sync {
    /// Name used in logs and fetch results
    fn name(&self) -> &str;

    /// Copy the artifact for `key` to `dest`.
    ///
    /// Never fails: errors are reported as [`FetchResult::Error`].
    fn fetch(&self, key: &RuleKey, dest: &Path) -> FetchResult;

    /// Store the file at `src` under every key in `info`.
    ///
    /// The file is read when the returned future runs; callers keep it alive
    /// until then.
    fn store(&self, info: ArtifactInfo, src: &Path) -> StoreFuture;

    /// Whether `store` does anything
    fn is_store_supported(&self) -> bool {
        true
    }
}

/// Cache that never hits and drops every store
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopArtifactCache;

impl ArtifactCache for NoopArtifactCache {
    fn name(&self) -> &str {
        "noop"
    }

    fn fetch(&self, _key: &RuleKey, _dest: &Path) -> FetchResult {
        FetchResult::Skipped
    }

    fn store(&self, _info: ArtifactInfo, _src: &Path) -> StoreFuture {
        futures::future::ready(Ok(())).boxed()
    }

    fn is_store_supported(&self) -> bool {
        false
    }
}

/// Several caches consulted in order; stores go to all of them
pub struct MultiArtifactCache {
    caches: Vec<Arc<dyn ArtifactCache>>,
}

impl MultiArtifactCache {
    /// Combine `caches`, fastest first
    #[must_use]
    pub fn new(caches: Vec<Arc<dyn ArtifactCache>>) -> Self {
        Self { caches }
    }
}

impl ArtifactCache for MultiArtifactCache {
    fn name(&self) -> &str {
        "multi"
    }

    fn fetch(&self, key: &RuleKey, dest: &Path) -> FetchResult {
        let mut last = FetchResult::Skipped;
        for cache in &self.caches {
            let result = cache.fetch(key, dest);
            debug!("Fetch of {} from {}: {}", key, cache.name(), result.label());
            if result.is_success() {
                return result;
            }
            // Keep the most informative non-hit: an error beats a miss beats a skip.
            last = match (&last, &result) {
                (FetchResult::Error { .. }, _) => last,
                (_, FetchResult::Error { .. } | FetchResult::Miss) => result,
                _ => last,
            };
        }
        last
    }

    fn store(&self, info: ArtifactInfo, src: &Path) -> StoreFuture {
        let stores: Vec<StoreFuture> = self
            .caches
            .iter()
            .filter(|cache| cache.is_store_supported())
            .map(|cache| cache.store(info.clone(), src))
            .collect();
        async move {
            for result in futures::future::join_all(stores).await {
                result?;
            }
            Ok(())
        }
        .boxed()
    }

    fn is_store_supported(&self) -> bool {
        self.caches.iter().any(|cache| cache.is_store_supported())
    }
}
