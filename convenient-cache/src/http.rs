//! HTTP artifact cache
//!
//! Talks to a bazel-remote style server: artifacts live at `/ac/<key>`, the
//! [`ArtifactInfo`] travels as JSON in the `x-artifact-info` header.

use crate::dir::atomic_write;
use crate::{ArtifactCache, ArtifactInfo, CacheError, CacheResult, FetchResult, RuleKey, StoreFuture};
use futures::future::FutureExt;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

const INFO_HEADER: &str = "x-artifact-info";

/// Remote artifact cache over HTTP
#[derive(Clone)]
pub struct HttpArtifactCache {
    name: String,
    base_url: String,
    client: Client,
    runtime: Handle,
    read_only: bool,
}

impl HttpArtifactCache {
    /// Create a new cache client.
    ///
    /// Fetches run on `runtime` and block the calling thread, which must not
    /// itself be a runtime thread.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidUrl` if the URL is malformed
    pub fn new(base_url: &str, runtime: Handle, read_only: bool) -> CacheResult<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(CacheError::InvalidUrl(base_url));
        }

        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            name: format!("http:{base_url}"),
            base_url,
            client,
            runtime,
            read_only,
        })
    }

    fn url(&self, key: &RuleKey) -> String {
        format!("{}/ac/{}", self.base_url, key)
    }

    async fn fetch_async(&self, key: &RuleKey, dest: &Path) -> CacheResult<Option<BTreeMap<String, String>>> {
        let response = self.client.get(self.url(key)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::ServerError(format!(
                "Failed to fetch artifact: {}",
                response.status()
            )));
        }

        let metadata = match response.headers().get(INFO_HEADER) {
            Some(value) => {
                let info: ArtifactInfo = serde_json::from_slice(value.as_bytes())?;
                info.metadata
            }
            None => BTreeMap::new(),
        };
        let body = response.bytes().await?;
        atomic_write(dest, |out| out.write_all(&body))?;
        Ok(Some(metadata))
    }

    async fn store_async(client: Client, urls: Vec<String>, info: ArtifactInfo, src: std::path::PathBuf) -> CacheResult<()> {
        let body = tokio::fs::read(&src).await?;
        let header = serde_json::to_string(&info)?;

        for url in urls {
            let response = client
                .put(&url)
                .header(INFO_HEADER, header.as_str())
                .body(body.clone())
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(CacheError::ServerError(format!(
                    "Failed to store artifact at {url}: {}",
                    response.status()
                )));
            }
            debug!("Uploaded {} for {}", url, info.target);
        }
        Ok(())
    }
}

impl ArtifactCache for HttpArtifactCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, key: &RuleKey, dest: &Path) -> FetchResult {
        match self.runtime.block_on(self.fetch_async(key, dest)) {
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
        let urls = info.rule_keys.iter().map(|key| self.url(key)).collect();
        Self::store_async(self.client.clone(), urls, info, src.to_path_buf()).boxed()
    }

    fn is_store_supported(&self) -> bool {
        !self.read_only
    }
}
