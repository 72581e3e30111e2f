//! The caching build engine
//!
//! Every rule becomes one scheduler task whose dependency set is the tasks of
//! the rule's declared dependencies. When a task runs, its rule is resolved in
//! this order, stopping at the first success:
//!
//! 1. the rule key recorded by the last local build matches and the outputs exist
//! 2. the artifact cache has the outputs under the default rule key
//! 3. the rule's manifest names a dependency-file key the cache has outputs for
//! 4. the steps run locally; outputs and manifest are then uploaded

use crate::artifact::{self, ArtifactFetcher};
use crate::build_result::{BuildRuleSuccessType, RuleSuccess};
use crate::config::{DepFiles, EngineConfig};
use crate::error::{BuildError, EngineResult, RuleError};
use crate::graph::ActionGraph;
use crate::hashing::FileHashCache;
use crate::manifest_manager::{ManifestFetchResult, ManifestRuleKeyManager, ManifestStoreSummary};
use crate::rulekey::{DefaultRuleKeyFactory, DepFileRuleKeyFactory, RuleKeyAndInputs};
use crate::rules::{BuildContext, BuildRule};
use crate::steps::{StepContext, run_steps};
use crate::target::{BuildPaths, BuildTarget};
use crate::uploads::UploadTracker;
use crate::worker_pools::WorkerProcessPoolFactory;
use convenient_cache::{
    ArtifactCache, ArtifactInfo, CacheError, DirArtifactCache, FetchResult, HttpArtifactCache, MultiArtifactCache,
    NoopArtifactCache, RuleKey,
};
use convenient_executor::{BoxError, DepsAwareExecutor, DepsAwareTask, DepsSupplier, TaskFuture, TaskStatus};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

type RuleTask = Arc<DepsAwareTask<RuleSuccess>>;

/// State shared by every rule task of the engine
struct EngineShared {
    config: EngineConfig,
    paths: BuildPaths,
    hashes: FileHashCache,
    cache: Arc<dyn ArtifactCache>,
    worker_pools: WorkerProcessPoolFactory,
    uploads: UploadTracker,
}

/// Builds rules of an action graph, consulting caches first
pub struct CachingBuildEngine {
    graph: Arc<ActionGraph>,
    shared: Arc<EngineShared>,
    executor: DepsAwareExecutor<RuleSuccess>,
    tasks: Mutex<HashMap<BuildTarget, RuleTask>>,
}

fn open_cache(config: &EngineConfig, uploads: &UploadTracker) -> EngineResult<Arc<dyn ArtifactCache>> {
    let mut caches: Vec<Arc<dyn ArtifactCache>> = Vec::new();
    if let Some(dir) = &config.cache.dir {
        caches.push(Arc::new(DirArtifactCache::new(dir, config.cache.read_only)?));
    }
    if let Some(url) = &config.cache.http_url {
        caches.push(Arc::new(HttpArtifactCache::new(url, uploads.handle(), config.cache.read_only)?));
    }
    Ok(match caches.len() {
        0 => Arc::new(NoopArtifactCache),
        1 => caches.remove(0),
        _ => Arc::new(MultiArtifactCache::new(caches)),
    })
}

impl CachingBuildEngine {
    /// Engine for `graph` rooted at `project_root`, with caches from `config`
    ///
    /// # Errors
    ///
    /// If a cache backend or a thread pool cannot be created
    pub fn new(graph: Arc<ActionGraph>, project_root: impl Into<PathBuf>, config: EngineConfig) -> EngineResult<Self> {
        let uploads = UploadTracker::new(config.upload_threads)?;
        let cache = open_cache(&config, &uploads)?;
        Self::build_engine(graph, project_root.into(), config, cache, uploads)
    }

    /// Engine using an explicit artifact cache
    ///
    /// # Errors
    ///
    /// If a thread pool cannot be created
    pub fn with_cache(
        graph: Arc<ActionGraph>,
        project_root: impl Into<PathBuf>,
        config: EngineConfig,
        cache: Arc<dyn ArtifactCache>,
    ) -> EngineResult<Self> {
        let uploads = UploadTracker::new(config.upload_threads)?;
        Self::build_engine(graph, project_root.into(), config, cache, uploads)
    }

    fn build_engine(
        graph: Arc<ActionGraph>,
        project_root: PathBuf,
        config: EngineConfig,
        cache: Arc<dyn ArtifactCache>,
        uploads: UploadTracker,
    ) -> EngineResult<Self> {
        let paths = BuildPaths::new(&project_root, &config.out_dir);
        let executor = DepsAwareExecutor::new(config.threads, config.scheduler.into())?;
        info!(
            "Build engine for {} rules: {} threads, dep files {:?}, cache {}",
            graph.len(),
            config.threads,
            config.dep_files,
            cache.name()
        );
        let shared = EngineShared {
            hashes: FileHashCache::new(project_root),
            worker_pools: WorkerProcessPoolFactory::new(paths.clone()),
            config,
            paths,
            cache,
            uploads,
        };
        Ok(Self {
            graph,
            shared: Arc::new(shared),
            executor,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Output layout
    #[must_use]
    pub fn paths(&self) -> &BuildPaths {
        &self.shared.paths
    }

    /// The action graph
    #[must_use]
    pub fn graph(&self) -> &ActionGraph {
        &self.graph
    }

    /// Create tasks for `targets` and everything they depend on, submit
    /// them and return the futures of `targets`, in order.
    ///
    /// Tasks are memoized per target until [`CachingBuildEngine::finish_build`].
    ///
    /// # Errors
    ///
    /// Unknown targets and dependency cycles
    pub fn build(&self, targets: &[BuildTarget]) -> EngineResult<Vec<(BuildTarget, TaskFuture<RuleSuccess>)>> {
        let order = self.graph.topological_order(targets)?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for rule in order {
            if tasks.contains_key(rule.target()) {
                continue;
            }
            let deps = rule
                .deps()
                .iter()
                .map(|dep| {
                    tasks
                        .get(dep)
                        .cloned()
                        .ok_or_else(|| BuildError::UnknownTarget(dep.to_string()))
                })
                .collect::<EngineResult<Vec<_>>>()?;
            let target = rule.target().clone();
            let _ = tasks.insert(target, self.rule_task(rule, deps));
        }

        let mut futures = Vec::with_capacity(targets.len());
        for target in targets {
            let task = tasks
                .get(target)
                .ok_or_else(|| BuildError::UnknownTarget(target.to_string()))?;
            futures.push((target.clone(), self.executor.submit(task)));
        }
        Ok(futures)
    }

    fn rule_task(&self, rule: Arc<dyn BuildRule>, deps: Vec<RuleTask>) -> RuleTask {
        let shared = Arc::clone(&self.shared);
        let dep_tasks = deps.clone();
        let name = rule.target().to_string();
        DepsAwareTask::new(
            name,
            move || -> Result<RuleSuccess, BoxError> {
                let dep_keys = dependency_keys(&dep_tasks)?;
                Ok(build_rule(&shared, rule.as_ref(), &dep_keys)?)
            },
            DepsSupplier::deps(move || Ok(deps)),
        )
    }

    /// Cancel every task that has not started; returns how many were cancelled
    pub fn cancel_pending(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = tasks
            .values()
            .filter(|task| matches!(task.status(), TaskStatus::NotScheduled | TaskStatus::Scheduled))
            .filter(|task| self.executor.cancel(task))
            .count();
        if cancelled > 0 {
            info!("Cancelled {} pending rules", cancelled);
        }
        cancelled
    }

    /// Wait for uploads and forget this build's tasks and file hashes
    ///
    /// Returns the failed uploads.
    pub fn finish_build(&self) -> Vec<(String, CacheError)> {
        let failures = self.shared.uploads.wait_all();
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.shared.hashes.clear();
        failures
    }

    /// Stop the scheduler threads and worker processes
    pub fn close(self) {
        let _ = self.finish_build();
        self.executor.close();
        if let Err(e) = self.shared.worker_pools.close_all() {
            warn!("Failed to close worker pools: {}", e);
        }
    }
}

/// Default rule keys of finished dependencies
fn dependency_keys(deps: &[RuleTask]) -> Result<BTreeMap<BuildTarget, RuleKey>, RuleError> {
    let mut keys = BTreeMap::new();
    for dep in deps {
        match dep.result() {
            Some(Ok(success)) => {
                let _ = keys.insert(success.target.clone(), success.rule_key);
            }
            _ => return Err(RuleError::MissingDependency(dep.name().to_string())),
        }
    }
    Ok(keys)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

struct RuleBuilder<'a> {
    shared: &'a EngineShared,
    rule: &'a dyn BuildRule,
    dep_keys: &'a BTreeMap<BuildTarget, RuleKey>,
    start: Instant,
}

fn build_rule(
    shared: &EngineShared,
    rule: &dyn BuildRule,
    dep_keys: &BTreeMap<BuildTarget, RuleKey>,
) -> Result<RuleSuccess, RuleError> {
    RuleBuilder {
        shared,
        rule,
        dep_keys,
        start: Instant::now(),
    }
    .run()
}

impl RuleBuilder<'_> {
    fn target(&self) -> String {
        self.rule.target().to_string()
    }

    fn io_error(&self, source: io::Error) -> RuleError {
        RuleError::Io {
            target: self.target(),
            source,
        }
    }

    fn success(
        &self,
        success_type: BuildRuleSuccessType,
        rule_key: RuleKey,
        cache_result: FetchResult,
    ) -> RuleSuccess {
        RuleSuccess {
            target: self.rule.target().clone(),
            success_type,
            rule_key,
            dep_file_rule_key: None,
            cache_result,
            manifest_fetch: None,
            manifest_store: None,
            duration_ms: elapsed_ms(self.start),
            outputs: self.rule.outputs().to_vec(),
        }
    }

    fn manifest_manager(&self) -> ManifestRuleKeyManager<'_> {
        let config = &self.shared.config;
        ManifestRuleKeyManager::new(
            config.dep_files,
            self.rule,
            &self.shared.hashes,
            config.max_dep_file_cache_entries,
            self.shared.cache.as_ref(),
            &self.shared.paths,
        )
    }

    fn run(self) -> Result<RuleSuccess, RuleError> {
        let rule_key = DefaultRuleKeyFactory::new(&self.shared.hashes)
            .build(self.rule, self.dep_keys)
            .map_err(|source| RuleError::RuleKey {
                target: self.target(),
                source,
            })?;
        debug!("{}: rule key {}", self.rule.target(), rule_key);

        if self.has_matching_rule_key(&rule_key) {
            debug!("{}: outputs match rule key {}", self.rule.target(), rule_key);
            return Ok(self.success(BuildRuleSuccessType::MatchingRuleKey, rule_key, FetchResult::Skipped));
        }

        let fetcher = ArtifactFetcher::new(&self.shared.paths);
        let cache = self.shared.cache.as_ref();
        let cache_result = if self.rule.is_cacheable() {
            fetcher.fetch_and_overlay(cache, &rule_key, self.rule)
        } else {
            FetchResult::Skipped
        };
        if cache_result.is_success() {
            self.after_outputs_changed(&rule_key)?;
            info!("{}: fetched from cache", self.rule.target());
            return Ok(self.success(BuildRuleSuccessType::FetchedFromCache, rule_key, cache_result));
        }

        let manager = self.manifest_manager();
        let manifest_key = self.manifest_key(&manager);
        let mut manifest_fetch: Option<ManifestFetchResult> = None;
        if let Some(manifest_key) = &manifest_key {
            let fetched = manager.perform_manifest_based_cache_fetch(manifest_key, &fetcher);
            if fetched.is_hit() {
                self.after_outputs_changed(&rule_key)?;
                info!("{}: fetched from cache through manifest", self.rule.target());
                let mut success = self.success(
                    BuildRuleSuccessType::FetchedFromCacheManifestBased,
                    rule_key,
                    cache_result,
                );
                success.dep_file_rule_key = fetched.dep_file_rule_key;
                success.manifest_fetch = Some(fetched);
                return Ok(success);
            }
            manifest_fetch = Some(fetched);
        }

        let build_time_ms = self.build_locally()?;

        let dep_file_key = self.dep_file_key();
        self.store_artifact(&rule_key, dep_file_key.as_ref(), build_time_ms);
        let manifest_store = match (&manifest_key, &dep_file_key) {
            (Some(manifest_key), Some(dep_file_key)) => {
                self.update_manifest(&manager, manifest_key, dep_file_key, build_time_ms)
            }
            _ => None,
        };
        self.record_rule_key(&rule_key)?;

        info!("{}: built locally in {} ms", self.rule.target(), build_time_ms);
        let mut success = self.success(BuildRuleSuccessType::BuiltLocally, rule_key, cache_result);
        success.dep_file_rule_key = dep_file_key.map(|key| key.rule_key);
        success.manifest_fetch = manifest_fetch;
        success.manifest_store = manifest_store;
        Ok(success)
    }

    fn has_matching_rule_key(&self, rule_key: &RuleKey) -> bool {
        let path = self.shared.paths.rule_key_path(self.rule.target());
        let recorded = fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse::<RuleKey>().ok());
        recorded.as_ref() == Some(rule_key)
            && self
                .rule
                .outputs()
                .iter()
                .all(|output| self.shared.paths.resolve(output).exists())
    }

    fn record_rule_key(&self, rule_key: &RuleKey) -> Result<(), RuleError> {
        let path = self.shared.paths.rule_key_path(self.rule.target());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        fs::write(&path, rule_key.to_string()).map_err(|e| self.io_error(e))
    }

    fn forget_rule_key(&self) -> Result<(), RuleError> {
        match fs::remove_file(self.shared.paths.rule_key_path(self.rule.target())) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(self.io_error(e)),
            _ => Ok(()),
        }
    }

    /// Outputs were replaced: stale hashes must go and the new key is recorded
    fn after_outputs_changed(&self, rule_key: &RuleKey) -> Result<(), RuleError> {
        for output in self.rule.outputs() {
            self.shared.hashes.invalidate(output);
        }
        self.record_rule_key(rule_key)
    }

    fn manifest_key(&self, manager: &ManifestRuleKeyManager<'_>) -> Option<RuleKeyAndInputs> {
        if !manager.use_manifest_caching() {
            return None;
        }
        match DepFileRuleKeyFactory::new(&self.shared.hashes).build_manifest_key(self.rule, self.dep_keys) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("{}: cannot compute manifest key: {}", self.rule.target(), e);
                None
            }
        }
    }

    /// Run the rule's steps; returns the build time
    fn build_locally(&self) -> Result<u64, RuleError> {
        let paths = &self.shared.paths;
        let root = paths.project_root();
        self.forget_rule_key()?;
        artifact::remove_outputs(root, self.rule.outputs()).map_err(|e| self.io_error(e))?;
        let scratch = paths.scratch_dir(self.rule.target());
        if scratch.exists() {
            fs::remove_dir_all(&scratch).map_err(|e| self.io_error(e))?;
        }
        fs::create_dir_all(&scratch).map_err(|e| self.io_error(e))?;

        let start = Instant::now();
        let steps = self.rule.build_steps(&BuildContext { paths });
        let context = StepContext {
            target: self.rule.target(),
            paths,
            worker_pools: &self.shared.worker_pools,
        };
        run_steps(&steps, &context).map_err(|source| RuleError::Step {
            target: self.target(),
            source,
        })?;
        let build_time_ms = elapsed_ms(start);

        for output in self.rule.outputs() {
            self.shared.hashes.invalidate(output);
            if !paths.resolve(output).exists() {
                return Err(self.io_error(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("declared output {} was not produced", output.display()),
                )));
            }
        }
        Ok(build_time_ms)
    }

    fn dep_file_key(&self) -> Option<RuleKeyAndInputs> {
        if self.shared.config.dep_files == DepFiles::Disabled {
            return None;
        }
        let support = self.rule.dep_file_support()?;
        if !support.use_dependency_file_rule_keys() {
            return None;
        }
        let context = BuildContext {
            paths: &self.shared.paths,
        };
        let key = support.inputs_after_building(&context).and_then(|used| {
            DepFileRuleKeyFactory::new(&self.shared.hashes).build(self.rule, self.dep_keys, &used)
        });
        match key {
            Ok(key) => {
                debug!(
                    "{}: dependency-file key {} over {} inputs",
                    self.rule.target(),
                    key.rule_key,
                    key.inputs.len()
                );
                Some(key)
            }
            Err(e) => {
                warn!("{}: cannot compute dependency-file key: {}", self.rule.target(), e);
                None
            }
        }
    }

    fn store_artifact(&self, rule_key: &RuleKey, dep_file_key: Option<&RuleKeyAndInputs>, build_time_ms: u64) {
        let cache = &self.shared.cache;
        if !self.rule.is_cacheable() || !cache.is_store_supported() {
            return;
        }

        let paths = &self.shared.paths;
        let staged = tempfile::Builder::new()
            .prefix("artifact.")
            .suffix(".tar.zst")
            .tempfile_in(paths.scratch_dir(self.rule.target()))
            .map(tempfile::NamedTempFile::into_temp_path)
            .and_then(|staged| {
                artifact::pack_outputs(paths.project_root(), self.rule.outputs(), &staged)?;
                Ok(staged)
            });
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                warn!("{}: cannot pack outputs: {}", self.rule.target(), e);
                return;
            }
        };

        let mut info = ArtifactInfo::for_key(*rule_key, self.target());
        info.rule_keys.extend(dep_file_key.map(|key| key.rule_key));
        info.build_time_ms = Some(build_time_ms);
        let _ = info
            .metadata
            .insert("rule_type".to_string(), self.rule.rule_type().to_string());

        let store = cache.store(info, &staged);
        self.shared.uploads.track(
            format!("{} outputs", self.rule.target()),
            async move {
                let result = store.await;
                drop(staged);
                result
            }
            .boxed(),
        );
    }

    fn update_manifest(
        &self,
        manager: &ManifestRuleKeyManager<'_>,
        manifest_key: &RuleKeyAndInputs,
        dep_file_key: &RuleKeyAndInputs,
        build_time_ms: u64,
    ) -> Option<ManifestStoreSummary> {
        match manager.update_and_store_manifest(dep_file_key.rule_key, &dep_file_key.inputs, manifest_key, build_time_ms) {
            Ok(mut result) => {
                if let Some(store) = result.store_future.take() {
                    self.shared
                        .uploads
                        .track(format!("{} manifest", self.rule.target()), store);
                }
                Some(result.summary())
            }
            Err(e) => {
                warn!("{}: cannot update manifest: {}", self.rule.target(), e);
                None
            }
        }
    }
}
