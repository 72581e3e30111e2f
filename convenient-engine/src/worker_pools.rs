//! Worker process pools shared by every rule using the same tool

use crate::rules::WorkerToolSpec;
use crate::target::BuildPaths;
use convenient_worker::{DefaultWorkerProcess, WorkerError, WorkerProcessParams, WorkerProcessPool, WorkerResult};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Pool of default worker processes
pub type DefaultWorkerPool = WorkerProcessPool<DefaultWorkerProcess>;

/// Creates one pool per distinct worker startup command
#[derive(Debug)]
pub struct WorkerProcessPoolFactory {
    paths: BuildPaths,
    pools: Mutex<HashMap<String, Arc<DefaultWorkerPool>>>,
}

impl WorkerProcessPoolFactory {
    /// Factory placing process scratch directories under `paths.worker_dir()`
    #[must_use]
    pub fn new(paths: BuildPaths) -> Self {
        Self {
            paths,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Pool for `tool`, created on first request
    pub fn get_pool(&self, tool: &WorkerToolSpec) -> Arc<DefaultWorkerPool> {
        let hash = tool.pool_hash();
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(&hash) {
            if pool.capacity() != tool.capacity() {
                warn!(
                    "Worker pool {} already exists with capacity {}, ignoring requested {}",
                    hash,
                    pool.capacity(),
                    tool.capacity()
                );
            }
            return Arc::clone(pool);
        }

        info!("Creating worker pool {} for `{}`", hash, tool.command.join(" "));
        let pool = Arc::new(WorkerProcessPool::new(tool.capacity(), hash.clone(), self.start_fn(tool, &hash)));
        let _ = pools.insert(hash, Arc::clone(&pool));
        pool
    }

    fn start_fn(&self, tool: &WorkerToolSpec, hash: &str) -> convenient_worker::StartWorkerProcess<DefaultWorkerProcess> {
        let pool_dir = self.paths.worker_dir().join(hash);
        let project_root = self.paths.project_root().to_path_buf();
        let command = tool.command.clone();
        let env = tool.env.clone();
        let started = AtomicUsize::new(0);

        Box::new(move || {
            let temp_dir = pool_dir.join(started.fetch_add(1, Ordering::Relaxed).to_string());
            fs::create_dir_all(&temp_dir)?;
            let mut params = WorkerProcessParams::new(command.clone(), temp_dir);
            params.env.clone_from(&env);
            params.working_dir = Some(project_root.clone());
            Ok(DefaultWorkerProcess::new(params))
        })
    }

    /// Number of pools created so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no pool was created yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every pool
    ///
    /// # Errors
    ///
    /// The first pool that failed to close; all pools are attempted
    pub fn close_all(&self) -> WorkerResult<()> {
        let pools: Vec<_> = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let mut first_error: Option<WorkerError> = None;
        for (hash, pool) in pools {
            if let Err(e) = pool.close() {
                warn!("Failed to close worker pool {}: {}", hash, e);
                let _ = first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
