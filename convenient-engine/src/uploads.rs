//! Background cache uploads
//!
//! Store futures run on a dedicated runtime so rules never wait for them.
//! The build waits for all of them once at the end.

use convenient_cache::{CacheError, StoreFuture};
use std::io;
use std::sync::{Mutex, PoisonError};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Upload = (String, JoinHandle<Result<(), CacheError>>);

/// Runs store futures in the background
pub struct UploadTracker {
    runtime: Runtime,
    pending: Mutex<Vec<Upload>>,
}

impl UploadTracker {
    /// Tracker backed by a runtime with `threads` workers
    ///
    /// # Errors
    ///
    /// If the runtime cannot be created
    pub fn new(threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("cache-upload")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Handle for clients that need to run async I/O on the upload runtime
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Start `upload` in the background
    pub fn track(&self, description: impl Into<String>, upload: StoreFuture) {
        let description = description.into();
        debug!("Queued upload of {}", description);
        let handle = self.runtime.spawn(upload);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((description, handle));
    }

    /// Number of uploads not yet waited for
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Block until every tracked upload has finished, returning the failures.
    ///
    /// Must not be called from within an async context.
    pub fn wait_all(&self) -> Vec<(String, CacheError)> {
        let uploads = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let mut failures = Vec::new();
        for (description, handle) in uploads {
            let outcome = match self.runtime.block_on(handle) {
                Ok(result) => result,
                Err(join_error) => Err(CacheError::ServerError(format!("upload task failed: {join_error}"))),
            };
            if let Err(e) = outcome {
                warn!("Upload of {} failed: {}", description, e);
                failures.push((description, e));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wait_all_collects_failures() {
        let tracker = UploadTracker::new(2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let done = Arc::clone(&done);
            tracker.track(
                format!("upload {i}"),
                async move {
                    let _ = done.fetch_add(1, Ordering::SeqCst);
                    if i == 2 {
                        Err(CacheError::ServerError("full".into()))
                    } else {
                        Ok(())
                    }
                }
                .boxed(),
            );
        }

        let failures = tracker.wait_all();
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "upload 2");
        assert_eq!(tracker.pending(), 0);
    }
}
