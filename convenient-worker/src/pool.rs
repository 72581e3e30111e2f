//! Fixed-capacity pool of worker processes
//!
//! The pool owns `capacity` slots. Free slots sit in a channel; borrowing a
//! worker receives a slot from it and dropping the lease sends it back, so
//! there are never more leases than slots. Each slot starts its process on
//! first use and replaces it when found dead.

use crate::error::{WorkerError, WorkerResult};
use crate::process::{WorkerJobResult, WorkerProcess};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Starts a fresh worker process for a slot
pub type StartWorkerProcess<P> = Box<dyn Fn() -> WorkerResult<P> + Send + Sync>;

struct SlotState<P> {
    closed: bool,
    process: Option<P>,
}

/// One slot of the pool and the process currently living in it
struct WorkerLifecycle<P> {
    index: usize,
    start: Arc<StartWorkerProcess<P>>,
    state: Mutex<SlotState<P>>,
}

impl<P: WorkerProcess> WorkerLifecycle<P> {
    fn new(index: usize, start: Arc<StartWorkerProcess<P>>) -> Self {
        Self {
            index,
            start,
            state: Mutex::new(SlotState {
                closed: false,
                process: None,
            }),
        }
    }

    /// Run `f` against this slot's live process, starting or replacing it as needed
    fn with_process<R>(&self, f: impl FnOnce(&mut P) -> WorkerResult<R>) -> WorkerResult<R> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(WorkerError::PoolClosed);
        }

        if let Some(process) = state.process.as_mut() {
            if !process.is_alive() {
                warn!("Worker process in slot {} died, restarting it", self.index);
                process.close();
                state.process = None;
            }
        }

        let process = match state.process.take() {
            Some(process) => process,
            None => {
                debug!("Starting worker process for slot {}", self.index);
                (self.start)()?
            }
        };
        let process = state.process.insert(process);
        f(process)
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        if let Some(mut process) = state.process.take() {
            process.close();
        }
    }
}

/// A pool of at most `capacity` concurrently leased worker processes
pub struct WorkerProcessPool<P> {
    capacity: usize,
    pool_hash: String,
    available_tx: Sender<Arc<WorkerLifecycle<P>>>,
    available_rx: Receiver<Arc<WorkerLifecycle<P>>>,
    lifecycles: Vec<Arc<WorkerLifecycle<P>>>,
    closed: AtomicBool,
}

impl<P> fmt::Debug for WorkerProcessPool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcessPool")
            .field("capacity", &self.capacity)
            .field("pool_hash", &self.pool_hash)
            .field("available", &self.available_rx.len())
            .finish()
    }
}

impl<P: WorkerProcess> WorkerProcessPool<P> {
    /// Create a pool with `capacity` slots (at least one). No process starts yet.
    pub fn new(capacity: usize, pool_hash: impl Into<String>, start: StartWorkerProcess<P>) -> Self {
        let capacity = capacity.max(1);
        let start = Arc::new(start);
        let (available_tx, available_rx) = crossbeam_channel::bounded(capacity);

        let lifecycles: Vec<_> = (0..capacity)
            .map(|i| Arc::new(WorkerLifecycle::new(i, Arc::clone(&start))))
            .collect();
        for lifecycle in &lifecycles {
            let _ = available_tx.send(Arc::clone(lifecycle));
        }

        Self {
            capacity,
            pool_hash: pool_hash.into(),
            available_tx,
            available_rx,
            lifecycles,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Identity of the startup command this pool serves
    pub fn pool_hash(&self) -> &str {
        &self.pool_hash
    }

    /// Slots not currently leased
    pub fn available(&self) -> usize {
        self.available_rx.len()
    }

    /// Block until a slot is free and lease it
    pub fn borrow(&self) -> WorkerResult<BorrowedWorkerProcess<P>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::PoolClosed);
        }
        let lifecycle = self.available_rx.recv().map_err(|_| WorkerError::PoolClosed)?;
        Ok(self.lease(lifecycle))
    }

    /// Like [`borrow`](Self::borrow) but gives up after `timeout`
    pub fn borrow_timeout(&self, timeout: Duration) -> WorkerResult<BorrowedWorkerProcess<P>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::PoolClosed);
        }
        match self.available_rx.recv_timeout(timeout) {
            Ok(lifecycle) => Ok(self.lease(lifecycle)),
            Err(RecvTimeoutError::Timeout) => Err(WorkerError::BorrowTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(WorkerError::PoolClosed),
        }
    }

    fn lease(&self, lifecycle: Arc<WorkerLifecycle<P>>) -> BorrowedWorkerProcess<P> {
        BorrowedWorkerProcess {
            lifecycle: Some(lifecycle),
            release: self.available_tx.clone(),
        }
    }

    /// Close every process in the pool.
    ///
    /// All leases must have been returned; otherwise the processes are still
    /// closed but [`WorkerError::PoolStillInUse`] is returned.
    pub fn close(&self) -> WorkerResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let returned = self.available_rx.try_iter().take(self.capacity).count();
        for lifecycle in &self.lifecycles {
            lifecycle.close();
        }
        debug!("Closed worker process pool {} ({} slots)", self.pool_hash, self.capacity);

        if returned == self.capacity {
            Ok(())
        } else {
            Err(WorkerError::PoolStillInUse {
                outstanding: self.capacity - returned,
                capacity: self.capacity,
            })
        }
    }
}

/// Exclusive lease on one pool slot, returned to the pool on drop
pub struct BorrowedWorkerProcess<P> {
    lifecycle: Option<Arc<WorkerLifecycle<P>>>,
    release: Sender<Arc<WorkerLifecycle<P>>>,
}

impl<P: WorkerProcess> BorrowedWorkerProcess<P> {
    /// Run `f` against the leased process, launching it and handshaking first
    pub fn with_process<R>(&mut self, f: impl FnOnce(&mut P) -> WorkerResult<R>) -> WorkerResult<R> {
        let lifecycle = self.lifecycle.as_ref().ok_or(WorkerError::PoolClosed)?;
        lifecycle.with_process(|process| {
            process.prepare_for_reuse();
            process.ensure_launch_and_handshake()?;
            f(process)
        })
    }

    /// Submit a job to the leased process and wait for its result
    pub fn submit_and_wait_for_job(&mut self, job_args: &str) -> WorkerResult<WorkerJobResult> {
        self.with_process(|process| process.submit_and_wait_for_job(job_args))
    }
}

impl<P> Drop for BorrowedWorkerProcess<P> {
    fn drop(&mut self) {
        if let Some(lifecycle) = self.lifecycle.take() {
            // The channel is sized to the capacity, so a returned slot always fits.
            let _ = self.release.try_send(lifecycle);
        }
    }
}
