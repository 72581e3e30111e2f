//! Dependency-aware tasks
//!
//! A [`DepsAwareTask`] wraps a unit of work together with two lazily computed
//! sets of other tasks:
//! - *prereqs*: must be fully complete before the dependency set is even requested
//! - *deps*: must be complete before the work runs
//!
//! Both suppliers are invoked at most once per task. The task status moves
//! `NotScheduled -> Scheduled -> Started -> Done` through compare-and-set, which
//! is what guarantees a task body never runs twice.

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Boxed error produced by task work and dependency suppliers
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Shared error cause, cloned into every waiter of a failed task
pub type SharedError = Arc<dyn Error + Send + Sync>;

/// Result of a task, shared by every waiter
pub type TaskResult<T> = Result<T, TaskError>;

/// Future resolving to a task's result
pub type TaskFuture<T> = BoxFuture<'static, TaskResult<T>>;

type Work<T> = Box<dyn FnOnce() -> Result<T, BoxError> + Send>;
type Supplier<T> = Box<dyn FnOnce() -> Result<Vec<Arc<DepsAwareTask<T>>>, BoxError> + Send>;

/// Errors recorded as a task's result
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// The work itself returned an error
    #[error("{0}")]
    Failed(SharedError),

    /// Computing the prerequisite set failed
    #[error("failed to compute prerequisites: {0}")]
    Prereqs(SharedError),

    /// Computing the dependency set failed
    #[error("failed to compute dependencies: {0}")]
    Deps(SharedError),

    /// A prerequisite or dependency finished with an error
    #[error("dependency `{name}` failed: {cause}")]
    DependencyFailed {
        /// Name of the failed task
        name: String,
        /// Its error
        cause: Box<TaskError>,
    },

    /// The work panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before its work started
    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    /// Follow `DependencyFailed` links down to the originating error
    #[must_use]
    pub fn root_cause(&self) -> &TaskError {
        let mut current = self;
        while let TaskError::DependencyFailed { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// The underlying error object, if the root cause carries one
    #[must_use]
    pub fn source_error(&self) -> Option<&SharedError> {
        match self.root_cause() {
            TaskError::Failed(e) | TaskError::Prereqs(e) | TaskError::Deps(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the root cause is a cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), TaskError::Cancelled)
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Created but never handed to a queue
    NotScheduled = 0,
    /// Owned by the queue (or parked on its dependencies)
    Scheduled = 1,
    /// Work is executing on a worker
    Started = 2,
    /// Result is available
    Done = 3,
}

impl TaskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotScheduled,
            1 => Self::Scheduled,
            2 => Self::Started,
            _ => Self::Done,
        }
    }
}

/// The prerequisite and dependency suppliers of a task
pub struct DepsSupplier<T> {
    prereqs: Supplier<T>,
    deps: Supplier<T>,
}

impl<T: Send + Sync + 'static> DepsSupplier<T> {
    /// Supplier with explicit prerequisite and dependency closures
    pub fn new<P, D>(prereqs: P, deps: D) -> Self
    where
        P: FnOnce() -> Result<Vec<Arc<DepsAwareTask<T>>>, BoxError> + Send + 'static,
        D: FnOnce() -> Result<Vec<Arc<DepsAwareTask<T>>>, BoxError> + Send + 'static,
    {
        Self {
            prereqs: Box::new(prereqs),
            deps: Box::new(deps),
        }
    }

    /// A task with neither prerequisites nor dependencies
    #[must_use]
    pub fn none() -> Self {
        Self::new(|| Ok(Vec::new()), || Ok(Vec::new()))
    }

    /// Only a dependency set
    pub fn deps<D>(deps: D) -> Self
    where
        D: FnOnce() -> Result<Vec<Arc<DepsAwareTask<T>>>, BoxError> + Send + 'static,
    {
        Self::new(|| Ok(Vec::new()), deps)
    }

    /// Only a prerequisite set
    pub fn prereqs<P>(prereqs: P) -> Self
    where
        P: FnOnce() -> Result<Vec<Arc<DepsAwareTask<T>>>, BoxError> + Send + 'static,
    {
        Self::new(prereqs, || Ok(Vec::new()))
    }
}

/// A schedulable unit of work with prerequisite and dependency sets
pub struct DepsAwareTask<T> {
    name: String,
    status: AtomicU8,
    work: Mutex<Option<Work<T>>>,
    prereq_supplier: Mutex<Option<Supplier<T>>>,
    dep_supplier: Mutex<Option<Supplier<T>>>,
    prereqs: OnceLock<Result<Vec<Arc<DepsAwareTask<T>>>, TaskError>>,
    deps: OnceLock<Result<Vec<Arc<DepsAwareTask<T>>>, TaskError>>,
    result: OnceLock<TaskResult<T>>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Shared<oneshot::Receiver<()>>,

    /// Outstanding dependencies while parked by the toposort worker
    pending: AtomicUsize,

    /// Tasks parked on this one, woken on completion
    dependents: Mutex<Vec<Arc<DepsAwareTask<T>>>>,
}

impl<T> fmt::Debug for DepsAwareTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepsAwareTask")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T> DepsAwareTask<T> {
    /// Task name, used in logs and dependency errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Atomically move from `expected` to `new`; returns whether this call won
    pub fn compare_and_set_status(&self, expected: TaskStatus, new: TaskStatus) -> bool {
        self.status
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a result is available
    pub fn is_done(&self) -> bool {
        self.result.get().is_some()
    }

    /// The result, once done
    pub fn result(&self) -> Option<&TaskResult<T>> {
        self.result.get()
    }
}

impl<T: Send + Sync + 'static> DepsAwareTask<T> {
    /// Create a task in the `NotScheduled` state
    pub fn new<W>(name: impl Into<String>, work: W, supplier: DepsSupplier<T>) -> Arc<Self>
    where
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        Arc::new(Self {
            name: name.into(),
            status: AtomicU8::new(TaskStatus::NotScheduled as u8),
            work: Mutex::new(Some(Box::new(work))),
            prereq_supplier: Mutex::new(Some(supplier.prereqs)),
            dep_supplier: Mutex::new(Some(supplier.deps)),
            prereqs: OnceLock::new(),
            deps: OnceLock::new(),
            result: OnceLock::new(),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: done_rx.shared(),
            pending: AtomicUsize::new(0),
            dependents: Mutex::new(Vec::new()),
        })
    }

    /// Create an independent task
    pub fn of<W>(name: impl Into<String>, work: W) -> Arc<Self>
    where
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        Self::new(name, work, DepsSupplier::none())
    }

    /// Prerequisites, computed at most once
    pub(crate) fn prereqs(&self) -> Result<&[Arc<DepsAwareTask<T>>], TaskError> {
        let computed = self.prereqs.get_or_init(|| {
            let supplier = self
                .prereq_supplier
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match supplier {
                Some(supplier) => supplier().map_err(|e| TaskError::Prereqs(Arc::from(e))),
                None => Ok(Vec::new()),
            }
        });
        computed.as_deref().map_err(Clone::clone)
    }

    /// Dependencies, computed at most once and only after prereqs are done
    pub(crate) fn deps(&self) -> Result<&[Arc<DepsAwareTask<T>>], TaskError> {
        let computed = self.deps.get_or_init(|| {
            let supplier = self
                .dep_supplier
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match supplier {
                Some(supplier) => supplier().map_err(|e| TaskError::Deps(Arc::from(e))),
                None => Ok(Vec::new()),
            }
        });
        computed.as_deref().map_err(Clone::clone)
    }

    /// Run the work on the current thread. Caller must hold the `Started` status.
    pub(crate) fn call(&self) -> TaskResult<T> {
        let work = self.work.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(work) = work else {
            return Err(TaskError::Panicked(format!(
                "work of task `{}` was already consumed",
                self.name
            )));
        };

        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TaskError::Failed(Arc::from(e))),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(TaskError::Panicked(message))
            }
        }
    }

    /// Record the result and return the tasks parked on this one
    pub(crate) fn complete(&self, result: TaskResult<T>) -> Vec<Arc<DepsAwareTask<T>>> {
        self.status.store(TaskStatus::Done as u8, Ordering::Release);
        let _ = self.result.set(result);
        if let Some(tx) = self.done_tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
        std::mem::take(&mut *self.dependents.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Cancel the task unless its work already started.
    ///
    /// Returns the woken dependents on success, `None` if the task was running or done.
    pub(crate) fn cancel(&self) -> Option<Vec<Arc<DepsAwareTask<T>>>> {
        let won = self.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Started)
            || self.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started);
        won.then(|| self.complete(Err(TaskError::Cancelled)))
    }

    /// Park `dependent` on this task. Returns false if this task is already done.
    pub(crate) fn add_dependent(&self, dependent: &Arc<DepsAwareTask<T>>) -> bool {
        let mut dependents = self.dependents.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_done() {
            return false;
        }
        dependents.push(Arc::clone(dependent));
        true
    }

    pub(crate) fn reset_pending(&self) {
        self.pending.store(1, Ordering::Release);
    }

    pub(crate) fn acquire_pending(&self) {
        let _ = self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one outstanding dependency; true when this was the last one
    pub(crate) fn release_pending(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

impl<T: Clone + Send + Sync + 'static> DepsAwareTask<T> {
    /// A future resolving to this task's result
    pub fn future(self: &Arc<Self>) -> TaskFuture<T> {
        let task = Arc::clone(self);
        let done = self.done_rx.clone();
        async move {
            let _ = done.await;
            task.result().cloned().unwrap_or(Err(TaskError::Cancelled))
        }
        .boxed()
    }

    /// Block the calling thread until the result is available
    pub fn wait(self: &Arc<Self>) -> TaskResult<T> {
        futures::executor::block_on(self.future())
    }
}

/// First failure among `tasks`, wrapped as a dependency failure
pub(crate) fn first_failure<T>(tasks: &[Arc<DepsAwareTask<T>>]) -> Option<TaskError> {
    tasks.iter().find_map(|task| match task.result.get() {
        Some(Err(cause)) => Some(TaskError::DependencyFailed {
            name: task.name.clone(),
            cause: Box::new(cause.clone()),
        }),
        _ => None,
    })
}
