//! Fixed-size thread pool running [`DepsAwareTask`]s

use crate::task::{DepsAwareTask, TaskFuture, TaskStatus};
use crate::worker::{DepsAwareWorker, WorkQueue, WorkerKind};
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Executor owning a pool of worker threads
pub struct DepsAwareExecutor<T> {
    queue: WorkQueue<T>,
    interrupt: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    kind: WorkerKind,
}

impl<T: Clone + Send + Sync + 'static> DepsAwareExecutor<T> {
    /// Spawn `num_threads` workers (at least one)
    pub fn new(num_threads: usize, kind: WorkerKind) -> std::io::Result<Self> {
        let num_threads = num_threads.max(1);
        info!("Creating deps-aware executor with {} {:?} workers", num_threads, kind);

        let queue = WorkQueue::new();
        let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded::<()>(0);

        let mut threads = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let worker = DepsAwareWorker::new(kind, queue.clone(), interrupt_rx.clone());
            let handle = thread::Builder::new()
                .name(format!("deps-aware-worker-{i}"))
                .spawn(move || worker.loop_until_interrupted())?;
            threads.push(handle);
        }

        Ok(Self {
            queue,
            interrupt: Some(interrupt_tx),
            threads,
            kind,
        })
    }

    /// Executor sized to the number of CPUs
    pub fn with_default_threads(kind: WorkerKind) -> std::io::Result<Self> {
        Self::new(num_cpus::get(), kind)
    }

    /// Worker strategy
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Submit a task and return its result future.
    ///
    /// Submitting an already scheduled or finished task only returns the future.
    pub fn submit(&self, task: &Arc<DepsAwareTask<T>>) -> TaskFuture<T> {
        if task.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled) {
            self.schedule(Arc::clone(task));
        }
        task.future()
    }

    /// Submit several tasks, returning their futures in order
    pub fn submit_all<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a Arc<DepsAwareTask<T>>>,
    ) -> Vec<TaskFuture<T>> {
        tasks.into_iter().map(|task| self.submit(task)).collect()
    }

    /// Enqueue a task the caller has already moved to `Scheduled`
    ///
    /// # Panics
    ///
    /// If the task is in any other state.
    #[allow(clippy::panic)]
    pub fn schedule(&self, task: Arc<DepsAwareTask<T>>) {
        assert!(
            task.status() == TaskStatus::Scheduled,
            "task `{}` must be Scheduled before it is enqueued, found {:?}",
            task.name(),
            task.status()
        );
        self.queue.put(task);
    }

    /// Cancel a task that has not started yet; returns whether it was cancelled
    pub fn cancel(&self, task: &Arc<DepsAwareTask<T>>) -> bool {
        match task.cancel() {
            Some(dependents) => {
                debug!(task = task.name(), "Cancelled task");
                for dependent in dependents {
                    if dependent.release_pending() {
                        self.queue.put(dependent);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Interrupt the workers and join them.
    ///
    /// Tasks currently running finish; queued tasks are left untouched.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.interrupt.take().is_none() {
            return;
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
        debug!("Deps-aware executor shut down");
    }
}

impl<T> Drop for DepsAwareExecutor<T> {
    fn drop(&mut self) {
        // Disconnecting the interrupt channel stops idle workers; don't block on busy ones.
        drop(self.interrupt.take());
    }
}
