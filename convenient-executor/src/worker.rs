//! Worker loops that pull tasks from the shared queue
//!
//! Two strategies exist. The default worker re-enqueues a task whose
//! prerequisites or dependencies are not finished yet and yields. The toposort
//! worker instead parks the task on the unfinished tasks and lets the last one
//! to complete put it back into the queue.

use crate::task::{DepsAwareTask, TaskError, TaskStatus, first_failure};
use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

/// How workers wait for unfinished dependencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerKind {
    /// Re-enqueue at the back and yield
    #[default]
    Default,
    /// Park until the last dependency completes
    Toposort,
}

/// Unbounded FIFO of tasks shared by all workers of an executor
pub struct WorkQueue<T> {
    tx: Sender<Arc<DepsAwareTask<T>>>,
    rx: Receiver<Arc<DepsAwareTask<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

impl<T> WorkQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task at the back
    pub fn put(&self, task: Arc<DepsAwareTask<T>>) {
        // Never fails: this queue holds a receiver for as long as it exists.
        let _ = self.tx.send(task);
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// A worker evaluating tasks from a [`WorkQueue`] until interrupted
pub struct DepsAwareWorker<T> {
    kind: WorkerKind,
    queue: WorkQueue<T>,
    interrupt: Receiver<()>,
}

impl<T: Send + Sync + 'static> DepsAwareWorker<T> {
    /// Create a worker. Dropping every sender of `interrupt` stops it.
    pub fn new(kind: WorkerKind, queue: WorkQueue<T>, interrupt: Receiver<()>) -> Self {
        Self {
            kind,
            queue,
            interrupt,
        }
    }

    fn interrupted(&self) -> bool {
        !matches!(self.interrupt.try_recv(), Err(TryRecvError::Empty))
    }

    /// Evaluate tasks until the interrupt channel fires or disconnects
    pub fn loop_until_interrupted(&self) {
        loop {
            if self.interrupted() {
                debug!("Worker interrupted");
                return;
            }
            select! {
                recv(self.interrupt) -> _ => {
                    debug!("Worker interrupted while idle");
                    return;
                }
                recv(self.queue.rx) -> task => match task {
                    Ok(task) => self.eval(&task),
                    Err(_) => return,
                },
            }
        }
    }

    /// Evaluate a single task once
    pub fn eval(&self, task: &Arc<DepsAwareTask<T>>) {
        match self.kind {
            WorkerKind::Default => self.eval_requeue(task),
            WorkerKind::Toposort => self.eval_toposort(task),
        }
    }

    fn eval_requeue(&self, task: &Arc<DepsAwareTask<T>>) {
        if task.status() != TaskStatus::Scheduled {
            return;
        }

        let prereqs = match task.prereqs() {
            Ok(prereqs) => prereqs,
            Err(e) => return self.finish(task, Err(e)),
        };
        if !self.done_or_requeue(task, prereqs) {
            return;
        }

        let deps = match task.deps() {
            Ok(deps) => deps,
            Err(e) => return self.finish(task, Err(e)),
        };
        if !self.done_or_requeue(task, deps) {
            return;
        }

        self.run(task, prereqs, deps);
    }

    fn done_or_requeue(&self, task: &Arc<DepsAwareTask<T>>, waiting_on: &[Arc<DepsAwareTask<T>>]) -> bool {
        let mut all_done = true;
        for dep in waiting_on {
            if !dep.is_done() {
                all_done = false;
                self.schedule_if_new(dep);
            }
        }
        if !all_done {
            trace!(task = task.name(), "Dependencies pending, re-enqueueing");
            self.queue.put(Arc::clone(task));
            thread::yield_now();
        }
        all_done
    }

    fn eval_toposort(&self, task: &Arc<DepsAwareTask<T>>) {
        if task.status() != TaskStatus::Scheduled {
            return;
        }

        let prereqs = match task.prereqs() {
            Ok(prereqs) => prereqs,
            Err(e) => return self.finish(task, Err(e)),
        };
        if !self.done_or_park(task, prereqs) {
            return;
        }

        let deps = match task.deps() {
            Ok(deps) => deps,
            Err(e) => return self.finish(task, Err(e)),
        };
        if !self.done_or_park(task, deps) {
            return;
        }

        self.run(task, prereqs, deps);
    }

    /// Park `task` on every unfinished task in `waiting_on`.
    ///
    /// The pending counter starts at one so the waker that brings it to zero
    /// is unique: either the last finishing dependency or this call.
    fn done_or_park(&self, task: &Arc<DepsAwareTask<T>>, waiting_on: &[Arc<DepsAwareTask<T>>]) -> bool {
        task.reset_pending();
        for dep in waiting_on {
            task.acquire_pending();
            if dep.add_dependent(task) {
                self.schedule_if_new(dep);
            } else {
                let _ = task.release_pending();
            }
        }
        let ready = task.release_pending();
        if !ready {
            trace!(task = task.name(), "Parked on pending dependencies");
        }
        ready
    }

    fn schedule_if_new(&self, dep: &Arc<DepsAwareTask<T>>) {
        if dep.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled) {
            self.queue.put(Arc::clone(dep));
        }
    }

    fn run(
        &self,
        task: &Arc<DepsAwareTask<T>>,
        prereqs: &[Arc<DepsAwareTask<T>>],
        deps: &[Arc<DepsAwareTask<T>>],
    ) {
        if let Some(failure) = first_failure(prereqs).or_else(|| first_failure(deps)) {
            return self.finish(task, Err(failure));
        }
        if !task.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started) {
            return;
        }
        trace!(task = task.name(), "Running task");
        let result = task.call();
        self.wake(task.complete(result));
    }

    /// Complete a task that never reached its work
    fn finish(&self, task: &Arc<DepsAwareTask<T>>, result: Result<T, TaskError>) {
        if task.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started) {
            self.wake(task.complete(result));
        }
    }

    pub(crate) fn wake(&self, dependents: Vec<Arc<DepsAwareTask<T>>>) {
        for dependent in dependents {
            if dependent.release_pending() {
                self.queue.put(dependent);
            }
        }
    }
}
