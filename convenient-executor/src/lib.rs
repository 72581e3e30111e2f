//! Dependency-aware parallel task executor
//!
//! Tasks declare their prerequisites and dependencies through lazily evaluated
//! suppliers. A fixed pool of worker threads evaluates them, making sure that:
//! - every task body runs at most once, however many parents share it
//! - prerequisites complete before the dependency supplier is called
//! - dependencies complete before the task body runs
//! - a failed prerequisite or dependency fails its dependents
//!
//! # Example
//!
//! ```
//! use convenient_executor::{DepsAwareExecutor, DepsAwareTask, DepsSupplier, WorkerKind};
//! use std::sync::Arc;
//!
//! let executor = DepsAwareExecutor::new(2, WorkerKind::Default).unwrap();
//! let leaf = DepsAwareTask::of("leaf", || Ok(1u32));
//! let leaf2 = Arc::clone(&leaf);
//! let root = DepsAwareTask::new("root", || Ok(2u32), DepsSupplier::deps(move || Ok(vec![leaf2])));
//!
//! assert_eq!(futures::executor::block_on(executor.submit(&root)).unwrap(), 2);
//! executor.close();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

mod executor;
mod task;
mod worker;

pub use executor::DepsAwareExecutor;
pub use task::{
    BoxError, DepsAwareTask, DepsSupplier, SharedError, TaskError, TaskFuture, TaskResult, TaskStatus,
};
pub use worker::{DepsAwareWorker, WorkQueue, WorkerKind};
