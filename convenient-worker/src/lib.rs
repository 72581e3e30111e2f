//! Persistent worker processes and their pools
//!
//! Some tools (compiler daemons, linters with warm caches) are far cheaper to
//! keep running than to restart per action. This crate runs them as long-lived
//! processes and feeds them jobs over a small line-oriented protocol:
//!
//! - [`WorkerProcess`]: a process accepting jobs, with [`DefaultWorkerProcess`]
//!   launching a command and speaking [`JsonLineProtocol`]
//! - [`WorkerProcessPool`]: a fixed number of slots handing out exclusive
//!   [`BorrowedWorkerProcess`] leases, restarting dead processes transparently

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

mod error;
mod pool;
mod process;
mod protocol;

pub use error::{WorkerError, WorkerResult};
pub use pool::{BorrowedWorkerProcess, StartWorkerProcess, WorkerProcessPool};
pub use process::{DefaultWorkerProcess, WorkerJobResult, WorkerProcess, WorkerProcessParams};
pub use protocol::{CommandSender, JsonLineProtocol, PROTOCOL_VERSION, WorkerCommand};
