//! Worker process errors

use thiserror::Error;

/// Errors raised by worker processes and their pools
#[derive(Debug, Error)]
pub enum WorkerError {
    /// I/O with the process failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The process could not be started
    #[error("Failed to start worker process `{command}`: {source}")]
    Spawn {
        /// Command line that was run
        command: String,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// The startup command is empty
    #[error("Worker process has no command to run")]
    EmptyCommand,

    /// A line was not valid protocol JSON
    #[error("Malformed protocol message: {0}")]
    Json(#[from] serde_json::Error),

    /// The process broke the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A response carried the wrong message id
    #[error("Expected a response to message {expected}, got message {actual}")]
    UnexpectedMessageId {
        /// Id of the outstanding request
        expected: u64,
        /// Id found in the response
        actual: u64,
    },

    /// The process closed stdout mid-conversation
    #[error("Worker process closed its output stream")]
    ProcessExited,

    /// No slot became free in time
    #[error("Timed out waiting for a worker process")]
    BorrowTimeout,

    /// The pool was closed
    #[error("Worker process pool is closed")]
    PoolClosed,

    /// Leases were outstanding when the pool closed
    #[error("{outstanding} of {capacity} worker processes were still leased when the pool closed")]
    PoolStillInUse {
        /// Leases not yet returned
        outstanding: usize,
        /// Pool capacity
        capacity: usize,
    },
}

/// Result alias for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
