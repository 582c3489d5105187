//! Pool event types, published on the `"pool"` logging stream.

use serde::Serialize;

/// Events describing the life of a worker pool.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A worker finished a task and its back-transfer was applied.
    WorkerDone {
        /// The completing worker.
        worker_index: usize,
        /// The task's configured name, when tagged.
        task: String,
    },
    /// The pool shut its workers down.
    Terminated,
    /// A worker raised a fatal error.
    Fault {
        /// The failing worker.
        worker_index: usize,
        /// The worker-side message.
        message: String,
    },
}
