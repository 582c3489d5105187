//! Task execution across a pool of isolated worker threads.
//!
//! This crate is the execution layer of the conveyor system. It defines the
//! callable [`lookup`] registry shared between the controller and its
//! workers, the [`Task`](task::Task) unit of work with its transfer
//! descriptor, the wire [`message`] frames exchanged over channels, the
//! [`Pool`](pool::Pool) of named worker threads, and the worker-side
//! [`host`] loop.
//!
//! Workers are plain OS threads with no shared mutable state; the only
//! cross-thread primitive is an `mpsc` channel whose frames move a listed
//! set of buffer payloads. Moving rather than copying makes buffer ownership
//! single-owner across the thread boundary: while a payload is with a
//! worker, the controller observes the moved sentinel, and a second task
//! needing the same buffer waits in the pool's FIFO queue. The pool converts
//! the silent deadlocks this policy could produce into loud
//! [`Error::Stall`] failures.

pub mod lookup;
pub mod task;
pub mod message;
pub mod pool;
pub mod host;
pub mod logging;

pub use lookup::{CallScope, Entry, Namespace, NativeFn, Registry};
pub use task::{CallTarget, Task, TaskDescriptor, TaskTag};
pub use pool::{Completed, Pool};

/// Fatal failures of the execution layer.
///
/// None of these are recoverable: a worker fault or a stall aborts the pool,
/// and the caller is expected to surface the error rather than retry.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Every waiting task carries a moved buffer and no worker is busy.
    #[error("cannot dispatch waiting tasks because they have neutered arguments")]
    Stall,
    /// An operation was attempted on a terminated pool.
    #[error("worker pool already terminated")]
    Terminated,
    /// The task's callable cannot be shipped to a worker.
    #[error("cannot serialize callable for worker shipment: {0}")]
    Serialization(String),
    /// A method or variable name resolved in no lookup base.
    #[error("cannot resolve `{0}` in any lookup base")]
    Lookup(String),
    /// A worker raised an error; the pool is aborted.
    #[error("worker {index} failed running `{task}`: {message}")]
    Worker {
        /// Index of the failing worker.
        index: usize,
        /// Name of the task being run, if known.
        task: String,
        /// The worker-side error message.
        message: String,
    },
    /// A callable returned an error.
    #[error("callable `{name}` failed: {message}")]
    Call {
        /// The resolved callable name.
        name: String,
        /// The callable's error message.
        message: String,
    },
    /// A frame arrived out of protocol.
    #[error("malformed worker frame: {0}")]
    Frame(String),
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),
}
