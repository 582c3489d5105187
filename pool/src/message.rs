//! Frames exchanged between the controller and its workers.
//!
//! Buffer payloads travel alongside the values that reference them: the
//! descriptor's movable lists define the slot order, and the payload vectors
//! are parallel to them. A `None` payload means the slot's bytes were
//! elsewhere at capture time (already moved, or consumed by the callable);
//! the receiving side adopts such slots in the moved state.

use std::sync::Arc;

use conveyor_bytes::Movable;
use conveyor_codec::{CodecRegistry, Value};

use crate::lookup::Registry;
use crate::task::TaskDescriptor;

/// One-time worker initialisation.
pub struct InitFrame {
    /// The worker's index among its peers.
    pub worker_index: usize,
    /// The shared codec registry (carries the reserved marker key).
    pub codecs: Arc<CodecRegistry>,
    /// The shared callable/variable registry.
    pub registry: Arc<Registry>,
    /// Default lookup bases for tasks that carry none.
    pub lookup: Option<Vec<String>>,
}

/// Controller → worker.
pub enum ToWorker {
    /// Must be the first frame a worker receives.
    Init(InitFrame),
    /// One task to run.
    Run(TaskFrame),
    /// Orderly shutdown.
    Stop,
}

/// A task descriptor with its buffer payloads.
pub struct TaskFrame {
    /// The transfer-ready task.
    pub descriptor: TaskDescriptor,
    /// Payloads for `descriptor.moved`, taken from the controller handles.
    pub moved_payloads: Vec<Option<Vec<u8>>>,
    /// Payloads for `descriptor.copied`, snapshots of the controller handles.
    pub copied_payloads: Vec<Option<Vec<u8>>>,
}

/// Worker → controller.
pub enum FromWorker {
    /// A completed task with its result and back-transfer.
    Done(ResultFrame),
    /// A fatal worker-side failure.
    Fault(FaultFrame),
}

/// A completed task.
///
/// `slots` lists the worker-side handles whose payloads are being returned,
/// de-duplicated by identity: the first `input_count` entries are the task's
/// own moved inputs in dispatch order (the automatic back-transfer), the
/// rest are buffers created by the result.
pub struct ResultFrame {
    /// The completing worker.
    pub worker_index: usize,
    /// The packed result value.
    pub result: Value,
    /// Returned buffer handles, in payload slot order.
    pub slots: Vec<Movable>,
    /// The payloads, parallel to `slots`.
    pub payloads: Vec<Option<Vec<u8>>>,
    /// How many leading slots are task inputs.
    pub input_count: usize,
}

/// A worker-side failure, surfaced as fatal by the pool.
pub struct FaultFrame {
    /// The failing worker.
    pub worker_index: usize,
    /// The task being run, when known.
    pub task: Option<String>,
    /// The failure message.
    pub message: String,
}
