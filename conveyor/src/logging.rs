//! Pipeline event types, published on the `"pipeline"` logging stream.

use serde::Serialize;

/// Events describing the life of execution contexts and their tasks.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A task left the admission queue for execution.
    TaskDispatch {
        /// The configured task name.
        name: String,
        /// The owning context's slot index.
        context: usize,
    },
    /// A task finished and its result was stored.
    TaskDone {
        /// The configured task name.
        name: String,
        /// The owning context's slot index.
        context: usize,
        /// The completing worker, `None` for inline execution.
        worker: Option<usize>,
    },
    /// A context ended without reaching its target.
    ContextTerminated {
        /// The context's slot index.
        context: usize,
    },
}
