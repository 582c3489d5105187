//! A task-graph processing pipeline with a multithreaded worker pool.
//!
//! A declarative [`Config`] names tasks and the data dependencies between
//! them; the [`Pipeline`] compiles it into a directed acyclic [`Graph`] and
//! executes the tasks across a pool of isolated worker threads, respecting
//! both data-flow order and the single-owner semantics of movable byte
//! buffers (a buffer moved to a worker is observable as moved until its
//! payload returns; the pool serialises tasks contending for it and turns
//! unsatisfiable waits into loud stall errors).
//!
//! The code is organized in crates that depend as little as possible on
//! each other: `conveyor_bytes` (movable buffers), `conveyor_codec`
//! (dynamic values and pack/unpack codecs), `conveyor_logging` (typed event
//! streams), `conveyor_pool` (callable lookup, tasks, the worker pool), and
//! this crate (graph and scheduler).
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use conveyor::{result_of, Config, Pipeline, Registry, TaskSpec, Value};
//!
//! // The callables tasks can name.
//! let registry = Arc::new(Registry::new());
//! registry.install("id", |scope| Ok(scope.arg(0).clone()));
//! registry.install("add", |scope| {
//!     let a = scope.arg(0).as_int().unwrap_or(0);
//!     let b = scope.arg(1).as_int().unwrap_or(0);
//!     Ok(Value::Int(a + b))
//! });
//!
//! // "sum" consumes the result of "start".
//! let config = Config::new()
//!     .task("start", TaskSpec::new("id").arg(10i64))
//!     .task("sum", TaskSpec::new("add").arg(result_of("start")).arg(5i64));
//!
//! let mut pipeline = Pipeline::builder(config, registry)
//!     .single_threaded()
//!     .build()
//!     .unwrap();
//! let result = pipeline.process_blocking("sum").unwrap();
//! assert_eq!(result, Value::Int(15));
//! ```

#![forbid(missing_docs)]

pub mod config;
pub mod graph;
pub mod logging;
pub mod pipeline;

pub use config::{
    async_slot, ref_result_of, result_of, result_path_of, variable, Arg, Command, Config, TaskSpec,
};
pub use graph::{Dfs, EdgeKind, Graph, Vertex, Visit};
pub use pipeline::{ExecutionHandle, Pipeline, PipelineBuilder};

pub use conveyor_bytes::Movable;
pub use conveyor_codec::{ArrayView, CodecRegistry, Completion, Value, ViewKind};
pub use conveyor_pool::{CallScope, CallTarget, Pool, Registry, Task};

/// Fatal pipeline failures.
///
/// Every error aborts the operation that produced it; the pipeline makes no
/// recovery attempt. Execution-layer failures (stalls, worker faults,
/// lookup and serialization errors) arrive wrapped as [`Error::Pool`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration is malformed: a dependency without a task
    /// description, or a missing target.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The dependency graph contains a back edge.
    #[error("cyclic dependency: `{from}` depends on `{to}` which is already waiting on it")]
    Cycle {
        /// The source of the back edge.
        from: String,
        /// The destination of the back edge.
        to: String,
    },
    /// A scheduling step found no ready and no in-flight work before the
    /// target was reached.
    #[error("pipeline starved before reaching `{target}`: no ready and no in-flight work")]
    Starvation {
        /// The target of the starved context.
        target: String,
    },
    /// An operation was attempted after [`Pipeline::terminate`].
    #[error("pipeline already terminated")]
    Terminated,
    /// A failure in the execution layer.
    #[error(transparent)]
    Pool(#[from] conveyor_pool::Error),
}
