//! The pipeline scheduler.
//!
//! A [`Pipeline`] compiles its configuration into a dependency graph and
//! executes it one [`process`](Pipeline::process) call at a time. Each call
//! owns an execution context with a private, shrinking copy of the graph:
//! the current leaves (tasks whose dependencies have all finished) are
//! admitted to a FIFO queue, dispatched either inline or onto the worker
//! pool, and their results stored and routed to dependants until the target
//! task completes.
//!
//! The controller is single-threaded and event-driven: it never blocks
//! except to park between events. Progress is made by pumping —
//! [`step_or_park`](Pipeline::step_or_park) handles one completion,
//! [`run`](Pipeline::run) pumps until no context remains active, and
//! [`process_blocking`](Pipeline::process_blocking) wraps both for the
//! common call-and-wait case.

use std::cell::{RefCell, RefMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use regex::Regex;

use conveyor_codec::{CodecRegistry, Value};
use conveyor_logging as logging;
use conveyor_pool::logging::PoolEvent;
use conveyor_pool::{CallTarget, Completed, Pool, Registry, Task, TaskTag};

use crate::config::{Arg, Command, Config};
use crate::graph::{Graph, Vertex};
use crate::logging::PipelineEvent;
use crate::Error;

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(0);

/// A completion delivered to the scheduler.
enum SchedEvent {
    Finished {
        context: usize,
        name: String,
        result: Value,
        worker: Option<usize>,
    },
}

struct FinishedTask {
    name: String,
    result: Value,
    worker: Option<usize>,
}

/// Per-`process()` state.
struct Context {
    /// Private copy of the dependency graph; finished vertices are removed.
    graph: Graph,
    /// Admitted task names, FIFO; retained until the task finishes.
    queue: VecDeque<String>,
    /// Admitted tasks currently dispatched.
    in_flight: HashSet<String>,
    /// Finished task names.
    finished: HashSet<String>,
    /// Stored results, keyed by task name.
    results: HashMap<String, Value>,
    /// Dependants left to finish per stored result.
    remaining: HashMap<String, usize>,
    target: String,
    callback: Option<Box<dyn FnOnce(Value)>>,
    stop: Arc<AtomicBool>,
}

/// A handle on one `process()` call.
pub struct ExecutionHandle {
    index: usize,
    stop: Arc<AtomicBool>,
}

impl ExecutionHandle {
    /// Requests cancellation; observed at the context's next scheduling
    /// step. In-flight tasks are not interrupted, their results are
    /// discarded.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// The context's slot index, as carried in events.
    pub fn context(&self) -> usize {
        self.index
    }
}

/// Configures and builds a [`Pipeline`].
pub struct PipelineBuilder {
    config: Config,
    registry: Arc<Registry>,
    codecs: Option<Arc<CodecRegistry>>,
    workers: Option<usize>,
    pooled: bool,
    lookup: Option<Vec<String>>,
    no_multithread: Vec<Regex>,
    logging: Option<Rc<RefCell<logging::Registry>>>,
}

impl PipelineBuilder {
    fn new(config: Config, registry: Arc<Registry>) -> Self {
        PipelineBuilder {
            config,
            registry,
            codecs: None,
            workers: None,
            pooled: true,
            lookup: None,
            no_multithread: default_filters(),
            logging: None,
        }
    }

    /// Uses a custom codec registry (and thereby marker key).
    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// Sets the worker count; the default is the number of CPUs.
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = Some(count);
        self.pooled = count > 0;
        self
    }

    /// Runs every task inline on the controller thread; no pool is spawned.
    pub fn single_threaded(mut self) -> Self {
        self.pooled = false;
        self
    }

    /// Default lookup bases handed to the workers.
    pub fn lookup(mut self, bases: Vec<String>) -> Self {
        self.lookup = Some(bases);
        self
    }

    /// Adds a method-name pattern that forces inline execution.
    pub fn no_multithread(mut self, pattern: Regex) -> Self {
        self.no_multithread.push(pattern);
        self
    }

    /// Uses a pre-built logging registry, so streams opened before the
    /// build (notably `"pool"`) are observed from the start.
    pub fn logging(mut self, registry: Rc<RefCell<logging::Registry>>) -> Self {
        self.logging = Some(registry);
        self
    }

    /// Builds the pipeline, spawning the worker pool unless disabled.
    pub fn build(self) -> Result<Pipeline, Error> {
        let codecs = self.codecs.unwrap_or_else(|| Arc::new(CodecRegistry::new()));
        let logging = self
            .logging
            .unwrap_or_else(|| Rc::new(RefCell::new(logging::Registry::new(Instant::now()))));
        let pool = if self.pooled {
            let logger = logging.borrow().get::<PoolEvent>("pool");
            Some(Pool::new(
                Arc::clone(&self.registry),
                Arc::clone(&codecs),
                self.workers,
                self.lookup.clone(),
                logger,
            )?)
        } else {
            None
        };
        let (events, events_rx) = mpsc::channel();
        Ok(Pipeline {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            config: self.config,
            registry: self.registry,
            codecs,
            pool,
            template: None,
            contexts: Vec::new(),
            events,
            events_rx,
            no_multithread: self.no_multithread,
            logging,
            dump: None,
            terminated: false,
        })
    }
}

/// Method names that must not leave the controller thread: GPU-suffixed
/// callables and UI-bound namespaces.
fn default_filters() -> Vec<Regex> {
    vec![
        Regex::new("(?i)gpu$").expect("static pattern compiles"),
        Regex::new(r"^(ui|dom)\.").expect("static pattern compiles"),
    ]
}

/// A task-graph processing pipeline over a pool of worker threads.
pub struct Pipeline {
    id: u64,
    config: Config,
    registry: Arc<Registry>,
    codecs: Arc<CodecRegistry>,
    pool: Option<Pool>,
    /// The dependency graph compiled from the configuration, with weights.
    /// Built lazily, cached, never mutated; contexts clone it.
    template: Option<Graph>,
    contexts: Vec<Option<Context>>,
    events: Sender<SchedEvent>,
    events_rx: Receiver<SchedEvent>,
    no_multithread: Vec<Regex>,
    logging: Rc<RefCell<logging::Registry>>,
    dump: Option<Box<dyn Fn(&str, &Value)>>,
    terminated: bool,
}

impl Pipeline {
    /// Starts configuring a pipeline.
    pub fn builder(config: Config, registry: Arc<Registry>) -> PipelineBuilder {
        PipelineBuilder::new(config, registry)
    }

    /// A pipeline with default settings: a pool sized to the CPU count,
    /// built-in codecs, default no-multithread filters.
    pub fn new(config: Config, registry: Arc<Registry>) -> Result<Pipeline, Error> {
        Pipeline::builder(config, registry).build()
    }

    /// Access to the named logging streams.
    pub fn log_register(&self) -> RefMut<logging::Registry> {
        self.logging.borrow_mut()
    }

    /// Installs a hook invoked with every finished task's name and result.
    pub fn set_dump_hook(&mut self, hook: impl Fn(&str, &Value) + 'static) {
        self.dump = Some(Box::new(hook));
    }

    /// Begins processing `target`: builds an execution context over a fresh
    /// copy of the dependency graph and runs the first scheduling step.
    ///
    /// The `callback` fires once, with the target's result, when it
    /// completes. Progress requires pumping ([`step_or_park`], [`run`]).
    ///
    /// [`step_or_park`]: Pipeline::step_or_park
    /// [`run`]: Pipeline::run
    pub fn process(
        &mut self,
        target: &str,
        callback: impl FnOnce(Value) + 'static,
    ) -> Result<ExecutionHandle, Error> {
        if self.terminated {
            return Err(Error::Terminated);
        }
        if !self.config.contains(target) {
            return Err(Error::Configuration(format!(
                "target task `{}` is not configured",
                target
            )));
        }
        self.ensure_template()?;

        let graph = self.template.as_ref().expect("template just built").clone();
        let stop = Arc::new(AtomicBool::new(false));
        let context = Context {
            graph,
            queue: VecDeque::new(),
            in_flight: HashSet::new(),
            finished: HashSet::new(),
            results: HashMap::new(),
            remaining: HashMap::new(),
            target: target.to_owned(),
            callback: Some(Box::new(callback)),
            stop: Arc::clone(&stop),
        };
        let index = match self.contexts.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                self.contexts.push(None);
                self.contexts.len() - 1
            }
        };
        self.contexts[index] = Some(context);
        self.schedule_step(index, None)?;
        Ok(ExecutionHandle { index, stop })
    }

    /// Processes `target` to completion and returns its result.
    pub fn process_blocking(&mut self, target: &str) -> Result<Value, Error> {
        let slot = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        let handle = self.process(target, move |result| {
            *sink.borrow_mut() = Some(result);
        })?;
        while slot.borrow().is_none() {
            if self.contexts[handle.index].is_none() {
                // The context ended without reaching the target.
                return Err(Error::Terminated);
            }
            self.step_or_park(None)?;
        }
        let result = slot.borrow_mut().take().expect("result stored by the callback");
        Ok(result)
    }

    /// Handles one pending completion, if any, without parking.
    pub fn step(&mut self) -> Result<bool, Error> {
        self.step_or_park(Some(Duration::ZERO))
    }

    /// Handles one completion, parking up to `timeout` (indefinitely for
    /// `None`) until one arrives. Returns whether any context remains
    /// active.
    pub fn step_or_park(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        if self.terminated {
            return Err(Error::Terminated);
        }
        if !self.is_active() {
            return Ok(false);
        }

        // Inline async completions first, then the pool, both non-blocking.
        if let Ok(event) = self.events_rx.try_recv() {
            self.deliver(event)?;
            return Ok(self.is_active());
        }
        if let Some(pool) = &mut self.pool {
            if let Some(done) = pool.poll()? {
                self.route(done)?;
                return Ok(self.is_active());
            }
        }

        // Nothing ready: park, splitting the wait between both sources.
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let slice = Duration::from_millis(10);
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(self.is_active());
                    }
                    slice.min(deadline - now)
                }
                None => slice,
            };
            match self.events_rx.recv_timeout(wait) {
                Ok(event) => {
                    self.deliver(event)?;
                    return Ok(self.is_active());
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
            if let Some(pool) = &mut self.pool {
                if let Some(done) = pool.step_or_park(Some(wait))? {
                    self.route(done)?;
                    return Ok(self.is_active());
                }
            }
        }
    }

    /// Pumps completions until no context remains active.
    pub fn run(&mut self) -> Result<(), Error> {
        while self.is_active() {
            self.step_or_park(None)?;
        }
        Ok(())
    }

    /// True while any execution context is active.
    pub fn is_active(&self) -> bool {
        self.contexts.iter().any(Option::is_some)
    }

    /// The worker count, zero when running single-threaded.
    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(0, Pool::workers)
    }

    /// True once [`terminate`](Pipeline::terminate) has run.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Stops the pipeline: tears down the pool and discards every active
    /// context. Results in flight are lost; later calls fail with
    /// [`Error::Terminated`].
    pub fn terminate(&mut self) -> Result<(), Error> {
        if self.terminated {
            return Err(Error::Terminated);
        }
        self.terminated = true;
        if let Some(mut pool) = self.pool.take() {
            pool.terminate();
        }
        for index in 0..self.contexts.len() {
            if self.contexts[index].take().is_some() {
                self.emit(PipelineEvent::ContextTerminated { context: index });
            }
        }
        self.template = None;
        Ok(())
    }

    fn ensure_template(&mut self) -> Result<(), Error> {
        if self.template.is_none() {
            self.template = Some(build_graph(&self.config)?);
        }
        Ok(())
    }

    fn deliver(&mut self, event: SchedEvent) -> Result<(), Error> {
        let SchedEvent::Finished { context, name, result, worker } = event;
        self.schedule_step(context, Some(FinishedTask { name, result, worker }))
    }

    fn route(&mut self, done: Completed) -> Result<(), Error> {
        // Only completions stamped by this pipeline are ours to route.
        let Some(tag) = done.task.tag().cloned() else {
            return Ok(());
        };
        if tag.pipeline != self.id {
            return Ok(());
        }
        self.schedule_step(
            tag.context,
            Some(FinishedTask {
                name: tag.name,
                result: done.result,
                worker: Some(done.worker_index),
            }),
        )
    }

    /// One scheduling step for the context in `index`: record a finished
    /// task, complete or cancel the context, admit the current leaves, and
    /// dispatch every admitted task not yet in flight.
    fn schedule_step(&mut self, index: usize, finished: Option<FinishedTask>) -> Result<(), Error> {
        // Take the context out of its slot so its borrows cannot alias the
        // pool or the template. A completion for a freed slot is stale: the
        // context was stopped, its result is discarded.
        let Some(mut context) = self.contexts.get_mut(index).and_then(Option::take) else {
            return Ok(());
        };

        if self.terminated || context.stop.load(Ordering::Relaxed) {
            self.emit(PipelineEvent::ContextTerminated { context: index });
            return Ok(());
        }

        if let Some(done) = finished {
            context.queue.retain(|queued| queued != &done.name);
            context.in_flight.remove(&done.name);
            context.graph.remove_vertex(&done.name);
            context.finished.insert(done.name.clone());

            self.emit(PipelineEvent::TaskDone {
                name: done.name.clone(),
                context: index,
                worker: done.worker,
            });
            if let Some(dump) = &self.dump {
                dump(&done.name, &done.result);
            }

            let template = self.template.as_ref().expect("graph built before contexts");
            let preserved = self
                .config
                .get(&done.name)
                .is_some_and(|spec| spec.preserve_result_copy);
            let dependants = template
                .get(&done.name)
                .map(|vertex| vertex.in_neighbours().len())
                .unwrap_or(0);
            let is_target = done.name == context.target;
            if dependants > 0 || preserved || is_target {
                context.results.insert(done.name.clone(), done.result);
                context.remaining.insert(done.name.clone(), dependants);
            }

            // Retire results whose last dependant just finished.
            let consumed: Vec<String> = template
                .get(&done.name)
                .map(|vertex| vertex.out_neighbours().to_vec())
                .unwrap_or_default();
            for dep in consumed {
                if let Some(count) = context.remaining.get_mut(&dep) {
                    *count = count.saturating_sub(1);
                    let keep = dep == context.target
                        || self.config.get(&dep).is_some_and(|spec| spec.preserve_result_copy);
                    if *count == 0 && !keep {
                        context.results.remove(&dep);
                    }
                }
            }

            if is_target {
                let result = context
                    .results
                    .get(&context.target)
                    .cloned()
                    .unwrap_or(Value::Null);
                let callback = context.callback.take();
                // Free the slot before the callback runs.
                drop(context);
                if let Some(callback) = callback {
                    callback(result);
                }
                return Ok(());
            }
        }

        // Admission: the leaves of the shrinking graph are the tasks whose
        // dependencies have all finished.
        let leaves = context.graph.leaves().into_iter().map(str::to_owned).collect_vec();
        if leaves.is_empty() && context.queue.is_empty() {
            return Err(Error::Starvation { target: context.target.clone() });
        }
        for leaf in leaves {
            if !context.queue.contains(&leaf) {
                context.queue.push_back(leaf);
            }
        }

        // Selection is FIFO; dispatch everything admitted and not yet in
        // flight (the pool queues what its workers cannot take).
        let runnable = context
            .queue
            .iter()
            .filter(|name| !context.in_flight.contains(*name))
            .cloned()
            .collect_vec();
        for name in runnable {
            self.dispatch(index, &mut context, &name)?;
        }

        self.contexts[index] = Some(context);
        Ok(())
    }

    /// Builds the task for `name` with resolved receiver and arguments and
    /// hands it to the pool or runs it inline.
    fn dispatch(&mut self, index: usize, context: &mut Context, name: &str) -> Result<(), Error> {
        let spec = self
            .config
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("task `{}` is not configured", name)))?;

        let receiver = match &spec.command {
            Command::Deferred { dep, .. } => {
                Some(context.results.get(dep).cloned().ok_or_else(|| {
                    Error::Configuration(format!("result of `{}` is not available", dep))
                })?)
            }
            _ => None,
        };
        let method = spec.command.method().to_owned();

        let mut args = Vec::with_capacity(spec.args.len());
        for arg in &spec.args {
            args.push(match arg {
                Arg::Plain(value) => value.clone(),
                Arg::Deferred { dep, then, .. } => {
                    let stored = context.results.get(dep).ok_or_else(|| {
                        Error::Configuration(format!("result of `{}` is not available", dep))
                    })?;
                    match then {
                        Some(path) => stored.navigate(path).cloned().ok_or_else(|| {
                            Error::Configuration(format!(
                                "result of `{}` has no field at `{}`",
                                dep, path
                            ))
                        })?,
                        None => stored.clone(),
                    }
                }
                Arg::Variable(name) => Value::Variable(name.clone()),
                Arg::Async => Value::AsyncSlot,
            });
        }

        let mut task = Task::new(CallTarget::Path(method.clone()), args);
        if let Some(receiver) = receiver {
            task.set_receiver(receiver);
        }
        task.set_tag(TaskTag {
            pipeline: self.id,
            context: index,
            name: name.to_owned(),
        });

        let pooled = self.pool.is_some()
            && !spec.no_multithreading
            && !self.no_multithread.iter().any(|pattern| pattern.is_match(&method));

        self.emit(PipelineEvent::TaskDispatch { name: name.to_owned(), context: index });
        context.in_flight.insert(name.to_owned());

        if pooled {
            // A result consumed by value by several dependants must survive
            // this dispatch: copy its buffers instead of moving them.
            let template = self.template.as_ref().expect("graph built before contexts");
            for (dep, by_value) in spec.dependencies() {
                if !by_value {
                    continue;
                }
                let weight = template.get(dep).map(Vertex::weight).unwrap_or(0);
                if weight > 1 {
                    if let Some(stored) = context.results.get(dep) {
                        task.remove_movable(stored, &self.codecs);
                    }
                }
            }
            self.pool
                .as_mut()
                .expect("pooled implies a pool")
                .run_task(task)?;
        } else {
            let events = self.events.clone();
            let context_index = index;
            let task_name = name.to_owned();
            task.run(&self.registry, move |result| {
                let _ = events.send(SchedEvent::Finished {
                    context: context_index,
                    name: task_name,
                    result,
                    worker: None,
                });
            })?;
        }
        Ok(())
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(logger) = self.logging.borrow().get::<PipelineEvent>("pipeline") {
            logger.log(event);
        }
    }
}

/// Compiles the configuration into the dependency graph: a vertex per task,
/// an edge per deferred or await dependency, and by-value consumer counts as
/// vertex weights.
fn build_graph(config: &Config) -> Result<Graph, Error> {
    let mut graph = Graph::new();
    for (name, _) in config.iter() {
        graph.add_vertex(name);
    }
    for (name, spec) in config.iter() {
        for (dep, by_value) in spec.dependencies() {
            if !graph.has_vertex(dep) {
                return Err(Error::Configuration(format!(
                    "`{}` is mentioned as a dependency of `{}` but does not have a task description",
                    dep, name
                )));
            }
            graph.add_edge(name, dep);
            if by_value {
                graph.get_mut(dep).expect("vertex checked above").bump_weight();
            }
        }
    }
    for (name, spec) in config.iter() {
        if spec.preserve_result_copy {
            graph.get_mut(name).expect("vertex added above").bump_weight();
        }
    }
    if let Some((from, to)) = graph.find_back_edge() {
        return Err(Error::Cycle { from, to });
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {

    use super::build_graph;
    use crate::config::{result_of, Config, TaskSpec};
    use crate::Error;

    #[test]
    fn graph_edges_follow_dependencies() {
        let config = Config::new()
            .task("source", TaskSpec::new("make"))
            .task("sink", TaskSpec::new("use").arg(result_of("source")));
        let graph = build_graph(&config).unwrap();
        assert!(graph.has_edge("sink", "source"));
        assert_eq!(graph.get("source").unwrap().weight(), 1);
        assert_eq!(graph.leaves(), vec!["source"]);
    }

    #[test]
    fn missing_dependencies_are_configuration_errors() {
        let config = Config::new().task("a", TaskSpec::new("f").arg(result_of("ghost")));
        match build_graph(&config) {
            Err(Error::Configuration(message)) => {
                assert!(message.contains("ghost"));
                assert!(message.contains('a'));
            }
            other => panic!("expected a configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let config = Config::new()
            .task("a", TaskSpec::new("f").arg(result_of("b")))
            .task("b", TaskSpec::new("g").arg(result_of("a")));
        assert!(matches!(build_graph(&config), Err(Error::Cycle { .. })));
    }

    #[test]
    fn preserve_flag_counts_as_a_consumer() {
        let config = Config::new().task("keep", TaskSpec::new("f").preserve_result_copy());
        let graph = build_graph(&config).unwrap();
        assert_eq!(graph.get("keep").unwrap().weight(), 1);
    }

    #[test]
    fn await_edges_do_not_add_weight() {
        let config = Config::new()
            .task("first", TaskSpec::new("f"))
            .task("second", TaskSpec::after("first", "g"));
        let graph = build_graph(&config).unwrap();
        assert!(graph.has_edge("second", "first"));
        assert_eq!(graph.get("first").unwrap().weight(), 0);
    }
}
