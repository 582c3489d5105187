//! The unit of work shipped between the controller and workers.

use serde::Serialize;
use smallvec::SmallVec;

use conveyor_bytes::Movable;
use conveyor_codec::{CodecRegistry, Completion, Value};

use crate::lookup::{CallScope, NativeFn, Registry};
use crate::Error;

/// Scheduler annotations carried with a task through transfer, untouched by
/// the pool and the worker.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskTag {
    /// Identifier of the owning pipeline.
    pub pipeline: u64,
    /// Slot index of the owning execution context.
    pub context: usize,
    /// The configured task name.
    pub name: String,
}

/// The callable identity of a task.
#[derive(Clone)]
pub enum CallTarget {
    /// A dotted lookup name, resolvable on either side of the pool.
    Path(String),
    /// A native closure. Runs inline only; shipping it to a worker is a
    /// serialization error.
    Native(NativeFn),
}

impl std::fmt::Debug for CallTarget {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CallTarget::Path(name) => write!(fmt, "Path({name:?})"),
            CallTarget::Native(_) => fmt.write_str("Native(..)"),
        }
    }
}

/// A single callable invocation, with its arguments, optional receiver and
/// lookup list, and the movable buffers embedded in its inputs.
#[derive(Debug)]
pub struct Task {
    target: CallTarget,
    args: Vec<Value>,
    receiver: Option<Value>,
    lookup: Option<Vec<String>>,
    /// Explicit movable list; `None` means auto-detect by walking the
    /// arguments and receiver through the codec registry.
    movables: Option<SmallVec<[Movable; 4]>>,
    /// One-shot exclusions applied to the next transfer.
    excluded: SmallVec<[Movable; 4]>,
    tag: Option<TaskTag>,
}

impl Task {
    /// A task whose movables are auto-detected at transfer time.
    pub fn new(target: CallTarget, args: Vec<Value>) -> Self {
        Task {
            target,
            args,
            receiver: None,
            lookup: None,
            movables: None,
            excluded: SmallVec::new(),
            tag: None,
        }
    }

    /// A task with an explicit movable list.
    pub fn with_movables(target: CallTarget, args: Vec<Value>, movables: Vec<Movable>) -> Self {
        let mut task = Task::new(target, args);
        task.movables = Some(movables.into());
        task
    }

    /// Attaches a receiver for the invocation.
    pub fn set_receiver(&mut self, receiver: Value) {
        self.receiver = Some(receiver);
    }

    /// Attaches an ordered list of named lookup bases.
    pub fn set_lookup(&mut self, lookup: Vec<String>) {
        self.lookup = Some(lookup);
    }

    /// Attaches scheduler annotations.
    pub fn set_tag(&mut self, tag: TaskTag) {
        self.tag = Some(tag);
    }

    /// The scheduler annotations, if any.
    pub fn tag(&self) -> Option<&TaskTag> {
        self.tag.as_ref()
    }

    /// The callable identity.
    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    /// The argument list.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Excludes the buffers embedded in `value` from the *next* transfer.
    ///
    /// Excluded buffers are copied to the worker rather than moved, so they
    /// stay observable in the controller for other consumers. The exclusion
    /// list is cleared when the transfer descriptor is built.
    pub fn remove_movable(&mut self, value: &Value, codecs: &CodecRegistry) {
        for movable in codecs.movables(value) {
            if !self.excluded.iter().any(|present| present.same_as(&movable)) {
                self.excluded.push(movable);
            }
        }
    }

    /// True when any buffer embedded in the arguments or the receiver is
    /// currently moved (observable as the zero-length sentinel).
    pub fn has_moved_buffer(&self, codecs: &CodecRegistry) -> bool {
        self.embedded_movables(codecs).iter().any(Movable::is_empty)
    }

    /// The movable buffers of this task: the explicit list if one was given,
    /// otherwise every buffer embedded in the arguments and receiver.
    fn embedded_movables(&self, codecs: &CodecRegistry) -> SmallVec<[Movable; 4]> {
        if let Some(explicit) = &self.movables {
            return explicit.clone();
        }
        let mut found: SmallVec<[Movable; 4]> = SmallVec::new();
        let receiver = self.receiver.iter();
        for value in self.args.iter().chain(receiver) {
            for movable in codecs.movables(value) {
                if !found.iter().any(|present| present.same_as(&movable)) {
                    found.push(movable);
                }
            }
        }
        found
    }

    /// Builds the transfer descriptor for shipment to a worker.
    ///
    /// Arguments and receiver are packed, the movable list is flattened and
    /// split into moved and copied groups per the one-shot exclusion list,
    /// and the exclusion list is cleared. A native callable cannot be
    /// shipped and fails with [`Error::Serialization`].
    pub fn to_descriptor(&mut self, codecs: &CodecRegistry) -> Result<TaskDescriptor, Error> {
        let target = match &self.target {
            CallTarget::Path(name) => name.clone(),
            CallTarget::Native(_) => {
                return Err(Error::Serialization(
                    "native closures reference compiled code and cannot be shipped".to_owned(),
                ));
            }
        };

        let mut moved = SmallVec::new();
        let mut copied = SmallVec::new();
        for movable in self.embedded_movables(codecs) {
            if self.excluded.iter().any(|excluded| excluded.same_as(&movable)) {
                copied.push(movable);
            } else {
                moved.push(movable);
            }
        }
        self.excluded.clear();

        Ok(TaskDescriptor {
            target,
            args: self.args.iter().map(|arg| codecs.pack(arg)).collect(),
            receiver: self.receiver.as_ref().map(|receiver| codecs.pack(receiver)),
            lookup: self.lookup.clone(),
            moved,
            copied,
            tag: self.tag.clone(),
        })
    }

    /// Reconstructs a task from a received descriptor, unpacking arguments
    /// and receiver.
    pub fn from_descriptor(descriptor: TaskDescriptor, codecs: &CodecRegistry) -> Task {
        let mut task = Task::new(
            CallTarget::Path(descriptor.target),
            descriptor.args.into_iter().map(|arg| codecs.unpack(arg)).collect(),
        );
        if let Some(receiver) = descriptor.receiver {
            task.set_receiver(codecs.unpack(receiver));
        }
        if let Some(lookup) = descriptor.lookup {
            task.set_lookup(lookup);
        }
        if let Some(tag) = descriptor.tag {
            task.set_tag(tag);
        }
        task
    }

    /// Runs the task.
    ///
    /// Late-bound `Variable` arguments are resolved against the registry and
    /// the callable is found through the lookup bases. Without an
    /// `AsyncSlot` marker the callable's return value is the result:
    /// `on_done` is invoked with it once, and it is also returned. With a
    /// marker, a one-shot completion is injected into the marked argument
    /// slots; the callable's synchronous return value is still returned, but
    /// `on_done` fires only when the callable invokes the completion.
    pub fn run(
        &mut self,
        registry: &Registry,
        on_done: impl FnOnce(Value) + Send + 'static,
    ) -> Result<Value, Error> {
        for arg in &mut self.args {
            if let Value::Variable(name) = arg {
                *arg = registry
                    .variable(name)
                    .ok_or_else(|| Error::Lookup(name.clone()))?;
            }
        }

        let deliver = Completion::new(on_done);
        let mut async_mode = false;
        for arg in &mut self.args {
            if matches!(arg, Value::AsyncSlot) {
                *arg = Value::Callback(deliver.clone());
                async_mode = true;
            }
        }

        let (func, receiver, name): (NativeFn, Option<Value>, String) = match &self.target {
            CallTarget::Path(name) => {
                let resolved = registry.resolve(name, self.receiver.as_ref(), self.lookup.as_deref())?;
                let receiver = resolved.receiver.or_else(|| self.receiver.clone());
                (resolved.func, receiver, name.clone())
            }
            CallTarget::Native(func) => {
                (std::sync::Arc::clone(func), self.receiver.clone(), "<native>".to_owned())
            }
        };

        let scope = CallScope { receiver, args: self.args.clone() };
        let sync = func(scope).map_err(|message| Error::Call { name, message })?;

        if !async_mode {
            deliver.call(sync.clone());
        }
        Ok(sync)
    }
}

/// The transfer-ready form of a task.
///
/// Values are packed; the movable buffers are flattened into the `moved`
/// and `copied` groups, whose order defines the payload slot order of the
/// accompanying frame.
#[derive(Debug)]
pub struct TaskDescriptor {
    /// The dotted callable name.
    pub target: String,
    /// Packed arguments.
    pub args: Vec<Value>,
    /// Packed receiver, if any.
    pub receiver: Option<Value>,
    /// Named lookup bases, if any.
    pub lookup: Option<Vec<String>>,
    /// Buffers whose payloads move with the frame.
    pub moved: SmallVec<[Movable; 4]>,
    /// Buffers whose payloads are copied into the frame.
    pub copied: SmallVec<[Movable; 4]>,
    /// Scheduler annotations.
    pub tag: Option<TaskTag>,
}
