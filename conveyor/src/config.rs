//! Declarative pipeline configuration.
//!
//! A [`Config`] maps task names to [`TaskSpec`]s: the command to run, the
//! argument list, and two flags. Dependencies between tasks are expressed
//! with placeholders — [`result_of`] and friends in argument positions, and
//! the deferred/await command forms — from which the pipeline derives its
//! dependency graph. The configuration is immutable for the pipeline's
//! lifetime.

use std::collections::BTreeMap;

use conveyor_codec::Value;

/// What a task invokes.
#[derive(Clone, Debug)]
pub enum Command {
    /// A dotted callable name, resolved through the lookup bases.
    Path(String),
    /// Call method `then` with the result of `dep` as receiver. `by_ref`
    /// passes the result as a moved reference instead of a copy.
    Deferred {
        /// The task whose result becomes the receiver.
        dep: String,
        /// The method name, resolved with the receiver as first base.
        then: String,
        /// Pass the receiver as a moved reference.
        by_ref: bool,
    },
    /// Call `then` only after `dep` has completed; the result is not
    /// consumed. This is the only place an await dependency can appear.
    After {
        /// The task to wait for.
        dep: String,
        /// The callable to run afterwards.
        then: String,
    },
}

impl Command {
    /// The callable name this command resolves to at dispatch time.
    pub fn method(&self) -> &str {
        match self {
            Command::Path(name) => name,
            Command::Deferred { then, .. } => then,
            Command::After { then, .. } => then,
        }
    }

    /// The ordering dependency this command induces, if any, together with
    /// whether it consumes the dependency's result by value.
    pub(crate) fn dependency(&self) -> Option<(&str, bool)> {
        match self {
            Command::Path(_) => None,
            Command::Deferred { dep, by_ref, .. } => Some((dep, !by_ref)),
            Command::After { dep, .. } => Some((dep, false)),
        }
    }
}

/// One argument position of a task.
#[derive(Clone, Debug)]
pub enum Arg {
    /// A plain value.
    Plain(Value),
    /// The result of another task, optionally projected through a dotted
    /// path into the result value.
    Deferred {
        /// The task whose result substitutes for this argument.
        dep: String,
        /// A dotted projection into the result, if any.
        then: Option<String>,
        /// Pass the result as a moved reference instead of a copy.
        by_ref: bool,
    },
    /// Late static binding: resolved from the process-wide variables at
    /// execution time.
    Variable(String),
    /// The slot into which the pipeline injects a completion callback.
    Async,
}

impl From<Value> for Arg {
    fn from(value: Value) -> Arg {
        Arg::Plain(value)
    }
}
impl From<bool> for Arg {
    fn from(value: bool) -> Arg {
        Arg::Plain(Value::Bool(value))
    }
}
impl From<i64> for Arg {
    fn from(value: i64) -> Arg {
        Arg::Plain(Value::Int(value))
    }
}
impl From<f64> for Arg {
    fn from(value: f64) -> Arg {
        Arg::Plain(Value::Float(value))
    }
}
impl From<&str> for Arg {
    fn from(value: &str) -> Arg {
        Arg::Plain(Value::Str(value.to_owned()))
    }
}

/// The argument is the result of task `dep`, received as a copy.
pub fn result_of(dep: &str) -> Arg {
    Arg::Deferred { dep: dep.to_owned(), then: None, by_ref: false }
}

/// The argument is a dotted projection into the result of task `dep`.
pub fn result_path_of(dep: &str, then: &str) -> Arg {
    Arg::Deferred { dep: dep.to_owned(), then: Some(then.to_owned()), by_ref: false }
}

/// The argument is the result of task `dep`, received as a moved reference.
pub fn ref_result_of(dep: &str) -> Arg {
    Arg::Deferred { dep: dep.to_owned(), then: None, by_ref: true }
}

/// The argument is resolved from a process-wide variable at execution time.
pub fn variable(name: &str) -> Arg {
    Arg::Variable(name.to_owned())
}

/// Marks the slot receiving the injected completion callback.
pub fn async_slot() -> Arg {
    Arg::Async
}

/// The description of one task.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub(crate) command: Command,
    pub(crate) args: Vec<Arg>,
    pub(crate) preserve_result_copy: bool,
    pub(crate) no_multithreading: bool,
}

impl TaskSpec {
    /// A task invoking the callable at `path`.
    pub fn new(path: &str) -> Self {
        TaskSpec::with_command(Command::Path(path.to_owned()))
    }

    /// A task invoking method `then` on the result of task `dep`.
    pub fn on_result(dep: &str, then: &str) -> Self {
        TaskSpec::with_command(Command::Deferred {
            dep: dep.to_owned(),
            then: then.to_owned(),
            by_ref: false,
        })
    }

    /// Like [`on_result`](TaskSpec::on_result), but the receiver is passed
    /// as a moved reference.
    pub fn on_result_ref(dep: &str, then: &str) -> Self {
        TaskSpec::with_command(Command::Deferred {
            dep: dep.to_owned(),
            then: then.to_owned(),
            by_ref: true,
        })
    }

    /// A task invoking `then` once task `dep` has completed, without
    /// consuming its result.
    pub fn after(dep: &str, then: &str) -> Self {
        TaskSpec::with_command(Command::After { dep: dep.to_owned(), then: then.to_owned() })
    }

    /// A task with an explicit command.
    pub fn with_command(command: Command) -> Self {
        TaskSpec {
            command,
            args: Vec::new(),
            preserve_result_copy: false,
            no_multithreading: false,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I: IntoIterator<Item = Arg>>(mut self, args: I) -> Self {
        self.args.extend(args);
        self
    }

    /// Keeps the stored result alive even once every dependant has finished.
    pub fn preserve_result_copy(mut self) -> Self {
        self.preserve_result_copy = true;
        self
    }

    /// Forces inline (controller-thread) execution.
    pub fn no_multithreading(mut self) -> Self {
        self.no_multithreading = true;
        self
    }

    /// The command.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The ordering dependencies of this task, in declaration order
    /// (command first, then argument positions), each with whether the
    /// result is consumed by value.
    pub(crate) fn dependencies(&self) -> Vec<(&str, bool)> {
        let mut dependencies = Vec::new();
        if let Some(dependency) = self.command.dependency() {
            dependencies.push(dependency);
        }
        for arg in &self.args {
            if let Arg::Deferred { dep, by_ref, .. } = arg {
                dependencies.push((dep, !by_ref));
            }
        }
        dependencies
    }
}

/// An immutable mapping from task names to their descriptions.
#[derive(Clone, Debug, Default)]
pub struct Config {
    specs: BTreeMap<String, TaskSpec>,
}

impl Config {
    /// An empty configuration.
    pub fn new() -> Self {
        Config::default()
    }

    /// Adds a task description, replacing any previous one under `name`.
    pub fn task(mut self, name: &str, spec: TaskSpec) -> Self {
        self.specs.insert(name.to_owned(), spec);
        self
    }

    /// The description under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.specs.get(name)
    }

    /// True when a task with this name is configured.
    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// The task names and descriptions, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskSpec)> {
        self.specs.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// The number of configured tasks.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True when no tasks are configured.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {

    use conveyor_codec::Value;
    use super::{result_of, variable, Arg, Command, Config, TaskSpec};

    #[test]
    fn specs_collect_dependencies_in_order() {
        let spec = TaskSpec::on_result("producer", "refine")
            .arg(Value::Int(1))
            .arg(result_of("extra"))
            .arg(variable("gain"));
        let dependencies = spec.dependencies();
        assert_eq!(dependencies, vec![("producer", true), ("extra", true)]);
    }

    #[test]
    fn await_dependencies_are_not_by_value() {
        let spec = TaskSpec::after("setup", "go");
        assert_eq!(spec.dependencies(), vec![("setup", false)]);
        assert_eq!(spec.command().method(), "go");
    }

    #[test]
    fn plain_arguments_convert_from_values() {
        let spec = TaskSpec::new("f").arg(3i64).arg("text");
        assert!(matches!(&spec.args[0], Arg::Plain(Value::Int(3))));
        assert!(matches!(&spec.args[1], Arg::Plain(Value::Str(_))));
    }

    #[test]
    fn configs_are_name_ordered() {
        let config = Config::new()
            .task("beta", TaskSpec::new("f"))
            .task("alpha", TaskSpec::new("g"));
        let names: Vec<_> = config.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(matches!(config.get("alpha").unwrap().command(), Command::Path(path) if path == "g"));
    }
}
