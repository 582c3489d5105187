//! Name resolution for task callables.
//!
//! Callables are not shipped between threads; both sides of the pool share a
//! [`Registry`] of named functions and resolve dotted paths against it at
//! execution time. Resolution walks an ordered list of bases: the task's
//! receiver value first (a map whose member names a callable), then any
//! named namespaces from the task's lookup list, then the registry root.
//! A lazy namespace accessor is invoked with no arguments and resolution
//! retried on its result, which accommodates namespaces that are expensive
//! to build or only needed on some workers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use conveyor_codec::Value;

use crate::Error;

/// The signature of a registered callable.
///
/// Callables receive their receiver and resolved arguments through a
/// [`CallScope`] and report failure as a message; the pool treats a failing
/// callable as fatal.
pub type NativeFn = Arc<dyn Fn(CallScope) -> Result<Value, String> + Send + Sync>;

/// The receiver and arguments of one invocation.
pub struct CallScope {
    /// The bound receiver, if any.
    pub receiver: Option<Value>,
    /// The resolved argument list.
    pub args: Vec<Value>,
}

impl CallScope {
    /// The argument at `index`, or `Null` when absent.
    pub fn arg(&self, index: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.args.get(index).unwrap_or(&NULL)
    }
}

/// One name in a namespace.
pub enum Entry {
    /// A callable.
    Func(NativeFn),
    /// A nested namespace.
    Namespace(Namespace),
    /// A lazy namespace accessor: invoked with no arguments on demand, and
    /// resolution retried on the returned namespace.
    Lazy(Arc<dyn Fn() -> Namespace + Send + Sync>),
}

/// A flat map of names to entries.
#[derive(Default)]
pub struct Namespace {
    entries: HashMap<String, Entry>,
}

impl Namespace {
    /// An empty namespace.
    pub fn new() -> Self {
        Namespace::default()
    }

    /// Inserts an entry under a single-segment name.
    pub fn insert(&mut self, name: &str, entry: Entry) {
        self.entries.insert(name.to_owned(), entry);
    }

    /// Installs an entry under a dotted path, creating intermediate
    /// namespaces as needed. An existing non-namespace intermediate is
    /// replaced.
    fn install(&mut self, segments: &[&str], entry: Entry) {
        match segments {
            [] => {}
            [name] => {
                self.entries.insert((*name).to_owned(), entry);
            }
            [head, rest @ ..] => {
                let child = self
                    .entries
                    .entry((*head).to_owned())
                    .and_modify(|existing| {
                        if !matches!(existing, Entry::Namespace(_)) {
                            *existing = Entry::Namespace(Namespace::new());
                        }
                    })
                    .or_insert_with(|| Entry::Namespace(Namespace::new()));
                if let Entry::Namespace(namespace) = child {
                    namespace.install(rest, entry);
                }
            }
        }
    }

    /// Resolves a dotted path to a callable within this namespace.
    fn resolve(&self, segments: &[&str]) -> Option<NativeFn> {
        let (head, rest) = segments.split_first()?;
        match self.entries.get(*head)? {
            Entry::Func(func) => {
                if rest.is_empty() { Some(Arc::clone(func)) } else { None }
            }
            Entry::Namespace(namespace) => {
                if rest.is_empty() { None } else { namespace.resolve(rest) }
            }
            Entry::Lazy(provider) => {
                // Second chance: materialize the namespace and retry.
                if rest.is_empty() { None } else { provider().resolve(rest) }
            }
        }
    }
}

/// What a successful resolution produced.
pub struct Resolved {
    /// The callable.
    pub func: NativeFn,
    /// A receiver binding imposed by the resolution, when the callable was
    /// found through the receiver base (bound to the terminal's immediate
    /// parent).
    pub receiver: Option<Value>,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("func", &"<native fn>")
            .field("receiver", &self.receiver)
            .finish()
    }
}

/// The process-wide registry of callables and variables.
///
/// One registry is shared (behind an `Arc`) between the controller and every
/// worker; registration is expected to happen before work is dispatched, but
/// the locks make later registration safe as well.
pub struct Registry {
    root: RwLock<Namespace>,
    variables: RwLock<HashMap<String, Value>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Registry {
            root: RwLock::new(Namespace::new()),
            variables: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a callable under a dotted path.
    pub fn install(
        &self,
        path: &str,
        func: impl Fn(CallScope) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        let segments: Vec<&str> = path.split('.').collect();
        self.root
            .write()
            .expect("poisoned registry")
            .install(&segments, Entry::Func(Arc::new(func)));
    }

    /// Registers a lazy namespace accessor under a dotted path.
    pub fn install_lazy(
        &self,
        path: &str,
        provider: impl Fn() -> Namespace + Send + Sync + 'static,
    ) {
        let segments: Vec<&str> = path.split('.').collect();
        self.root
            .write()
            .expect("poisoned registry")
            .install(&segments, Entry::Lazy(Arc::new(provider)));
    }

    /// Sets a process-wide variable for late static binding.
    pub fn set_variable(&self, name: &str, value: Value) {
        self.variables
            .write()
            .expect("poisoned registry")
            .insert(name.to_owned(), value);
    }

    /// Reads a process-wide variable.
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables.read().expect("poisoned registry").get(name).cloned()
    }

    /// Resolves a dotted callable name against the ordered lookup bases.
    ///
    /// Bases are tried in order: the `receiver` value, each namespace named
    /// in `lookup` (itself a dotted path from the root), then the root
    /// namespace. Failure to resolve is fatal.
    pub fn resolve(
        &self,
        name: &str,
        receiver: Option<&Value>,
        lookup: Option<&[String]>,
    ) -> Result<Resolved, Error> {
        let segments: Vec<&str> = name.split('.').collect();

        // Receiver base: the terminal names a callable member, bound to its
        // immediate parent.
        if let Some(receiver) = receiver {
            if let Some(resolved) = self.resolve_in_receiver(receiver, &segments) {
                return Ok(resolved);
            }
        }

        let root = self.root.read().expect("poisoned registry");

        // Named bases from the task's lookup list.
        for base in lookup.unwrap_or(&[]) {
            let mut path: Vec<&str> = base.split('.').filter(|s| !s.is_empty()).collect();
            path.extend(&segments);
            if let Some(func) = root.resolve(&path) {
                return Ok(Resolved { func, receiver: None });
            }
        }

        // The process-wide root.
        if let Some(func) = root.resolve(&segments) {
            return Ok(Resolved { func, receiver: None });
        }

        Err(Error::Lookup(name.to_owned()))
    }

    fn resolve_in_receiver(&self, receiver: &Value, segments: &[&str]) -> Option<Resolved> {
        let mut parent = receiver;
        for segment in &segments[..segments.len() - 1] {
            parent = parent.as_map()?.get(*segment)?;
        }
        let terminal = parent.as_map()?.get(*segments.last()?)?;
        if let Value::Func(inner) = terminal {
            let inner_segments: Vec<&str> = inner.split('.').collect();
            let func = self.root.read().expect("poisoned registry").resolve(&inner_segments)?;
            return Some(Resolved { func, receiver: Some(parent.clone()) });
        }
        None
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
