//! The dynamic value model.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use conveyor_bytes::Movable;

use crate::view::ArrayView;

/// A dynamic value, as carried in task argument lists and results.
///
/// Cloning is shallow for buffers: `Bytes` and `View` clones share the
/// underlying payload slot, so a payload moved to a worker is observable as
/// moved through every clone, wherever it is stored.
#[derive(Clone, Debug)]
pub enum Value {
    /// The absent value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string.
    Str(String),
    /// An ordered list of values.
    List(Vec<Value>),
    /// String-keyed fields.
    Map(BTreeMap<String, Value>),
    /// A raw movable byte buffer.
    Bytes(Movable),
    /// A fixed-width numeric view over a movable byte buffer.
    View(ArrayView),
    /// A reference to a callable, by its dotted lookup name.
    Func(String),
    /// An injected one-shot completion callback.
    Callback(Completion),
    /// Late static binding: resolved by name at execution time.
    Variable(String),
    /// Marks the argument slot receiving an injected completion callback.
    AsyncSlot,
}

impl Value {
    /// A map value from an iterator of fields.
    pub fn map<I: IntoIterator<Item = (String, Value)>>(fields: I) -> Value {
        Value::Map(fields.into_iter().collect())
    }

    /// The integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        if let Value::Int(int) = self { Some(*int) } else { None }
    }

    /// The numeric payload of an `Int` or `Float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(int) => Some(*int as f64),
            Value::Float(float) => Some(*float),
            _ => None,
        }
    }

    /// The string payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        if let Value::Str(string) = self { Some(string) } else { None }
    }

    /// The fields, if this is a `Map`.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        if let Value::Map(map) = self { Some(map) } else { None }
    }

    /// The elements, if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        if let Value::List(list) = self { Some(list) } else { None }
    }

    /// The buffer handle, if this is `Bytes`.
    pub fn as_bytes(&self) -> Option<&Movable> {
        if let Value::Bytes(buffer) = self { Some(buffer) } else { None }
    }

    /// The array view, if this is a `View`.
    pub fn as_view(&self) -> Option<&ArrayView> {
        if let Value::View(view) = self { Some(view) } else { None }
    }

    /// The completion handle, if this is a `Callback`.
    pub fn as_callback(&self) -> Option<&Completion> {
        if let Value::Callback(completion) = self { Some(completion) } else { None }
    }

    /// Navigates nested maps along dot-separated `path` segments.
    ///
    /// An empty path yields `self`.
    pub fn navigate(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.').filter(|segment| !segment.is_empty()) {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Replaces buffer handles throughout the value, by slot identity.
    ///
    /// Every `Bytes` or `View` handle naming the same slot as a left-hand
    /// entry of `swaps` is replaced by a clone of the right-hand handle. Used
    /// when adopting transferred values on the far side of a channel.
    pub fn replace_buffers(&mut self, swaps: &[(Movable, Movable)]) {
        match self {
            Value::Bytes(buffer) => {
                if let Some((_, new)) = swaps.iter().find(|(old, _)| old.same_as(buffer)) {
                    *buffer = new.clone();
                }
            }
            Value::View(view) => view.replace_buffer(swaps),
            Value::List(list) => {
                for element in list.iter_mut() {
                    element.replace_buffers(swaps);
                }
            }
            Value::Map(map) => {
                for element in map.values_mut() {
                    element.replace_buffers(swaps);
                }
            }
            _ => {}
        }
    }
}

/// Structural equality on observable fields.
///
/// Buffers compare by payload snapshot (two moved buffers are equal),
/// callbacks by handle identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) | (AsyncSlot, AsyncSlot) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Bytes(a), Bytes(b)) => a.snapshot() == b.snapshot(),
            (View(a), View(b)) => a.kind() == b.kind() && a.buffer().snapshot() == b.buffer().snapshot(),
            (Func(a), Func(b)) => a == b,
            (Callback(a), Callback(b)) => a.same_as(b),
            (Variable(a), Variable(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value { Value::Bool(value) }
}
impl From<i64> for Value {
    fn from(value: i64) -> Value { Value::Int(value) }
}
impl From<i32> for Value {
    fn from(value: i32) -> Value { Value::Int(value as i64) }
}
impl From<f64> for Value {
    fn from(value: f64) -> Value { Value::Float(value) }
}
impl From<&str> for Value {
    fn from(value: &str) -> Value { Value::Str(value.to_owned()) }
}
impl From<String> for Value {
    fn from(value: String) -> Value { Value::Str(value) }
}
impl From<Movable> for Value {
    fn from(value: Movable) -> Value { Value::Bytes(value) }
}
impl From<ArrayView> for Value {
    fn from(value: ArrayView) -> Value { Value::View(value) }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Value {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

/// A shareable one-shot completion callback.
///
/// The pipeline injects one of these into the argument slot marked
/// [`Value::AsyncSlot`]; the callable is expected to invoke it exactly once
/// with its final result. The handle is `Send`, so a callable may hand it to
/// another thread and return early.
pub struct Completion {
    action: Arc<Mutex<Option<Box<dyn FnOnce(Value) + Send>>>>,
}

impl Completion {
    /// Creates a handle around a one-shot action.
    pub fn new(action: impl FnOnce(Value) + Send + 'static) -> Self {
        Completion { action: Arc::new(Mutex::new(Some(Box::new(action)))) }
    }

    /// Invokes the completion with `result`.
    ///
    /// Returns false if the completion had already fired; the result is then
    /// dropped.
    pub fn call(&self, result: Value) -> bool {
        let action = self.action.lock().expect("poisoned completion slot").take();
        match action {
            Some(action) => { action(result); true }
            None => false,
        }
    }

    /// True once the completion has fired.
    pub fn fired(&self) -> bool {
        self.action.lock().expect("poisoned completion slot").is_none()
    }

    /// True when both handles name the same completion.
    pub fn same_as(&self, other: &Completion) -> bool {
        Arc::ptr_eq(&self.action, &other.action)
    }
}

impl Clone for Completion {
    fn clone(&self) -> Self {
        Completion { action: Arc::clone(&self.action) }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "Completion({})", if self.fired() { "fired" } else { "pending" })
    }
}

#[cfg(test)]
mod tests {

    use conveyor_bytes::Movable;
    use super::{Value, Completion};

    #[test]
    fn navigate_walks_nested_maps() {
        let value = Value::map([
            ("outer".to_owned(), Value::map([
                ("inner".to_owned(), Value::Int(3)),
            ])),
        ]);
        assert_eq!(value.navigate("outer.inner"), Some(&Value::Int(3)));
        assert_eq!(value.navigate(""), Some(&value));
        assert_eq!(value.navigate("outer.missing"), None);
    }

    #[test]
    fn clones_share_buffer_slots() {
        let buffer = Movable::from_vec(vec![1, 2, 3]);
        let value = Value::Bytes(buffer.clone());
        let copy = value.clone();
        buffer.take();
        assert!(copy.as_bytes().expect("bytes").is_moved());
    }

    #[test]
    fn replace_buffers_rewrites_nested_handles() {
        let old = Movable::from_vec(vec![1]);
        let new = Movable::from_vec(vec![2]);
        let mut value = Value::List(vec![Value::Bytes(old.clone()), Value::Int(0)]);
        value.replace_buffers(&[(old, new.clone())]);
        assert!(value.as_list().expect("list")[0].as_bytes().expect("bytes").same_as(&new));
    }

    #[test]
    fn completion_fires_once() {
        let completion = Completion::new(|result| assert_eq!(result, Value::Int(42)));
        assert!(!completion.fired());
        assert!(completion.call(Value::Int(42)));
        assert!(!completion.call(Value::Int(43)));
        assert!(completion.fired());
    }
}
