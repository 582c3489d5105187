//! The pack/unpack codec registry.

use std::collections::BTreeMap;

use conveyor_bytes::Movable;

use crate::value::Value;
use crate::view::{ArrayView, ViewKind};

/// The default reserved marker key stamped into packed descriptors.
///
/// The marker's value is the codec tag used on the receiving side to select
/// the inverse transform.
pub const MARKER: &str = "_cast_to_original_datatype";

/// A per-type pack/unpack pair.
///
/// Implementations translate one kind of value into a map descriptor (and
/// back) and report the movable buffers embedded in it. The registry stamps
/// and strips the marker key; codecs only see their own fields.
pub trait Codec: Send + Sync {
    /// The type tag stored under the marker key.
    fn tag(&self) -> &'static str;
    /// True when this codec covers `value`.
    fn applies(&self, value: &Value) -> bool;
    /// Translates `value` into descriptor fields.
    fn pack(&self, value: &Value) -> BTreeMap<String, Value>;
    /// Reconstructs a value from descriptor fields, if well-formed.
    fn unpack(&self, fields: BTreeMap<String, Value>) -> Option<Value>;
    /// The movable buffers embedded in `value`.
    fn movables(&self, value: &Value) -> Vec<Movable>;
}

/// An ordered collection of codecs sharing one marker key.
pub struct CodecRegistry {
    marker: String,
    codecs: Vec<Box<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry with the built-in buffer and view codecs and the
    /// [default marker key](MARKER).
    pub fn new() -> Self {
        CodecRegistry::with_marker(MARKER)
    }

    /// A registry with the built-in codecs and a custom marker key.
    pub fn with_marker(marker: &str) -> Self {
        let mut registry = CodecRegistry {
            marker: marker.to_owned(),
            codecs: Vec::new(),
        };
        registry.register(Box::new(BufferCodec));
        registry.register(Box::new(ViewCodec));
        registry
    }

    /// The reserved marker key.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Installs a codec. Later registrations win ties on `applies`.
    pub fn register(&mut self, codec: Box<dyn Codec>) {
        self.codecs.insert(0, codec);
    }

    /// Packs a value for transfer.
    ///
    /// Values covered by a codec become map descriptors stamped with the
    /// marker key; lists and maps are packed element-wise; everything else is
    /// returned as is.
    pub fn pack(&self, value: &Value) -> Value {
        if let Some(codec) = self.codecs.iter().find(|codec| codec.applies(value)) {
            let mut fields = codec.pack(value);
            fields.insert(self.marker.clone(), Value::Str(codec.tag().to_owned()));
            return Value::Map(fields);
        }
        match value {
            Value::List(list) => Value::List(list.iter().map(|element| self.pack(element)).collect()),
            Value::Map(map) => Value::Map(
                map.iter().map(|(key, element)| (key.clone(), self.pack(element))).collect(),
            ),
            other => other.clone(),
        }
    }

    /// Unpacks a transferred value.
    ///
    /// A map carrying the marker key is dispatched to the codec named by the
    /// tag, consuming and stripping the marker; a map without the marker (and
    /// any other value) passes through with its elements unpacked.
    pub fn unpack(&self, value: Value) -> Value {
        match value {
            Value::Map(mut fields) => {
                if let Some(tag) = fields.remove(&self.marker) {
                    let tag = tag.as_str().unwrap_or_default().to_owned();
                    if let Some(codec) = self.codecs.iter().find(|codec| codec.tag() == tag) {
                        if let Some(unpacked) = codec.unpack(fields) {
                            return unpacked;
                        }
                    }
                    // Unknown tag or malformed fields: nothing to restore.
                    return Value::Null;
                }
                Value::Map(
                    fields.into_iter().map(|(key, element)| (key, self.unpack(element))).collect(),
                )
            }
            Value::List(list) => {
                Value::List(list.into_iter().map(|element| self.unpack(element)).collect())
            }
            other => other,
        }
    }

    /// Extracts the movable buffers embedded in `value`, in encounter order,
    /// de-duplicated by slot identity.
    pub fn movables(&self, value: &Value) -> Vec<Movable> {
        let mut found = Vec::new();
        self.collect_movables(value, &mut found);
        found
    }

    fn collect_movables(&self, value: &Value, found: &mut Vec<Movable>) {
        if let Some(codec) = self.codecs.iter().find(|codec| codec.applies(value)) {
            for movable in codec.movables(value) {
                if !found.iter().any(|present| present.same_as(&movable)) {
                    found.push(movable);
                }
            }
            return;
        }
        match value {
            Value::List(list) => {
                for element in list {
                    self.collect_movables(element, found);
                }
            }
            Value::Map(map) => {
                for element in map.values() {
                    self.collect_movables(element, found);
                }
            }
            _ => {}
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::new()
    }
}

/// Raw byte buffers: packed as `{marker, buffer}` with the buffer movable.
struct BufferCodec;

impl Codec for BufferCodec {
    fn tag(&self) -> &'static str {
        "buffer"
    }
    fn applies(&self, value: &Value) -> bool {
        matches!(value, Value::Bytes(_))
    }
    fn pack(&self, value: &Value) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        if let Value::Bytes(buffer) = value {
            fields.insert("buffer".to_owned(), Value::Bytes(buffer.clone()));
        }
        fields
    }
    fn unpack(&self, mut fields: BTreeMap<String, Value>) -> Option<Value> {
        match fields.remove("buffer") {
            Some(Value::Bytes(buffer)) => Some(Value::Bytes(buffer)),
            _ => None,
        }
    }
    fn movables(&self, value: &Value) -> Vec<Movable> {
        value.as_bytes().map(|buffer| vec![buffer.clone()]).unwrap_or_default()
    }
}

/// Numeric array views: packed as `{marker, buffer, kind}` with the
/// underlying buffer movable.
struct ViewCodec;

impl Codec for ViewCodec {
    fn tag(&self) -> &'static str {
        "view"
    }
    fn applies(&self, value: &Value) -> bool {
        matches!(value, Value::View(_))
    }
    fn pack(&self, value: &Value) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        if let Value::View(view) = value {
            fields.insert("buffer".to_owned(), Value::Bytes(view.buffer().clone()));
            fields.insert("kind".to_owned(), Value::Str(view.kind().name().to_owned()));
        }
        fields
    }
    fn unpack(&self, mut fields: BTreeMap<String, Value>) -> Option<Value> {
        let kind = match fields.get("kind") {
            Some(Value::Str(name)) => ViewKind::parse(name)?,
            _ => return None,
        };
        match fields.remove("buffer") {
            Some(Value::Bytes(buffer)) => Some(Value::View(ArrayView::new(kind, buffer))),
            _ => None,
        }
    }
    fn movables(&self, value: &Value) -> Vec<Movable> {
        value.as_view().map(|view| vec![view.buffer().clone()]).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {

    use std::collections::BTreeMap;

    use conveyor_bytes::Movable;

    use crate::value::Value;
    use crate::view::{ArrayView, ViewKind};
    use super::{Codec, CodecRegistry, MARKER};

    #[test]
    fn scalars_pass_through() {
        let registry = CodecRegistry::new();
        assert_eq!(registry.pack(&Value::Int(3)), Value::Int(3));
        assert_eq!(registry.unpack(Value::Str("x".into())), Value::Str("x".into()));
    }

    #[test]
    fn buffer_round_trips_through_marker() {
        let registry = CodecRegistry::new();
        let buffer = Movable::from_vec(vec![9, 8, 7]);
        let packed = registry.pack(&Value::Bytes(buffer.clone()));

        let fields = packed.as_map().expect("packed form is a map");
        assert_eq!(fields.get(MARKER), Some(&Value::Str("buffer".into())));

        let unpacked = registry.unpack(packed);
        assert!(unpacked.as_bytes().expect("bytes back").same_as(&buffer));
    }

    #[test]
    fn view_round_trips_with_kind() {
        let registry = CodecRegistry::new();
        let view = ArrayView::from_elements(ViewKind::F64, &[2.5, 3.5]);
        let unpacked = registry.unpack(registry.pack(&Value::View(view.clone())));
        let back = unpacked.as_view().expect("view back");
        assert_eq!(back.kind(), ViewKind::F64);
        assert!(back.buffer().same_as(view.buffer()));
    }

    #[test]
    fn nested_values_pack_element_wise() {
        let registry = CodecRegistry::new();
        let buffer = Movable::from_vec(vec![1]);
        let value = Value::List(vec![
            Value::Int(1),
            Value::map([("payload".to_owned(), Value::Bytes(buffer.clone()))]),
        ]);
        let unpacked = registry.unpack(registry.pack(&value));
        assert_eq!(unpacked, value);
    }

    #[test]
    fn unmarked_maps_are_unchanged() {
        let registry = CodecRegistry::new();
        let plain = Value::map([("kind".to_owned(), Value::Str("buffer".into()))]);
        assert_eq!(registry.unpack(plain.clone()), plain);
    }

    #[test]
    fn movables_are_deduplicated() {
        let registry = CodecRegistry::new();
        let buffer = Movable::from_vec(vec![1, 2]);
        let view = ArrayView::new(ViewKind::U8, buffer.clone());
        let value = Value::List(vec![Value::Bytes(buffer.clone()), Value::View(view)]);
        let movables = registry.movables(&value);
        assert_eq!(movables.len(), 1);
        assert!(movables[0].same_as(&buffer));
    }

    #[test]
    fn custom_codecs_take_precedence() {
        struct TagCodec;
        impl Codec for TagCodec {
            fn tag(&self) -> &'static str { "tagged" }
            fn applies(&self, value: &Value) -> bool {
                value.as_map().is_some_and(|map| map.contains_key("tagged"))
            }
            fn pack(&self, value: &Value) -> BTreeMap<String, Value> {
                value.as_map().cloned().unwrap_or_default()
            }
            fn unpack(&self, fields: BTreeMap<String, Value>) -> Option<Value> {
                Some(Value::Map(fields))
            }
            fn movables(&self, _value: &Value) -> Vec<Movable> {
                Vec::new()
            }
        }

        let mut registry = CodecRegistry::new();
        registry.register(Box::new(TagCodec));
        let value = Value::map([("tagged".to_owned(), Value::Bool(true))]);
        let packed = registry.pack(&value);
        assert_eq!(
            packed.as_map().expect("map").get(MARKER),
            Some(&Value::Str("tagged".into())),
        );
        assert_eq!(registry.unpack(packed), value);
    }
}
