//! Fixed-width numeric array views over movable byte buffers.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use conveyor_bytes::Movable;

/// The element type of an [`ArrayView`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Unsigned 8-bit elements.
    U8,
    /// Signed 8-bit elements.
    I8,
    /// Unsigned 16-bit elements.
    U16,
    /// Signed 16-bit elements.
    I16,
    /// Unsigned 32-bit elements.
    U32,
    /// Signed 32-bit elements.
    I32,
    /// 32-bit floating point elements.
    F32,
    /// 64-bit floating point elements.
    F64,
}

impl ViewKind {
    /// The element width in bytes.
    pub fn width(self) -> usize {
        match self {
            ViewKind::U8 | ViewKind::I8 => 1,
            ViewKind::U16 | ViewKind::I16 => 2,
            ViewKind::U32 | ViewKind::I32 | ViewKind::F32 => 4,
            ViewKind::F64 => 8,
        }
    }

    /// The kind's wire name, as stored in packed descriptors.
    pub fn name(self) -> &'static str {
        match self {
            ViewKind::U8 => "u8",
            ViewKind::I8 => "i8",
            ViewKind::U16 => "u16",
            ViewKind::I16 => "i16",
            ViewKind::U32 => "u32",
            ViewKind::I32 => "i32",
            ViewKind::F32 => "f32",
            ViewKind::F64 => "f64",
        }
    }

    /// Parses a wire name back into a kind.
    pub fn parse(name: &str) -> Option<ViewKind> {
        match name {
            "u8" => Some(ViewKind::U8),
            "i8" => Some(ViewKind::I8),
            "u16" => Some(ViewKind::U16),
            "i16" => Some(ViewKind::I16),
            "u32" => Some(ViewKind::U32),
            "i32" => Some(ViewKind::I32),
            "f32" => Some(ViewKind::F32),
            "f64" => Some(ViewKind::F64),
            _ => None,
        }
    }
}

/// A typed view over a movable byte buffer.
///
/// Elements are stored little-endian. The view holds a handle to (not a copy
/// of) the buffer, so moving the buffer's payload to a worker is observable
/// through the view, and element access on a moved view yields `None`.
#[derive(Clone, Debug)]
pub struct ArrayView {
    kind: ViewKind,
    buffer: Movable,
}

impl ArrayView {
    /// Wraps a buffer handle in a typed view.
    pub fn new(kind: ViewKind, buffer: Movable) -> Self {
        ArrayView { kind, buffer }
    }

    /// Allocates a view over a fresh zeroed buffer of `len` elements.
    pub fn zeroed(kind: ViewKind, len: usize) -> Self {
        ArrayView::new(kind, Movable::zeroed(len * kind.width()))
    }

    /// Builds a view from numeric elements, narrowing to the element type.
    pub fn from_elements(kind: ViewKind, elements: &[f64]) -> Self {
        let mut bytes = vec![0u8; elements.len() * kind.width()];
        for (index, element) in elements.iter().enumerate() {
            write_element(kind, &mut bytes, index, *element);
        }
        ArrayView::new(kind, Movable::from_vec(bytes))
    }

    /// The element kind.
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// The underlying buffer handle.
    pub fn buffer(&self) -> &Movable {
        &self.buffer
    }

    /// The element count, or zero while the buffer is moved.
    pub fn len(&self) -> usize {
        self.buffer.len() / self.kind.width()
    }

    /// True when no elements are observable.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the element at `index`, widened to `f64`.
    pub fn get(&self, index: usize) -> Option<f64> {
        let kind = self.kind;
        self.buffer
            .with_bytes(|bytes| {
                if (index + 1) * kind.width() <= bytes.len() {
                    Some(read_element(kind, bytes, index))
                } else {
                    None
                }
            })
            .flatten()
    }

    /// Writes `element` at `index`, narrowing from `f64`.
    ///
    /// Returns false when the buffer is moved or `index` is out of range.
    pub fn set(&self, index: usize, element: f64) -> bool {
        let kind = self.kind;
        self.buffer
            .with_bytes_mut(|bytes| {
                if (index + 1) * kind.width() <= bytes.len() {
                    write_element(kind, bytes, index, element);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false)
    }

    /// Reads every element, widened to `f64`.
    pub fn to_elements(&self) -> Option<Vec<f64>> {
        let kind = self.kind;
        self.buffer.with_bytes(|bytes| {
            (0..bytes.len() / kind.width())
                .map(|index| read_element(kind, bytes, index))
                .collect()
        })
    }

    /// Replaces the underlying buffer handle if it matches a swap entry.
    pub(crate) fn replace_buffer(&mut self, swaps: &[(Movable, Movable)]) {
        if let Some((_, new)) = swaps.iter().find(|(old, _)| old.same_as(&self.buffer)) {
            self.buffer = new.clone();
        }
    }
}

fn read_element(kind: ViewKind, bytes: &[u8], index: usize) -> f64 {
    let at = index * kind.width();
    match kind {
        ViewKind::U8 => bytes[at] as f64,
        ViewKind::I8 => bytes[at] as i8 as f64,
        ViewKind::U16 => LittleEndian::read_u16(&bytes[at..]) as f64,
        ViewKind::I16 => LittleEndian::read_i16(&bytes[at..]) as f64,
        ViewKind::U32 => LittleEndian::read_u32(&bytes[at..]) as f64,
        ViewKind::I32 => LittleEndian::read_i32(&bytes[at..]) as f64,
        ViewKind::F32 => LittleEndian::read_f32(&bytes[at..]) as f64,
        ViewKind::F64 => LittleEndian::read_f64(&bytes[at..]),
    }
}

fn write_element(kind: ViewKind, bytes: &mut [u8], index: usize, element: f64) {
    let at = index * kind.width();
    match kind {
        ViewKind::U8 => bytes[at] = element as u8,
        ViewKind::I8 => bytes[at] = element as i8 as u8,
        ViewKind::U16 => LittleEndian::write_u16(&mut bytes[at..], element as u16),
        ViewKind::I16 => LittleEndian::write_i16(&mut bytes[at..], element as i16),
        ViewKind::U32 => LittleEndian::write_u32(&mut bytes[at..], element as u32),
        ViewKind::I32 => LittleEndian::write_i32(&mut bytes[at..], element as i32),
        ViewKind::F32 => LittleEndian::write_f32(&mut bytes[at..], element as f32),
        ViewKind::F64 => LittleEndian::write_f64(&mut bytes[at..], element),
    }
}

#[cfg(test)]
mod tests {

    use super::{ArrayView, ViewKind};

    #[test]
    fn elements_round_trip() {
        let view = ArrayView::from_elements(ViewKind::F32, &[1.5, -2.0, 0.25]);
        assert_eq!(view.len(), 3);
        assert_eq!(view.get(1), Some(-2.0));
        assert_eq!(view.to_elements(), Some(vec![1.5, -2.0, 0.25]));
    }

    #[test]
    fn integer_kinds_narrow() {
        let view = ArrayView::from_elements(ViewKind::I16, &[300.0, -7.0]);
        assert_eq!(view.to_elements(), Some(vec![300.0, -7.0]));
        assert!(view.set(0, 12.0));
        assert_eq!(view.get(0), Some(12.0));
    }

    #[test]
    fn moved_view_has_no_elements() {
        let view = ArrayView::from_elements(ViewKind::F64, &[3.25]);
        view.buffer().take();
        assert_eq!(view.len(), 0);
        assert_eq!(view.get(0), None);
        assert!(!view.set(0, 1.0));
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            ViewKind::U8, ViewKind::I8, ViewKind::U16, ViewKind::I16,
            ViewKind::U32, ViewKind::I32, ViewKind::F32, ViewKind::F64,
        ] {
            assert_eq!(ViewKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(ViewKind::parse("f16"), None);
    }
}
