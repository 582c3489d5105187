//! Dynamic values and the pack/unpack codec layer.
//!
//! Task arguments, receivers and results travel through the system as
//! [`Value`]s: a closed dynamic model covering scalars, containers, movable
//! byte buffers, numeric [`ArrayView`]s over those buffers, named callable
//! references, injected completion callbacks, and the two run-time
//! placeholders (`Variable` and `AsyncSlot`).
//!
//! Crossing a thread boundary, values pass through a [`CodecRegistry`]:
//! `pack` turns codec-covered values into tagged map descriptors stamped with
//! the registry's reserved marker key, `unpack` inverts them on the far side,
//! and `movables` extracts the buffer handles whose payloads the transport
//! should move rather than copy.

pub mod value;
pub mod view;
pub mod registry;

pub use value::{Value, Completion};
pub use view::{ArrayView, ViewKind};
pub use registry::{Codec, CodecRegistry, MARKER};
