//! Movable byte buffers with an observable moved sentinel.
//!
//! A [`Movable`] is a shared handle to an optional heap allocation of bytes.
//! Ownership of the payload can be taken out of the handle with [`take`],
//! typically to move it across a thread boundary without copying. While the
//! payload is out, every clone of the handle observes length zero and reports
//! [`is_moved`]; a payload put back with [`restore`] becomes visible through
//! every clone again.
//!
//! [`take`]: Movable::take
//! [`is_moved`]: Movable::is_moved
//! [`restore`]: Movable::restore
//!
//! # Examples
//!
//! ```
//! use conveyor_bytes::Movable;
//!
//! let buffer = Movable::from_vec(vec![1u8, 2, 3, 4]);
//! let alias = buffer.clone();
//!
//! // Take the payload, e.g. to send it to another thread.
//! let payload = buffer.take().unwrap();
//! assert_eq!(payload, vec![1u8, 2, 3, 4]);
//!
//! // Both handles now observe the moved sentinel.
//! assert!(buffer.is_moved());
//! assert_eq!(alias.len(), 0);
//!
//! // Returning the payload makes it visible through every handle.
//! alias.restore(payload);
//! assert!(!buffer.is_moved());
//! assert_eq!(buffer.len(), 4);
//! ```
#![forbid(missing_docs)]

use std::sync::{Arc, Mutex};

/// A shared handle to an optional heap byte payload.
///
/// Cloning shares the payload slot; taking the payload out of any clone
/// leaves the moved sentinel behind in all of them. The handle is `Send` and
/// `Sync`, but the intended discipline is single ownership of the payload:
/// at most one side of a thread boundary holds the bytes at a time.
pub struct Movable {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Movable {
    /// Creates a handle owning the supplied bytes.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Movable { slot: Arc::new(Mutex::new(Some(bytes))) }
    }

    /// Creates a handle owning `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Movable::from_vec(vec![0u8; len])
    }

    /// Creates a handle already in the moved state.
    ///
    /// Used when adopting a transfer whose payload is elsewhere: the handle
    /// stands in for the slot until a payload is restored into it.
    pub fn vacant() -> Self {
        Movable { slot: Arc::new(Mutex::new(None)) }
    }

    /// The payload length, or zero if the payload has been moved out.
    pub fn len(&self) -> usize {
        self.slot.lock().expect("poisoned buffer slot").as_ref().map_or(0, Vec::len)
    }

    /// True when the payload is absent or has length zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the payload has been moved out and not yet restored.
    pub fn is_moved(&self) -> bool {
        self.slot.lock().expect("poisoned buffer slot").is_none()
    }

    /// Moves the payload out of the handle, leaving the moved sentinel.
    ///
    /// Returns `None` if the payload is already out, so that two parties
    /// racing for ownership resolve to exactly one winner.
    pub fn take(&self) -> Option<Vec<u8>> {
        self.slot.lock().expect("poisoned buffer slot").take()
    }

    /// Puts a payload back into the handle.
    ///
    /// The payload need not be the one taken out; the handle represents a
    /// storage slot, not particular bytes. Restoring over a present payload
    /// replaces it.
    pub fn restore(&self, bytes: Vec<u8>) {
        *self.slot.lock().expect("poisoned buffer slot") = Some(bytes);
    }

    /// Copies the current payload out, leaving the handle untouched.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.slot.lock().expect("poisoned buffer slot").clone()
    }

    /// True when both handles name the same payload slot.
    pub fn same_as(&self, other: &Movable) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Applies `action` to the payload bytes, if present.
    pub fn with_bytes<R>(&self, action: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.slot.lock().expect("poisoned buffer slot").as_deref().map(action)
    }

    /// Applies `action` to the mutable payload bytes, if present.
    pub fn with_bytes_mut<R>(&self, action: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.slot.lock().expect("poisoned buffer slot").as_deref_mut().map(action)
    }
}

impl Clone for Movable {
    fn clone(&self) -> Self {
        Movable { slot: Arc::clone(&self.slot) }
    }
}

impl std::fmt::Debug for Movable {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_moved() {
            fmt.write_str("Movable(<moved>)")
        }
        else {
            write!(fmt, "Movable({} bytes)", self.len())
        }
    }
}

#[cfg(test)]
mod tests {

    use super::Movable;

    #[test]
    fn take_leaves_sentinel_in_all_clones() {
        let buffer = Movable::from_vec(vec![7u8; 16]);
        let alias = buffer.clone();
        assert_eq!(alias.len(), 16);
        let payload = alias.take().expect("payload present");
        assert_eq!(payload.len(), 16);
        assert!(buffer.is_moved());
        assert!(alias.is_moved());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn second_take_loses_the_race() {
        let buffer = Movable::from_vec(vec![0u8; 8]);
        assert!(buffer.take().is_some());
        assert!(buffer.take().is_none());
    }

    #[test]
    fn restore_is_visible_through_clones() {
        let buffer = Movable::zeroed(4);
        let alias = buffer.clone();
        let payload = buffer.take().expect("payload present");
        alias.restore(payload);
        assert!(!buffer.is_moved());
        assert_eq!(buffer.snapshot(), Some(vec![0u8; 4]));
    }

    #[test]
    fn identity_distinguishes_equal_payloads() {
        let one = Movable::from_vec(vec![1u8, 2, 3]);
        let two = Movable::from_vec(vec![1u8, 2, 3]);
        assert!(one.same_as(&one.clone()));
        assert!(!one.same_as(&two));
    }

    #[test]
    fn mutation_through_one_handle_is_shared() {
        let buffer = Movable::zeroed(3);
        let alias = buffer.clone();
        alias.with_bytes_mut(|bytes| bytes[1] = 9);
        assert_eq!(buffer.snapshot(), Some(vec![0u8, 9, 0]));
    }
}
