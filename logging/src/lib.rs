//! Named, typed event streams for the conveyor crates.
//!
//! Each subsystem publishes its events on a stream opened through a
//! [`Registry`]: the pipeline on `"pipeline"`, the pool on `"pool"`. Opening
//! a stream yields a [`Logger`] handle; any number of further handles can be
//! fetched by name and type, and all of them feed the same stream.
//!
//! Delivery is batched. A stream buffers up to its capacity and then hands
//! the whole batch, owned, to its action; capacity zero turns buffering off
//! and delivers every event as it is logged (useful in tests and for
//! low-rate streams). Whatever is still buffered when the last handle drops
//! is delivered then, so no event is lost by forgetting a final
//! [`flush`](Logger::flush).

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// The shared interior of one stream.
struct Stream<T> {
    /// Receives each drained batch, with a stamp no later than any event the
    /// stream could deliver next.
    action: Box<dyn FnMut(Duration, Vec<(Duration, T)>)>,
    buffer: Vec<(Duration, T)>,
    /// Buffered events before delivery; zero delivers immediately.
    capacity: usize,
}

impl<T> Stream<T> {
    fn deliver(&mut self, at: Duration) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        (self.action)(at, batch);
    }
}

impl<T> Drop for Stream<T> {
    fn drop(&mut self) {
        // Final delivery, stamped with the last event seen.
        let at = self.buffer.last().map(|(at, _)| *at).unwrap_or_default();
        self.deliver(at);
    }
}

/// Opens streams and hands out [`Logger`]s by name and event type.
///
/// The registry does not hold loggers; it holds the streams themselves and
/// builds a fresh handle for every [`get`](Registry::get). All timestamps
/// are durations since the registry's start instant.
pub struct Registry {
    start: Instant,
    streams: HashMap<String, Box<dyn Any>>,
}

impl Registry {
    /// A registry stamping events relative to `start`.
    pub fn new(start: Instant) -> Self {
        Registry {
            start,
            streams: HashMap::new(),
        }
    }

    /// Opens a stream and returns its first handle.
    ///
    /// Events buffer until `capacity` of them are pending, then the batch is
    /// handed to `action`; a capacity of zero delivers each event as it is
    /// logged. Re-opening a name replaces the stream for future `get`s,
    /// while handles to the old stream keep it (and its action) alive.
    pub fn open<T: 'static>(
        &mut self,
        name: &str,
        capacity: usize,
        action: impl FnMut(Duration, Vec<(Duration, T)>) + 'static,
    ) -> Logger<T> {
        let stream = Rc::new(RefCell::new(Stream {
            action: Box::new(action),
            buffer: Vec::new(),
            capacity,
        }));
        self.streams.insert(name.to_owned(), Box::new(Rc::clone(&stream)));
        Logger { start: self.start, stream }
    }

    /// A new handle on the stream under `name`, if one of type `T` is open.
    pub fn get<T: 'static>(&self, name: &str) -> Option<Logger<T>> {
        let stream = self.streams.get(name)?.downcast_ref::<Rc<RefCell<Stream<T>>>>()?;
        Some(Logger { start: self.start, stream: Rc::clone(stream) })
    }

    /// Closes the stream under `name`.
    ///
    /// Outstanding handles keep logging; the stream's remaining buffer is
    /// delivered when the last of them drops.
    pub fn close(&mut self, name: &str) -> bool {
        self.streams.remove(name).is_some()
    }

    /// Delivers the pending batch of the stream under `name`, if one of
    /// type `T` is open.
    pub fn flush<T: 'static>(&self, name: &str) -> bool {
        match self.get::<T>(name) {
            Some(logger) => {
                logger.flush();
                true
            }
            None => false,
        }
    }
}

/// A handle on one event stream.
///
/// Handles are cheap to clone and may outlive the registry entry; the
/// stream lives as long as any handle does.
pub struct Logger<T> {
    start: Instant,
    stream: Rc<RefCell<Stream<T>>>,
}

impl<T> Logger<T> {
    /// Logs one event, stamped now.
    ///
    /// Delivery may happen during this call (the stream reached capacity,
    /// or buffering is off) or later, at a flush or the final drop.
    pub fn log(&self, event: T) {
        let at = self.start.elapsed();
        let mut stream = self.stream.borrow_mut();
        stream.buffer.push((at, event));
        if stream.buffer.len() >= stream.capacity {
            stream.deliver(at);
        }
    }

    /// Delivers the pending batch, stamped now.
    pub fn flush(&self) {
        self.stream.borrow_mut().deliver(self.start.elapsed());
    }
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Logger {
            start: self.start,
            stream: Rc::clone(&self.stream),
        }
    }
}

#[cfg(test)]
mod tests {

    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    use super::Registry;

    fn sink<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl FnMut(std::time::Duration, Vec<(std::time::Duration, T)>)) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let writer = Rc::clone(&seen);
        let action = move |_at, batch: Vec<(std::time::Duration, T)>| {
            writer.borrow_mut().extend(batch.into_iter().map(|(_, event)| event));
        };
        (seen, action)
    }

    #[test]
    fn unbuffered_streams_deliver_immediately() {
        let (seen, action) = sink::<u32>();
        let mut registry = Registry::new(Instant::now());
        let logger = registry.open("numbers", 0, action);
        logger.log(3);
        logger.log(5);
        assert_eq!(&*seen.borrow(), &[3, 5]);
    }

    #[test]
    fn buffered_streams_deliver_at_capacity() {
        let (seen, action) = sink::<u32>();
        let mut registry = Registry::new(Instant::now());
        let logger = registry.open("numbers", 2, action);
        logger.log(1);
        assert!(seen.borrow().is_empty());
        logger.log(2);
        assert_eq!(&*seen.borrow(), &[1, 2]);
        logger.log(3);
        logger.flush();
        assert_eq!(&*seen.borrow(), &[1, 2, 3]);
    }

    #[test]
    fn handles_feed_one_stream() {
        let (seen, action) = sink::<u32>();
        let mut registry = Registry::new(Instant::now());
        registry.open("numbers", 0, action);

        let one = registry.get::<u32>("numbers").expect("stream open");
        let two = one.clone();
        one.log(7);
        two.log(8);
        assert_eq!(&*seen.borrow(), &[7, 8]);
    }

    #[test]
    fn get_is_typed() {
        let mut registry = Registry::new(Instant::now());
        registry.open::<u32>("numbers", 0, |_, _| {});
        assert!(registry.get::<u32>("numbers").is_some());
        assert!(registry.get::<String>("numbers").is_none());
        assert!(registry.get::<u32>("letters").is_none());
    }

    #[test]
    fn dropping_the_last_handle_delivers_the_rest() {
        let (seen, action) = sink::<u32>();
        let mut registry = Registry::new(Instant::now());
        let logger = registry.open("numbers", 16, action);
        logger.log(9);
        assert!(seen.borrow().is_empty());

        registry.close("numbers");
        assert!(seen.borrow().is_empty(), "a live handle keeps the stream open");
        drop(logger);
        assert_eq!(&*seen.borrow(), &[9]);
    }
}
