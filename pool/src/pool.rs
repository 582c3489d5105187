//! The controller-side worker pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use conveyor_bytes::Movable;
use conveyor_codec::{CodecRegistry, Value};
use conveyor_logging::Logger;

use crate::host;
use crate::logging::PoolEvent;
use crate::lookup::Registry;
use crate::message::{FromWorker, InitFrame, ResultFrame, TaskFrame, ToWorker};
use crate::task::Task;
use crate::Error;

/// A task that finished on a worker, with its back-transfer already applied.
pub struct Completed {
    /// The dispatched task, handed back for result routing.
    pub task: Task,
    /// The unpacked result value.
    pub result: Value,
    /// The worker that ran the task.
    pub worker_index: usize,
}

struct InFlight {
    task: Task,
    /// The moved group's controller-side handles, in dispatch order; the
    /// back-transfer restores payloads into exactly these.
    originals: Vec<Movable>,
}

/// A fixed set of isolated worker threads with a FIFO wait queue.
///
/// Admission dispatches a task to an idle worker only when none of its
/// buffers is currently moved; otherwise the task waits. Each completion
/// returns the task's buffers, re-scans the queue, and checks for the stall
/// condition in which every waiting task holds a moved buffer while no
/// worker is busy — a deadlock under single-owner buffer semantics, surfaced
/// as [`Error::Stall`].
pub struct Pool {
    codecs: Arc<CodecRegistry>,
    senders: Vec<Sender<ToWorker>>,
    busy: Vec<Option<InFlight>>,
    queue: VecDeque<Task>,
    receiver: Receiver<FromWorker>,
    guards: Vec<JoinHandle<()>>,
    logger: Option<Logger<PoolEvent>>,
    terminated: bool,
}

impl Pool {
    /// Spawns `workers` worker threads (default: the number of CPUs) and
    /// sends each its one-time init frame.
    pub fn new(
        registry: Arc<Registry>,
        codecs: Arc<CodecRegistry>,
        workers: Option<usize>,
        lookup: Option<Vec<String>>,
        logger: Option<Logger<PoolEvent>>,
    ) -> Result<Pool, Error> {
        let count = workers.unwrap_or_else(num_cpus::get).max(1);
        let (result_sender, result_receiver) = mpsc::channel();

        let mut senders = Vec::with_capacity(count);
        let mut guards = Vec::with_capacity(count);
        for index in 0..count {
            let (sender, receiver) = mpsc::channel();
            let results = result_sender.clone();
            let guard = std::thread::Builder::new()
                .name(format!("worker thread {}", index))
                .spawn(move || host::worker_main(receiver, results))
                .map_err(Error::Spawn)?;
            sender
                .send(ToWorker::Init(InitFrame {
                    worker_index: index,
                    codecs: Arc::clone(&codecs),
                    registry: Arc::clone(&registry),
                    lookup: lookup.clone(),
                }))
                .map_err(|_| Error::Frame(format!("worker {} hung up during init", index)))?;
            senders.push(sender);
            guards.push(guard);
        }

        Ok(Pool {
            codecs,
            senders,
            busy: (0..count).map(|_| None).collect(),
            queue: VecDeque::new(),
            receiver: result_receiver,
            guards,
            logger,
            terminated: false,
        })
    }

    /// Admits a task, FIFO.
    ///
    /// Dispatches immediately when a worker is idle and none of the task's
    /// buffers is moved; otherwise the task joins the wait queue.
    pub fn run_task(&mut self, task: Task) -> Result<(), Error> {
        if self.terminated {
            return Err(Error::Terminated);
        }
        if let Some(index) = self.idle_worker() {
            if !task.has_moved_buffer(&self.codecs) {
                return self.dispatch(index, task);
            }
        }
        self.queue.push_back(task);
        // Nothing in flight means nothing will ever return a buffer.
        if self.busy.iter().all(Option::is_none) {
            self.check_stall()?;
        }
        Ok(())
    }

    /// Handles one completion if one is already available.
    pub fn poll(&mut self) -> Result<Option<Completed>, Error> {
        if self.terminated {
            return Err(Error::Terminated);
        }
        match self.receiver.try_recv() {
            Ok(frame) => self.handle(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Parks until a completion arrives (bounded by `timeout`, if given) and
    /// handles it. Returns `Ok(None)` on timeout.
    pub fn step_or_park(&mut self, timeout: Option<Duration>) -> Result<Option<Completed>, Error> {
        if self.terminated {
            return Err(Error::Terminated);
        }
        let frame = match timeout {
            None => match self.receiver.recv() {
                Ok(frame) => frame,
                Err(_) => return Ok(None),
            },
            Some(timeout) => match self.receiver.recv_timeout(timeout) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(None);
                }
            },
        };
        self.handle(frame)
    }

    /// Terminates every worker and marks the pool unusable.
    ///
    /// Results still in flight are lost.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.shutdown_workers();
        if let Some(logger) = &self.logger {
            logger.log(PoolEvent::Terminated);
        }
        self.terminated = true;
    }

    /// True once [`terminate`](Pool::terminate) has run (or a fault aborted
    /// the pool).
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The number of worker threads.
    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// The number of tasks in the wait queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The number of workers currently running a task.
    pub fn busy_workers(&self) -> usize {
        self.busy.iter().filter(|slot| slot.is_some()).count()
    }

    /// The reported hardware concurrency.
    pub fn cpus() -> usize {
        num_cpus::get()
    }

    fn idle_worker(&self) -> Option<usize> {
        self.busy.iter().position(Option::is_none)
    }

    fn dispatch(&mut self, index: usize, mut task: Task) -> Result<(), Error> {
        let descriptor = task.to_descriptor(&self.codecs)?;
        // Capture payloads after the descriptor is built: moved slots give up
        // their payload, copied slots are snapshotted and stay observable.
        let moved_payloads = descriptor.moved.iter().map(Movable::take).collect();
        let copied_payloads = descriptor.copied.iter().map(Movable::snapshot).collect();
        let originals = descriptor.moved.iter().cloned().collect();
        self.senders[index]
            .send(ToWorker::Run(TaskFrame { descriptor, moved_payloads, copied_payloads }))
            .map_err(|_| Error::Frame(format!("worker {} is gone", index)))?;
        self.busy[index] = Some(InFlight { task, originals });
        Ok(())
    }

    fn handle(&mut self, frame: FromWorker) -> Result<Option<Completed>, Error> {
        match frame {
            FromWorker::Fault(fault) => {
                if let Some(logger) = &self.logger {
                    logger.log(PoolEvent::Fault {
                        worker_index: fault.worker_index,
                        message: fault.message.clone(),
                    });
                }
                self.shutdown_workers();
                self.terminated = true;
                Err(Error::Worker {
                    index: fault.worker_index,
                    task: fault.task.unwrap_or_else(|| "<unknown>".to_owned()),
                    message: fault.message,
                })
            }
            FromWorker::Done(frame) => {
                let completed = self.apply_completion(frame)?;

                // The completing worker is idle again: hand it the first
                // waiting task whose buffers are all present.
                if let Some(position) = self
                    .queue
                    .iter()
                    .position(|waiting| !waiting.has_moved_buffer(&self.codecs))
                {
                    let waiting = self.queue.remove(position).expect("position is in range");
                    let index = self.idle_worker().expect("a worker just went idle");
                    self.dispatch(index, waiting)?;
                } else {
                    self.check_stall()?;
                }

                Ok(Some(completed))
            }
        }
    }

    fn apply_completion(&mut self, frame: ResultFrame) -> Result<Completed, Error> {
        let ResultFrame { worker_index, result, slots, payloads, input_count } = frame;
        let inflight = self
            .busy
            .get_mut(worker_index)
            .and_then(Option::take)
            .ok_or_else(|| Error::Frame(format!("worker {} was not busy", worker_index)))?;

        // Restore input payloads into the original controller handles and
        // adopt fresh handles for buffers the result created. An input slot
        // returning no payload was consumed by the callable: its controller
        // handle stays moved.
        let mut swaps: Vec<(Movable, Movable)> = Vec::with_capacity(slots.len());
        for (position, (slot, payload)) in slots.iter().zip(payloads).enumerate() {
            if position < input_count {
                let original = inflight
                    .originals
                    .get(position)
                    .ok_or_else(|| Error::Frame("back-transfer slot mismatch".to_owned()))?;
                if let Some(bytes) = payload {
                    original.restore(bytes);
                }
                swaps.push((slot.clone(), original.clone()));
            } else {
                let fresh = match payload {
                    Some(bytes) => Movable::from_vec(bytes),
                    None => Movable::vacant(),
                };
                swaps.push((slot.clone(), fresh));
            }
        }

        let mut packed = result;
        packed.replace_buffers(&swaps);
        let result = self.codecs.unpack(packed);

        if let Some(logger) = &self.logger {
            logger.log(PoolEvent::WorkerDone {
                worker_index,
                task: inflight
                    .task
                    .tag()
                    .map(|tag| tag.name.clone())
                    .unwrap_or_default(),
            });
        }

        Ok(Completed { task: inflight.task, result, worker_index })
    }

    fn check_stall(&self) -> Result<(), Error> {
        if !self.queue.is_empty()
            && self.busy.iter().all(Option::is_none)
            && self.queue.iter().all(|task| task.has_moved_buffer(&self.codecs))
        {
            return Err(Error::Stall);
        }
        Ok(())
    }

    fn shutdown_workers(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(ToWorker::Stop);
        }
        self.senders.clear();
        for guard in self.guards.drain(..) {
            let _ = guard.join();
        }
        self.busy.iter_mut().for_each(|slot| *slot = None);
        self.queue.clear();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.terminated {
            self.shutdown_workers();
        }
    }
}
