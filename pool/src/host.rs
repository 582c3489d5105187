//! The worker-side frame loop.

use std::sync::mpsc::{Receiver, Sender};

use conveyor_bytes::Movable;
use conveyor_codec::CodecRegistry;

use crate::lookup::Registry;
use crate::message::{FaultFrame, FromWorker, ResultFrame, TaskFrame, ToWorker};
use crate::task::Task;

/// Runs one worker to completion.
///
/// The first frame must be `Init`; every later `Run` frame is executed in
/// order and answered with a result frame carrying the automatic
/// back-transfer of its input buffers. Protocol violations and task failures
/// post a fault frame and end the worker: worker errors are fatal to the
/// pool, so there is nothing to keep alive.
pub fn worker_main(receiver: Receiver<ToWorker>, sender: Sender<FromWorker>) {
    let init = match receiver.recv() {
        Ok(ToWorker::Init(init)) => init,
        Ok(_) => {
            let _ = sender.send(FromWorker::Fault(FaultFrame {
                worker_index: 0,
                task: None,
                message: "first frame must be init".to_owned(),
            }));
            return;
        }
        Err(_) => return,
    };

    let worker_index = init.worker_index;
    let codecs = init.codecs;
    let registry = init.registry;
    let default_lookup = init.lookup;

    while let Ok(frame) = receiver.recv() {
        match frame {
            ToWorker::Stop => break,
            ToWorker::Init(_) => {
                let _ = sender.send(FromWorker::Fault(FaultFrame {
                    worker_index,
                    task: None,
                    message: "duplicate init frame".to_owned(),
                }));
                break;
            }
            ToWorker::Run(frame) => {
                match run_frame(worker_index, frame, &codecs, &registry, default_lookup.as_ref()) {
                    Ok(done) => {
                        if sender.send(FromWorker::Done(done)).is_err() {
                            break;
                        }
                    }
                    Err(fault) => {
                        let _ = sender.send(FromWorker::Fault(fault));
                        break;
                    }
                }
            }
        }
    }
}

fn run_frame(
    worker_index: usize,
    frame: TaskFrame,
    codecs: &CodecRegistry,
    registry: &Registry,
    default_lookup: Option<&Vec<String>>,
) -> Result<ResultFrame, FaultFrame> {
    let TaskFrame { mut descriptor, moved_payloads, copied_payloads } = frame;
    let task_name = descriptor
        .tag
        .as_ref()
        .map(|tag| tag.name.clone())
        .unwrap_or_else(|| descriptor.target.clone());
    let fault = |message: String| FaultFrame {
        worker_index,
        task: Some(task_name.clone()),
        message,
    };

    // Adopt the transferred payloads into local handles. The descriptor's
    // own handles only serve as identity markers for patching.
    let mut swaps: Vec<(Movable, Movable)> = Vec::new();
    let mut inputs: Vec<Movable> = Vec::new();
    for (marker, payload) in descriptor.moved.iter().zip(moved_payloads) {
        let local = match payload {
            Some(bytes) => Movable::from_vec(bytes),
            None => Movable::vacant(),
        };
        inputs.push(local.clone());
        swaps.push((marker.clone(), local));
    }
    for (marker, payload) in descriptor.copied.iter().zip(copied_payloads) {
        let local = match payload {
            Some(bytes) => Movable::from_vec(bytes),
            None => Movable::vacant(),
        };
        swaps.push((marker.clone(), local));
    }
    for arg in &mut descriptor.args {
        arg.replace_buffers(&swaps);
    }
    if let Some(receiver) = &mut descriptor.receiver {
        receiver.replace_buffers(&swaps);
    }

    if descriptor.lookup.is_none() {
        descriptor.lookup = default_lookup.cloned();
    }

    let mut task = Task::from_descriptor(descriptor, codecs);

    // The completion fires synchronously for plain tasks; an async-slot task
    // parks this worker until its callable delivers the result.
    let (done_sender, done_receiver) = std::sync::mpsc::channel();
    task.run(registry, move |value| {
        let _ = done_sender.send(value);
    })
    .map_err(|error| fault(error.to_string()))?;
    let result = done_receiver
        .recv()
        .map_err(|_| fault("completion dropped without firing".to_owned()))?;

    // Package the result, then capture payloads: the result's own buffers
    // and the task's inputs return together, de-duplicated by identity.
    let packed = codecs.pack(&result);
    let mut slots = inputs;
    let input_count = slots.len();
    for movable in codecs.movables(&result) {
        if !slots.iter().any(|present| present.same_as(&movable)) {
            slots.push(movable);
        }
    }
    let payloads = slots.iter().map(Movable::take).collect();

    Ok(ResultFrame {
        worker_index,
        result: packed,
        slots,
        payloads,
        input_count,
    })
}
