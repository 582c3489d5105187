//! End-to-end pipeline scenarios.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use conveyor::logging::PipelineEvent;
use conveyor::{
    async_slot, result_of, variable, Config, Error, Movable, Pipeline, Registry, TaskSpec, Value,
};

fn registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.install("id", |scope| Ok(scope.arg(0).clone()));
    registry.install("inc", |scope| {
        Ok(Value::Int(scope.arg(0).as_int().unwrap_or(0) + 1))
    });
    registry.install("add", |scope| {
        let a = scope.arg(0).as_int().unwrap_or(0);
        let b = scope.arg(1).as_int().unwrap_or(0);
        Ok(Value::Int(a + b))
    });
    registry.install("sum_bytes", |scope| {
        let buffer = scope.arg(0).as_bytes().ok_or("expected a buffer")?;
        let sum = buffer
            .with_bytes(|bytes| bytes.iter().map(|byte| *byte as i64).sum())
            .ok_or("buffer was moved")?;
        Ok(Value::Int(sum))
    });
    registry.install("make_counter", |scope| {
        Ok(Value::map([
            ("value".to_owned(), scope.arg(0).clone()),
            ("bump".to_owned(), Value::Func("bump".to_owned())),
        ]))
    });
    registry.install("bump", |scope| {
        let value = scope
            .receiver
            .as_ref()
            .and_then(|receiver| receiver.navigate("value"))
            .and_then(Value::as_int)
            .ok_or("receiver has no value field")?;
        Ok(Value::Int(value + 1))
    });
    registry.install("stamp", |_| Ok(Value::Int(7)));
    registry.install("eventually", |scope| {
        let callback = scope.arg(0).as_callback().ok_or("expected a callback")?.clone();
        callback.call(Value::Int(42));
        Ok(Value::Null)
    });
    registry.install("on_controller_gpu", |_| {
        let on_worker = std::thread::current()
            .name()
            .is_some_and(|name| name.starts_with("worker thread"));
        Ok(Value::Bool(!on_worker))
    });
    registry
}

/// Captures `"pipeline"` events into a shared vector, unbuffered so every
/// event is visible as soon as it is logged.
fn capture_events() -> (Rc<RefCell<conveyor_logging::Registry>>, Rc<RefCell<Vec<PipelineEvent>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let mut streams = conveyor_logging::Registry::new(Instant::now());
    streams.open::<PipelineEvent>("pipeline", 0, move |_, batch| {
        sink.borrow_mut().extend(batch.into_iter().map(|(_, event)| event));
    });
    (Rc::new(RefCell::new(streams)), seen)
}

fn done_order(events: &[PipelineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::TaskDone { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn single_task_completes() {
    let config = Config::new().task("inc", TaskSpec::new("inc").arg(1i64));
    let mut pipeline = Pipeline::builder(config, registry()).single_threaded().build().unwrap();
    assert_eq!(pipeline.process_blocking("inc").unwrap(), Value::Int(2));
}

#[test]
fn dependent_tasks_run_in_dependency_order() {
    let (streams, seen) = capture_events();
    let config = Config::new()
        .task("A", TaskSpec::new("id").arg(10i64))
        .task("B", TaskSpec::new("add").arg(result_of("A")).arg(5i64));
    let mut pipeline = Pipeline::builder(config, registry())
        .single_threaded()
        .logging(streams)
        .build()
        .unwrap();

    assert_eq!(pipeline.process_blocking("B").unwrap(), Value::Int(15));
    assert_eq!(done_order(&seen.borrow()), vec!["A", "B"]);
}

#[test]
fn cyclic_configurations_are_rejected() {
    let config = Config::new()
        .task("A", TaskSpec::new("f").arg(result_of("B")))
        .task("B", TaskSpec::new("g").arg(result_of("A")));
    let mut pipeline = Pipeline::builder(config, registry()).single_threaded().build().unwrap();
    let outcome = pipeline.process("A", |_| {});
    assert!(matches!(outcome, Err(Error::Cycle { .. })));
}

#[test]
fn missing_dependencies_name_both_tasks() {
    let config = Config::new().task("A", TaskSpec::new("f").arg(result_of("ghost")));
    let mut pipeline = Pipeline::builder(config, registry()).single_threaded().build().unwrap();
    match pipeline.process("A", |_| {}) {
        Err(Error::Configuration(message)) => {
            assert!(message.contains("ghost"));
            assert!(message.contains('A'));
        }
        other => panic!("expected a configuration error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn shared_buffer_consumers_serialise_through_one_worker() {
    let buffer = Movable::from_vec(vec![1u8, 2, 3]);
    let config = Config::new()
        .task("first", TaskSpec::new("sum_bytes").arg(Value::Bytes(buffer.clone())))
        .task("second", TaskSpec::new("sum_bytes").arg(Value::Bytes(buffer.clone())))
        .task(
            "both",
            TaskSpec::new("add").arg(result_of("first")).arg(result_of("second")),
        );
    let mut pipeline = Pipeline::builder(config, registry()).workers(1).build().unwrap();

    assert_eq!(pipeline.process_blocking("both").unwrap(), Value::Int(12));
    assert!(!buffer.is_moved(), "the last back-transfer returned the payload");
}

#[test]
fn multiply_consumed_results_are_copied_not_moved() {
    // `source` produces a buffer consumed by value by two dependants, so its
    // vertex weight is two and each dispatch copies instead of moving.
    let registry = registry();
    registry.install("make_buffer", |_| Ok(Value::Bytes(Movable::from_vec(vec![2u8; 3]))));

    let config = Config::new()
        .task("source", TaskSpec::new("make_buffer"))
        .task("left", TaskSpec::new("sum_bytes").arg(result_of("source")))
        .task("right", TaskSpec::new("sum_bytes").arg(result_of("source")))
        .task(
            "total",
            TaskSpec::new("add").arg(result_of("left")).arg(result_of("right")),
        );
    let mut pipeline = Pipeline::builder(config, registry).workers(2).build().unwrap();
    assert_eq!(pipeline.process_blocking("total").unwrap(), Value::Int(12));
}

#[test]
fn async_results_are_recorded_and_routed() {
    let config = Config::new()
        .task("prod", TaskSpec::new("eventually").arg(async_slot()))
        .task("next", TaskSpec::new("add").arg(result_of("prod")).arg(0i64));
    let mut pipeline = Pipeline::builder(config, registry()).single_threaded().build().unwrap();
    assert_eq!(pipeline.process_blocking("next").unwrap(), Value::Int(42));
}

#[test]
fn deferred_commands_bind_the_result_as_receiver() {
    let config = Config::new()
        .task("obj", TaskSpec::new("make_counter").arg(5i64))
        .task("bumped", TaskSpec::on_result("obj", "bump"));
    let mut pipeline = Pipeline::builder(config, registry()).single_threaded().build().unwrap();
    assert_eq!(pipeline.process_blocking("bumped").unwrap(), Value::Int(6));
}

#[test]
fn await_orders_without_consuming() {
    let (streams, seen) = capture_events();
    let config = Config::new()
        .task("first", TaskSpec::new("id").arg(1i64))
        .task("then", TaskSpec::after("first", "stamp"));
    let mut pipeline = Pipeline::builder(config, registry())
        .single_threaded()
        .logging(streams)
        .build()
        .unwrap();

    assert_eq!(pipeline.process_blocking("then").unwrap(), Value::Int(7));
    assert_eq!(done_order(&seen.borrow()), vec!["first", "then"]);
}

#[test]
fn variables_bind_late() {
    let registry = registry();
    registry.set_variable("gain", Value::Int(30));
    let config = Config::new().task("scaled", TaskSpec::new("add").arg(variable("gain")).arg(12i64));
    let mut pipeline = Pipeline::builder(config, registry).single_threaded().build().unwrap();
    assert_eq!(pipeline.process_blocking("scaled").unwrap(), Value::Int(42));
}

#[test]
fn gpu_suffixed_methods_stay_on_the_controller() {
    let config = Config::new().task("blur", TaskSpec::new("on_controller_gpu"));
    let mut pipeline = Pipeline::builder(config, registry()).workers(2).build().unwrap();
    assert_eq!(pipeline.process_blocking("blur").unwrap(), Value::Bool(true));
}

#[test]
fn no_multithreading_flag_forces_inline_execution() {
    let registry = registry();
    registry.install("where_am_i", |_| {
        let on_worker = std::thread::current()
            .name()
            .is_some_and(|name| name.starts_with("worker thread"));
        Ok(Value::Bool(!on_worker))
    });
    let config =
        Config::new().task("pinned", TaskSpec::new("where_am_i").no_multithreading());
    let mut pipeline = Pipeline::builder(config, registry).workers(2).build().unwrap();
    assert_eq!(pipeline.process_blocking("pinned").unwrap(), Value::Bool(true));
}

#[test]
fn stopped_contexts_discard_their_results() {
    let (streams, seen) = capture_events();
    let config = Config::new()
        .task("a", TaskSpec::new("id").arg(1i64))
        .task("b", TaskSpec::new("inc").arg(result_of("a")));
    let mut pipeline = Pipeline::builder(config, registry())
        .single_threaded()
        .logging(streams)
        .build()
        .unwrap();

    let completed = Rc::new(RefCell::new(false));
    let witness = Rc::clone(&completed);
    let handle = pipeline
        .process("b", move |_| {
            *witness.borrow_mut() = true;
        })
        .unwrap();
    handle.stop();

    // The stop flag is observed at the next scheduling step, triggered by
    // the already-queued completion of `a`.
    while pipeline.step().unwrap() {}
    assert!(!pipeline.is_active());
    assert!(!*completed.borrow());

    assert!(seen
        .borrow()
        .iter()
        .any(|event| matches!(event, PipelineEvent::ContextTerminated { .. })));
}

#[test]
fn terminated_pipelines_reject_further_work() {
    let config = Config::new().task("inc", TaskSpec::new("inc").arg(1i64));
    let mut pipeline = Pipeline::builder(config, registry()).workers(1).build().unwrap();
    pipeline.terminate().unwrap();
    assert!(pipeline.is_terminated());
    assert!(matches!(pipeline.process("inc", |_| {}), Err(Error::Terminated)));
    assert!(matches!(pipeline.terminate(), Err(Error::Terminated)));
}

#[test]
fn contexts_share_the_pipeline() {
    let config = Config::new()
        .task("one", TaskSpec::new("inc").arg(1i64))
        .task("two", TaskSpec::new("inc").arg(10i64));
    let mut pipeline = Pipeline::builder(config, registry()).single_threaded().build().unwrap();

    let results = Rc::new(RefCell::new(Vec::new()));
    let first = Rc::clone(&results);
    let second = Rc::clone(&results);
    pipeline.process("one", move |result| first.borrow_mut().push(result)).unwrap();
    pipeline.process("two", move |result| second.borrow_mut().push(result)).unwrap();
    pipeline.run().unwrap();

    let mut seen = results.borrow().clone();
    seen.sort_by_key(|value| value.as_int());
    assert_eq!(seen, vec![Value::Int(2), Value::Int(11)]);
}
