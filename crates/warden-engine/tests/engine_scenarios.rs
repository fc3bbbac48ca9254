//! End-to-end engine scenarios: lifecycle, propagation, failure policy,
//! garbage collection and log replay.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use warden_engine::{ExecutionEngine, ExecutionErrorKind};
use warden_event::{CommandSpec, EmitHandler, EventRelationKind, ReplacePolicy};
use warden_log::{LogEntry, LogMethod, LogSink, PlanRebuilder};
use warden_model::TaskModel;
use warden_plan::{DependencyInfo, Plan};
use warden_types::{GenId, TaskId};

fn interruptible() -> Arc<TaskModel> {
    TaskModel::builder("interruptible").terminates().build().unwrap()
}

fn engine_with(model: &Arc<TaskModel>, missions: usize) -> (ExecutionEngine, Vec<TaskId>) {
    let mut plan = Plan::new();
    let mut tasks = Vec::new();
    for _ in 0..missions {
        let task = plan.add_task(model, vec![]).unwrap();
        plan.add_mission_task(task).unwrap();
        tasks.push(task);
    }
    (ExecutionEngine::new(plan), tasks)
}

fn event_of(engine: &ExecutionEngine, task: TaskId, symbol: &str) -> GenId {
    engine.plan().task_event(task, symbol).unwrap()
}

#[test]
fn start_stop_lifecycle() {
    let (mut engine, tasks) = engine_with(&interruptible(), 1);
    let task = tasks[0];

    assert!(engine.plan().task(task).unwrap().state().pending);
    engine.start_task(task).unwrap();
    let state = *engine.plan().task(task).unwrap().state();
    assert!(state.started && state.running && !state.pending);

    let stop = event_of(&engine, task, "stop");
    engine.call_now(stop, vec![]).unwrap();
    let state = *engine.plan().task(task).unwrap().state();
    assert!(state.finished && !state.running);
    // Interruption goes through failed.
    assert_eq!(state.success, Some(false));
}

#[test]
fn terminal_forwarding_chain() {
    let model = TaskModel::builder("multi_path")
        .event("direct", false, false)
        .event("indirect", false, false)
        .event("intermediate", false, false)
        .forward("direct", "success")
        .forward("indirect", "intermediate")
        .forward("intermediate", "success")
        .build()
        .unwrap();
    let (mut engine, tasks) = engine_with(&model, 1);
    let task = tasks[0];
    engine.start_task(task).unwrap();

    // Both forwarding chains are terminal at the instance level.
    for symbol in ["direct", "indirect", "intermediate"] {
        let gen = event_of(&engine, task, symbol);
        assert!(
            engine.plan().generator(gen).unwrap().is_terminal(),
            "{symbol} must be terminal"
        );
    }

    let direct = event_of(&engine, task, "direct");
    engine.emit_now(direct, vec![]).unwrap();

    let state = *engine.plan().task(task).unwrap().state();
    assert!(state.finished);
    assert_eq!(state.success, Some(true));

    // History ends in success, then stop.
    let success = event_of(&engine, task, "success");
    let stop = event_of(&engine, task, "stop");
    let success_pid = engine
        .plan()
        .generator(success)
        .unwrap()
        .last_emission()
        .unwrap()
        .propagation_id;
    let stop_pid = engine
        .plan()
        .generator(stop)
        .unwrap()
        .last_emission()
        .unwrap()
        .propagation_id;
    assert!(success_pid < stop_pid);

    // The other chain never fired.
    let indirect = event_of(&engine, task, "indirect");
    assert!(!engine.plan().generator(indirect).unwrap().emitted());
}

#[test]
fn poll_runs_after_start_handler_and_at_least_once() {
    let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    let on_start_order = order.clone();
    let poll_order = order.clone();
    let model = TaskModel::builder("short_lived")
        .terminates()
        .on("start", move |scope, emission| {
            on_start_order.lock().push("start_handler");
            let task = emission.task().expect("task event");
            let stop = scope.task_event(task, "stop").expect("stop event");
            scope.call(stop, vec![])?;
            Ok(())
        })
        .poll(move |_, _| {
            poll_order.lock().push("poll");
            Ok(())
        })
        .build()
        .unwrap();

    let (mut engine, tasks) = engine_with(&model, 1);
    let task = tasks[0];
    let start = event_of(&engine, task, "start");

    engine.injector().call(start, vec![]);
    engine.process_events();

    let state = *engine.plan().task(task).unwrap().state();
    assert!(state.finished, "the start handler stopped the task");
    // The poll block still ran, once, after the on-start handler.
    assert_eq!(*order.lock(), vec!["start_handler", "poll"]);
    assert_eq!(engine.plan().task(task).unwrap().poll_count(), 1);
}

#[test]
fn delayed_arguments_freeze_at_start() {
    let model = TaskModel::builder("decomposing")
        .argument_with_setter("high_level", |scope, value| {
            scope.set("high_level", value.clone());
            scope.set("low_level", value.clone());
            Ok(())
        })
        .argument("low_level")
        .build()
        .unwrap();

    let mut plan = Plan::new();
    let task = plan
        .add_task(
            &model,
            vec![(
                "high_level".into(),
                warden_model::delayed_value(json!(10)).into(),
            )],
        )
        .unwrap();
    plan.add_mission_task(task).unwrap();

    let mut engine = ExecutionEngine::new(plan);
    // Not executable yet: the declared arguments are still delayed.
    assert!(!engine.plan().task(task).unwrap().executable(true));

    engine.start_task(task).unwrap();

    let task_ref = engine.plan().task(task).unwrap();
    assert!(task_ref.state().running);
    assert_eq!(task_ref.arguments().get("high_level"), Some(&json!(10)));
    assert_eq!(task_ref.arguments().get("low_level"), Some(&json!(10)));
    assert!(task_ref.arguments().is_frozen());
}

#[test]
fn signal_starts_the_target_in_the_same_cycle() {
    let (mut engine, tasks) = engine_with(&interruptible(), 2);
    let (a, b) = (tasks[0], tasks[1]);
    let a_start = event_of(&engine, a, "start");
    let b_start = event_of(&engine, b, "start");
    engine
        .plan_mut()
        .add_event_edge(EventRelationKind::Signal, a_start, b_start, json!(null))
        .unwrap();

    engine.start_task(a).unwrap();

    assert!(engine.plan().task(a).unwrap().state().running);
    assert!(engine.plan().task(b).unwrap().state().running);

    // The propagated start knows where it came from.
    let emission = engine
        .plan()
        .generator(b_start)
        .unwrap()
        .last_emission()
        .unwrap()
        .clone();
    assert!(emission.is_propagated());
    let source = engine
        .plan()
        .generator(a_start)
        .unwrap()
        .last_emission()
        .unwrap()
        .propagation_id;
    assert_eq!(emission.sources, vec![source]);
}

#[test]
fn handler_error_raises_internal_error_and_condemns() {
    let model = TaskModel::builder("broken")
        .on("start", |_, _| Err("sensor dead".into()))
        .build()
        .unwrap();
    let (mut engine, tasks) = engine_with(&model, 1);
    let task = tasks[0];

    engine.start_task(task).unwrap();

    let state = *engine.plan().task(task).unwrap().state();
    assert!(state.internal_error);
    assert!(state.failed());
    assert!(state.finished, "internal_error forwards to stop");
    // stop has no command here, so the forward goes to it directly:
    // no failed emission is forced.
    let failed = event_of(&engine, task, "failed");
    assert!(!engine.plan().generator(failed).unwrap().emitted());

    // The unhandled error condemns the task: it is collected even
    // though it is a mission.
    let stats = engine.process_events();
    assert!(stats.errors >= 1);
    assert!(engine.plan().task(task).is_none());
    assert!(!engine.plan().garbage().garbaged.is_empty());
    assert!(!engine.plan().garbage().propagated_exceptions.is_empty());
    assert!(!engine.last_errors().is_empty());
}

#[test]
fn internal_error_forces_failed_when_stop_is_scripted() {
    let model = TaskModel::builder("scripted_stop")
        .terminates()
        .on("start", |_, _| Err("sensor dead".into()))
        .build()
        .unwrap();
    let (mut engine, tasks) = engine_with(&model, 1);
    let task = tasks[0];

    engine.start_task(task).unwrap();

    let state = *engine.plan().task(task).unwrap().state();
    assert!(state.internal_error);
    assert_eq!(state.success, Some(false));
    assert!(state.finished);

    // The scripted stop was not bypassed: failed actually emitted and
    // its forward completed the termination chain.
    let failed = event_of(&engine, task, "failed");
    let stop = event_of(&engine, task, "stop");
    assert!(engine.plan().generator(failed).unwrap().emitted());
    assert!(engine.plan().generator(stop).unwrap().emitted());
}

#[test]
fn emergency_termination_keeps_the_causal_chain() {
    // The internal_error handler itself raises, so the engine cannot
    // even fail cleanly: the task is quarantined and the termination
    // error references the code error that triggered it.
    let model = TaskModel::builder("doubly_broken")
        .on("start", |_, _| Err("sensor dead".into()))
        .on("internal_error", |_, _| Err("logger dead too".into()))
        .build()
        .unwrap();
    let (mut engine, tasks) = engine_with(&model, 1);
    let task = tasks[0];

    engine.start_task(task).unwrap();
    assert!(engine.quarantined().contains(&task));

    engine.process_events();

    let errors = engine.last_errors();
    let all = errors.all();
    assert!(all
        .iter()
        .any(|e| e.kind == ExecutionErrorKind::EmergencyTermination && !e.originals.is_empty()));
    // The transitive filter drops the code error the termination
    // derives from; the rest surfaces.
    let surfaced = errors.original_exceptions();
    assert!(surfaced.len() < all.len());
    assert!(surfaced
        .iter()
        .any(|e| e.kind == ExecutionErrorKind::EmergencyTermination));

    // Quarantined tasks are never collected.
    assert!(engine.plan().task(task).is_some());
}

#[test]
fn command_error_before_emission_fails_to_start() {
    let model = TaskModel::builder("unpowered")
        .event_with_command(
            "start",
            false,
            CommandSpec::custom(|_, _, _| Err("no power".into())),
        )
        .build()
        .unwrap();
    let (mut engine, tasks) = engine_with(&model, 1);
    let task = tasks[0];

    let err = engine.start_task(task).unwrap_err();
    assert_eq!(err.kind, ExecutionErrorKind::CommandFailed);
    assert!(err.message.contains("no power"));

    let state = *engine.plan().task(task).unwrap().state();
    assert!(state.failed_to_start);
    assert!(state.failed());
    assert!(state.finished);

    let start = event_of(&engine, task, "start");
    assert!(engine.plan().generator(start).unwrap().is_unreachable());
    assert!(!engine.plan().garbage().failed_to_start.is_empty());
}

#[test]
fn achieve_with_emits_on_source_success() {
    let (mut engine, tasks) = engine_with(&interruptible(), 2);
    let (a, b) = (tasks[0], tasks[1]);
    let a_success = event_of(&engine, a, "success");
    let b_start = event_of(&engine, b, "start");
    engine.plan_mut().achieve_with(b_start, a_success).unwrap();

    engine.start_task(a).unwrap();
    assert!(engine.plan().task(b).unwrap().state().pending);

    engine.emit_now(a_success, vec![]).unwrap();

    assert!(engine.plan().task(a).unwrap().state().finished);
    assert!(engine.plan().task(b).unwrap().state().running);
}

#[test]
fn achieve_with_unreachable_source_fails_the_achiever() {
    let (mut engine, tasks) = engine_with(&interruptible(), 2);
    let (a, b) = (tasks[0], tasks[1]);
    let a_success = event_of(&engine, a, "success");
    let b_start = event_of(&engine, b, "start");
    engine.plan_mut().achieve_with(b_start, a_success).unwrap();

    engine.emit_failed_now(a_success, "cancelled");

    assert!(engine
        .plan()
        .generator(a_success)
        .unwrap()
        .is_unreachable());
    let state = *engine.plan().task(b).unwrap().state();
    assert!(state.failed_to_start);
    assert!(state.failed());
}

#[test]
fn pending_task_outside_the_useful_set_is_collected() {
    let mut plan = Plan::new();
    let stray = plan.add_task(&interruptible(), vec![]).unwrap();
    let mission = plan.add_task(&interruptible(), vec![]).unwrap();
    plan.add_mission_task(mission).unwrap();

    let mut engine = ExecutionEngine::new(plan);
    let stats = engine.process_events();

    assert_eq!(stats.garbage_collected, 1);
    assert!(engine.plan().task(stray).is_none());
    assert!(engine.plan().task(mission).is_some());
}

#[test]
fn running_garbage_is_stopped_before_collection() {
    let (mut engine, tasks) = engine_with(&interruptible(), 1);
    let task = tasks[0];
    engine.start_task(task).unwrap();
    engine.plan_mut().unmark_mission(task);

    let first = engine.process_events();
    assert_eq!(first.forced_stops, 1);
    assert!(engine.plan().task(task).is_some(), "still stopping");

    let second = engine.process_events();
    assert_eq!(second.garbage_collected, 1);
    assert!(engine.plan().task(task).is_none());
}

#[test]
fn forbidden_child_event_condemns_parent_and_child() {
    let (mut engine, tasks) = engine_with(&interruptible(), 2);
    let (parent, child) = (tasks[0], tasks[1]);
    engine.plan_mut().unmark_mission(child);
    engine
        .plan_mut()
        .add_dependency(parent, child, DependencyInfo::default())
        .unwrap();

    engine.start_task(parent).unwrap();
    engine.start_task(child).unwrap();

    let failed = event_of(&engine, child, "failed");
    engine.emit_now(failed, vec![]).unwrap();
    assert!(engine.plan().task(child).unwrap().state().finished);

    // Three cycles: detect + stop parent, finish stopping, collect.
    engine.process_events();
    engine.process_events();
    engine.process_events();

    assert!(engine.plan().task(child).is_none());
    assert!(engine.plan().task(parent).is_none());
    assert!(!engine.plan().garbage().propagated_exceptions.is_empty());
}

#[test]
fn running_repair_task_handles_the_failure() {
    let (mut engine, tasks) = engine_with(&interruptible(), 3);
    let (parent, child, repair) = (tasks[0], tasks[1], tasks[2]);
    engine
        .plan_mut()
        .add_dependency(parent, child, DependencyInfo::default())
        .unwrap();
    engine
        .plan_mut()
        .add_error_handler(repair, child, vec![])
        .unwrap();

    engine.start_task(parent).unwrap();
    engine.start_task(child).unwrap();
    engine.start_task(repair).unwrap();

    let failed = event_of(&engine, child, "failed");
    engine.emit_now(failed, vec![]).unwrap();

    let stats = engine.process_events();
    assert!(stats.errors >= 1);
    // Covered by the repair task: nothing was condemned.
    assert!(engine.plan().task(parent).is_some());
    assert!(engine.plan().task(child).is_some());
    assert!(engine.plan().task(parent).unwrap().state().running);
}

#[test]
fn replacement_copies_handlers_by_policy() {
    let (mut engine, tasks) = engine_with(&interruptible(), 2);
    let (a, b) = (tasks[0], tasks[1]);
    let a_start = event_of(&engine, a, "start");
    let b_start = event_of(&engine, b, "start");

    let copied = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));
    {
        let copied = copied.clone();
        let dropped = dropped.clone();
        let gen = engine.plan_mut().generator_mut(a_start).unwrap();
        gen.on_handler(
            EmitHandler::new(move |_, _| {
                copied.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .with_policy(ReplacePolicy::Copy),
        );
        gen.on_handler(
            EmitHandler::new(move |_, _| {
                dropped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .with_policy(ReplacePolicy::Drop),
        );
    }

    engine.plan_mut().replace_by(a, b).unwrap();
    engine.plan_mut().add_mission_task(a).unwrap();

    engine.call_now(a_start, vec![]).unwrap();
    engine.call_now(b_start, vec![]).unwrap();

    // The Copy handler ran for both tasks, the Drop handler only for
    // the original.
    assert_eq!(copied.load(Ordering::SeqCst), 2);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn poll_copied_from_abstract_runs_on_first_running_cycle() {
    let polls = Arc::new(AtomicUsize::new(0));
    let poll_counter = polls.clone();
    // An abstract placeholder declares the poll; its default replace
    // policy resolves to Copy because the model is abstract.
    let placeholder = TaskModel::builder("goto_placeholder")
        .abstract_model()
        .poll(move |_, _| {
            poll_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();

    let mut plan = Plan::new();
    let a = plan.add_task(&placeholder, vec![]).unwrap();
    let b = plan.add_task(&interruptible(), vec![]).unwrap();
    plan.add_mission_task(a).unwrap();
    plan.replace_by(a, b).unwrap();
    assert!(plan.is_mission(b));

    let mut engine = ExecutionEngine::new(plan);
    engine.start_task(b).unwrap();
    assert_eq!(polls.load(Ordering::SeqCst), 0);

    // The copied poll runs on the first cycle on which the
    // replacement is running, not the next one.
    engine.process_events();
    assert_eq!(polls.load(Ordering::SeqCst), 1);
}

#[test]
fn injection_from_another_thread_is_drained_at_cycle_start() {
    let (mut engine, tasks) = engine_with(&interruptible(), 1);
    let task = tasks[0];
    let start = event_of(&engine, task, "start");

    let injector = engine.injector();
    let handle = std::thread::spawn(move || {
        injector.call(start, vec![json!({"origin": "sensor"})]);
    });
    handle.join().unwrap();

    assert!(engine.plan().task(task).unwrap().state().pending);
    engine.process_events();
    assert!(engine.plan().task(task).unwrap().state().running);
}

#[tokio::test]
async fn run_cycles_yields_between_cycles() {
    let (mut engine, _) = engine_with(&interruptible(), 1);
    engine.run_cycles(3).await;
    assert_eq!(engine.current_cycle().as_u64(), 3);
}

#[derive(Clone, Default)]
struct SharedLog(Arc<Mutex<Vec<LogEntry>>>);

impl LogSink for SharedLog {
    fn append(&mut self, entry: LogEntry) {
        self.0.lock().push(entry);
    }
}

#[test]
fn log_stream_replays_into_the_rebuilder() {
    let (mut engine, tasks) = engine_with(&interruptible(), 1);
    let task = tasks[0];
    let start = event_of(&engine, task, "start");

    let sink = SharedLog::default();
    engine.set_log_sink(Box::new(sink.clone()));

    engine.start_task(task).unwrap();
    engine.process_events();
    engine.take_log_sink();

    let entries = sink.0.lock().clone();
    assert!(entries
        .iter()
        .any(|e| e.method == LogMethod::RegisterExecutablePlan));
    assert!(entries.iter().any(|e| e.method == LogMethod::MergedPlan));
    assert!(entries.iter().any(|e| e.method == LogMethod::CycleEnd));

    let mut rebuilder = PlanRebuilder::new();
    rebuilder.apply_all(entries.iter()).unwrap();

    assert_eq!(rebuilder.cycle_count(), 1);
    let start_view = rebuilder.generator(start.as_u64()).unwrap();
    assert!(start_view.emitted);
    assert_eq!(start_view.history.len(), 1);
    assert!(rebuilder.mission_tasks().contains(&task.as_u64()));
    assert_eq!(rebuilder.task(task.as_u64()).unwrap().state, "running");
}
