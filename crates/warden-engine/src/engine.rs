//! The execution engine.
//!
//! Single-threaded cooperative loop. One cycle runs:
//!
//! ```text
//! 1. external-event injection      (EventInjector drain)
//! 2. pending unreachability notices
//! 3. scheduled blocks              (execute, then poll)
//! 4. propagation drain             (signal / forward queue)
//! 5. late polls                    (tasks that started this cycle)
//! 6. error detection               (repair lookup, GC marking)
//! 7. garbage collection            (forced termination, finalize)
//! 8. cycle bookkeeping             (stats, cycle_end record)
//! ```
//!
//! Handlers, commands and poll blocks run inline on the engine thread
//! and act on the plan through the [`EventScope`] the engine itself
//! implements.

use crate::errors::{ErrorLocus, ExecutionError, ExecutionErrorKind, MultipleExecutionErrors};
use crate::injector::{EventInjector, ExternalOp};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use warden_event::{
    CommandSpec, Emission, EventRelationKind, EventScope, ScopeError, TaskRelationKind,
    UnreachableReason,
};
use warden_log::{dump_plan, LogEntry, LogMethod, LogSink};
use warden_plan::{DependencyInfo, EdgeRef, Plan, PlanError, RelationObserver};
use warden_types::{CycleIndex, GenId, PropagationId, RemoteId, TaskId};

/// Step budget of one propagation drain; a runaway emission loop trips
/// it instead of hanging the cycle.
const MAX_STEPS_PER_CYCLE: usize = 100_000;

/// Per-cycle counters, also attached to the `cycle_end` log record.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    /// The cycle these counters belong to.
    pub cycle: CycleIndex,
    /// Emissions recorded.
    pub emissions: u64,
    /// Localized errors detected.
    pub errors: usize,
    /// Tasks removed by garbage collection.
    pub garbage_collected: usize,
    /// Running tasks the collector asked to stop.
    pub forced_stops: usize,
}

#[derive(Debug, Clone)]
enum StepKind {
    Call,
    Emit,
    Fail(String),
}

#[derive(Debug, Clone)]
struct Step {
    kind: StepKind,
    target: GenId,
    context: Vec<Value>,
    sources: Vec<PropagationId>,
}

#[derive(Debug, Clone)]
struct SourceInfo {
    /// The emission and all its transitive sources.
    closure: Vec<PropagationId>,
    /// Subset of `closure` emitted by task events.
    task_closure: Vec<PropagationId>,
    /// Task that owned the emitting generator.
    task: Option<TaskId>,
}

/// Forwards relation hooks into the log record buffer.
struct EdgeRecorder {
    buffer: Arc<Mutex<Vec<LogEntry>>>,
}

impl EdgeRecorder {
    fn push(&self, method: LogMethod, args: Vec<Value>) {
        self.buffer.lock().push(LogEntry::now(method, args));
    }

    fn edge_args(edge: &EdgeRef, info: Option<&Value>) -> Vec<Value> {
        let mut args = match edge {
            EdgeRef::Event { kind, from, to } => vec![
                json!("event"),
                json!(kind.to_string()),
                json!(from.as_u64()),
                json!(to.as_u64()),
            ],
            EdgeRef::Task { kind, from, to } => vec![
                json!("task"),
                json!(kind.to_string()),
                json!(from.as_u64()),
                json!(to.as_u64()),
            ],
        };
        if let Some(info) = info {
            args.push(info.clone());
        }
        args
    }
}

impl RelationObserver for EdgeRecorder {
    fn added_edge(&mut self, edge: &EdgeRef, info: &Value) -> Result<(), PlanError> {
        self.push(LogMethod::AddedEdge, Self::edge_args(edge, Some(info)));
        Ok(())
    }

    fn removed_edge(&mut self, edge: &EdgeRef) -> Result<(), PlanError> {
        self.push(LogMethod::RemovedEdge, Self::edge_args(edge, None));
        Ok(())
    }

    fn updated_edge_info(&mut self, edge: &EdgeRef, info: &Value) {
        self.push(LogMethod::UpdatedEdgeInfo, Self::edge_args(edge, Some(info)));
    }

    fn finalized_task(&mut self, task: TaskId, _remote: RemoteId) {
        self.push(LogMethod::FinalizedTask, vec![json!(task.as_u64())]);
    }

    fn finalized_event(&mut self, gen: GenId, _remote: RemoteId) {
        self.push(LogMethod::FinalizedEvent, vec![json!(gen.as_u64())]);
    }
}

/// The plan execution engine.
///
/// Owns its plan for the duration of execution. Construction makes the
/// plan executable and emits the `register_executable_plan` and
/// `merged_plan` log records.
pub struct ExecutionEngine {
    plan: Plan,
    cycle: CycleIndex,
    next_propagation: u64,
    next_error: u64,
    injector: EventInjector,
    queue: VecDeque<Step>,
    provenance: HashMap<PropagationId, SourceInfo>,
    current_source: Option<PropagationId>,
    cycle_errors: Vec<ExecutionError>,
    last_errors: MultipleExecutionErrors,
    quarantined: BTreeSet<TaskId>,
    records: Arc<Mutex<Vec<LogEntry>>>,
    sink: Option<Box<dyn LogSink>>,
    last_stats: CycleStats,
}

impl ExecutionEngine {
    /// Takes ownership of `plan`, makes it executable and registers
    /// the log observer.
    #[must_use]
    pub fn new(mut plan: Plan) -> Self {
        plan.set_executable(true);
        let records = Arc::new(Mutex::new(Vec::new()));
        plan.add_observer(Box::new(EdgeRecorder {
            buffer: records.clone(),
        }));

        let engine = Self {
            plan,
            cycle: CycleIndex::ZERO,
            next_propagation: 1,
            next_error: 1,
            injector: EventInjector::new(),
            queue: VecDeque::new(),
            provenance: HashMap::new(),
            current_source: None,
            cycle_errors: Vec::new(),
            last_errors: MultipleExecutionErrors::default(),
            quarantined: BTreeSet::new(),
            records,
            sink: None,
            last_stats: CycleStats::default(),
        };
        engine.record(
            LogMethod::RegisterExecutablePlan,
            vec![json!(engine.plan.remote_id().to_string())],
        );
        engine.record(
            LogMethod::MergedPlan,
            vec![serde_json::to_value(dump_plan(&engine.plan)).unwrap_or(Value::Null)],
        );
        info!(plan = %engine.plan.remote_id(), "registered executable plan");
        engine
    }

    /// The plan under execution.
    #[must_use]
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Mutable access to the plan, for structural mutations between
    /// cycles.
    pub fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    /// Hands the plan back, ending execution.
    #[must_use]
    pub fn into_plan(self) -> Plan {
        self.plan
    }

    /// A cloneable cross-thread injection handle.
    #[must_use]
    pub fn injector(&self) -> EventInjector {
        self.injector.clone()
    }

    /// Index of the cycle currently being prepared.
    #[must_use]
    pub fn current_cycle(&self) -> CycleIndex {
        self.cycle
    }

    /// The previous cycle's counters.
    #[must_use]
    pub fn last_stats(&self) -> CycleStats {
        self.last_stats
    }

    /// The previous cycle's error aggregate.
    #[must_use]
    pub fn last_errors(&self) -> &MultipleExecutionErrors {
        &self.last_errors
    }

    /// Tasks quarantined after emergency termination.
    #[must_use]
    pub fn quarantined(&self) -> &BTreeSet<TaskId> {
        &self.quarantined
    }

    /// Attaches a log sink; buffered records are flushed into it.
    pub fn set_log_sink(&mut self, sink: Box<dyn LogSink>) {
        self.sink = Some(sink);
        self.flush_records();
    }

    /// Takes the sink back, flushing first.
    pub fn take_log_sink(&mut self) -> Option<Box<dyn LogSink>> {
        self.flush_records();
        self.sink.take()
    }

    fn record(&self, method: LogMethod, args: Vec<Value>) {
        self.records.lock().push(LogEntry::now(method, args));
    }

    fn flush_records(&mut self) {
        let entries: Vec<LogEntry> = self.records.lock().drain(..).collect();
        match &mut self.sink {
            Some(sink) => {
                for entry in entries {
                    sink.append(entry);
                }
                sink.flush();
            }
            None => drop(entries),
        }
    }

    fn next_error_id(&mut self) -> u64 {
        let id = self.next_error;
        self.next_error += 1;
        id
    }

    /// Reports a localized error into the engine; it is dispatched in
    /// the error-detection phase of the current cycle. Returns the
    /// error id for causality links.
    pub fn add_error(
        &mut self,
        kind: ExecutionErrorKind,
        locus: ErrorLocus,
        message: impl Into<String>,
    ) -> u64 {
        let task = self.derive_task(&locus);
        let id = self.next_error_id();
        self.cycle_errors
            .push(ExecutionError::new(id, kind, locus, task, message));
        id
    }

    fn push_error(&mut self, error: ExecutionError) {
        self.cycle_errors.push(error);
    }

    fn derive_task(&self, locus: &ErrorLocus) -> Option<TaskId> {
        match locus {
            ErrorLocus::Task(task) => Some(*task),
            ErrorLocus::Generator(gen) => self.plan.generator(*gen).and_then(|g| g.owner()),
            ErrorLocus::Emission(pid) => self.provenance.get(pid).and_then(|info| info.task),
        }
    }

    // ------------------------------------------------------------------
    // Synchronous entry points

    /// Invokes `start!` on a task and drains the resulting propagation
    /// immediately.
    ///
    /// # Errors
    ///
    /// The `CommandFailed` error localized at the start event, when the
    /// command fails before any emission (the task is then
    /// failed-to-start).
    pub fn start_task(&mut self, task: TaskId) -> Result<(), ExecutionError> {
        let start = self
            .plan
            .task_event(task, "start")
            .ok_or_else(|| {
                ExecutionError::new(
                    0,
                    ExecutionErrorKind::CommandFailed,
                    ErrorLocus::Task(task),
                    Some(task),
                    "task has no start event",
                )
            })?;
        self.call_now(start, vec![])
    }

    /// Invokes a command and drains propagation immediately.
    ///
    /// # Errors
    ///
    /// The `CommandFailed` error localized at `target`, if the call
    /// failed.
    pub fn call_now(&mut self, target: GenId, context: Vec<Value>) -> Result<(), ExecutionError> {
        self.queue.push_back(Step {
            kind: StepKind::Call,
            target,
            context,
            sources: Vec::new(),
        });
        self.drain();
        self.extract_error(target, ExecutionErrorKind::CommandFailed)
    }

    /// Emits a generator and drains propagation immediately.
    ///
    /// # Errors
    ///
    /// The `EmissionFailed` error localized at `target`, if the
    /// emission was illegal.
    pub fn emit_now(&mut self, target: GenId, context: Vec<Value>) -> Result<(), ExecutionError> {
        self.queue.push_back(Step {
            kind: StepKind::Emit,
            target,
            context,
            sources: Vec::new(),
        });
        self.drain();
        self.extract_error(target, ExecutionErrorKind::EmissionFailed)
    }

    /// Marks a generator as never-to-emit and runs its if-unreachable
    /// handlers.
    pub fn emit_failed_now(&mut self, target: GenId, reason: &str) {
        self.queue.push_back(Step {
            kind: StepKind::Fail(reason.to_string()),
            target,
            context: Vec::new(),
            sources: Vec::new(),
        });
        self.drain();
    }

    /// Pulls the first matching error out of the cycle buffer so that
    /// it is raised to the caller instead of the error phase.
    fn extract_error(
        &mut self,
        target: GenId,
        kind: ExecutionErrorKind,
    ) -> Result<(), ExecutionError> {
        let position = self
            .cycle_errors
            .iter()
            .position(|e| e.kind == kind && e.locus == ErrorLocus::Generator(target));
        match position {
            Some(index) => Err(self.cycle_errors.remove(index)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // The cycle

    /// Runs one execution cycle and returns its counters.
    pub fn process_events(&mut self) -> CycleStats {
        let mut stats = CycleStats {
            cycle: self.cycle,
            ..CycleStats::default()
        };
        let emissions_before = self.provenance.len() as u64;

        // 1. External injection.
        for op in self.injector.drain() {
            let step = match op {
                ExternalOp::Call { target, context } => Step {
                    kind: StepKind::Call,
                    target,
                    context,
                    sources: Vec::new(),
                },
                ExternalOp::Emit { target, context } => Step {
                    kind: StepKind::Emit,
                    target,
                    context,
                    sources: Vec::new(),
                },
            };
            self.queue.push_back(step);
        }

        // 2. Unreachability notices queued by finalization.
        self.dispatch_pending_unreachable();

        // 3. Scheduled blocks on tasks already running.
        let running: Vec<TaskId> = self
            .plan
            .task_ids()
            .into_iter()
            .filter(|id| {
                !self.quarantined.contains(id)
                    && self.plan.task(*id).is_some_and(|t| t.state().running)
            })
            .collect();
        let polled: HashSet<TaskId> = running.iter().copied().collect();
        for task in running {
            self.run_scheduled_blocks(task);
        }

        // 4. Propagation.
        self.drain();

        // 5. Late polls: a task that became running this cycle polls
        // after its on-start handlers, and at least once even if it
        // already stopped again.
        let late: Vec<TaskId> = self
            .plan
            .task_ids()
            .into_iter()
            .filter(|id| {
                if self.quarantined.contains(id) || polled.contains(id) {
                    return false;
                }
                self.plan.task(*id).is_some_and(|t| {
                    t.started_in_cycle() == Some(self.cycle)
                        && (t.state().running || (t.state().finished && t.poll_count() == 0))
                })
            })
            .collect();
        for task in late {
            self.run_polls(task);
        }
        self.drain();

        stats.emissions = (self.provenance.len() as u64).saturating_sub(emissions_before);

        // 6. Error detection.
        stats.errors = self.detect_errors();

        // 7. Garbage collection.
        let (collected, forced) = self.collect_garbage();
        stats.garbage_collected = collected;
        stats.forced_stops = forced;

        // 8. Bookkeeping.
        let missions: Vec<u64> = self.plan.missions().iter().map(|t| t.as_u64()).collect();
        let permanent: Vec<u64> = self
            .plan
            .permanent_tasks()
            .iter()
            .map(|t| t.as_u64())
            .collect();
        self.record(
            LogMethod::CycleEnd,
            vec![
                json!(self.cycle.as_u64()),
                json!({
                    "emissions": stats.emissions,
                    "errors": stats.errors,
                    "garbaged": stats.garbage_collected,
                    "missions": missions,
                    "permanent_tasks": permanent,
                }),
            ],
        );
        self.flush_records();
        debug!(cycle = %self.cycle, emissions = stats.emissions, errors = stats.errors, "cycle done");
        self.cycle = self.cycle.next();
        self.last_stats = stats;
        stats
    }

    /// Runs cycles back to back, yielding to the async runtime between
    /// them. Handlers never observe a suspension point inside a cycle.
    pub async fn run_cycles(&mut self, count: u64) {
        for _ in 0..count {
            self.process_events();
            tokio::task::yield_now().await;
        }
    }

    /// Whether no work is queued for the next cycle.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.injector.pending() == 0
    }

    fn dispatch_pending_unreachable(&mut self) {
        for (gen, reason, handlers) in self.plan.take_pending_unreachable() {
            for handler in handlers {
                if let Err(err) = (*handler.f)(self, gen, &reason) {
                    let owner = self.plan.generator(gen).and_then(|g| g.owner());
                    self.code_error(owner, gen, &err.to_string());
                }
            }
        }
    }

    fn run_scheduled_blocks(&mut self, task: TaskId) {
        let executes = match self.plan.task_mut(task) {
            Some(t) => t.take_execute_handlers(),
            None => return,
        };
        for handler in executes {
            if let Err(err) = (*handler.f)(self, task) {
                self.task_code_error(task, &err.to_string());
            }
        }
        self.run_polls(task);
    }

    fn run_polls(&mut self, task: TaskId) {
        let eligible = self.plan.task(task).is_some_and(|t| {
            t.state().running || (t.state().finished && t.poll_count() == 0)
        });
        if !eligible {
            return;
        }
        let polls = match self.plan.task(task) {
            Some(t) => t.poll_handlers(),
            None => return,
        };
        if polls.is_empty() {
            return;
        }
        for handler in &polls {
            if let Err(err) = (*handler.f)(self, task) {
                self.task_code_error(task, &err.to_string());
            }
        }
        if let Some(t) = self.plan.task_mut(task) {
            t.bump_poll_count();
        }
    }

    // ------------------------------------------------------------------
    // Propagation

    fn drain(&mut self) {
        let mut processed = 0usize;
        while processed < MAX_STEPS_PER_CYCLE {
            let Some(index) = self.next_unblocked() else {
                break;
            };
            let Some(step) = self.queue.remove(index) else {
                break;
            };
            processed += 1;
            match step.kind {
                StepKind::Call => self.do_call(step.target, step.context, step.sources),
                StepKind::Emit => self.do_emit(step.target, step.context, step.sources),
                StepKind::Fail(reason) => self.do_fail(step.target, &reason),
            }
        }
        if processed >= MAX_STEPS_PER_CYCLE {
            warn!(
                pending = self.queue.len(),
                "propagation step budget exhausted, deferring to next cycle"
            );
        }
    }

    /// First queued step whose target is not ordered after another
    /// pending target by the precedence graph.
    fn next_unblocked(&self) -> Option<usize> {
        let precedence = self.plan.event_graph(EventRelationKind::Precedence);
        (0..self.queue.len()).find(|&candidate| {
            let target = self.queue[candidate].target;
            !self.queue.iter().enumerate().any(|(other, step)| {
                other != candidate
                    && step.target != target
                    && precedence.reaches(&step.target, &target)
            })
        })
    }

    fn executable_generator(&self, gen: GenId) -> bool {
        let Some(generator) = self.plan.generator(gen) else {
            return false;
        };
        if !self.plan.is_executable() {
            return false;
        }
        match generator.owner() {
            Some(task) => self
                .plan
                .task(task)
                .is_some_and(|t| t.executable(true) || t.state().started),
            None => true,
        }
    }

    fn do_call(&mut self, target: GenId, context: Vec<Value>, sources: Vec<PropagationId>) {
        let Some(generator) = self.plan.generator(target) else {
            self.add_error(
                ExecutionErrorKind::CommandFailed,
                ErrorLocus::Generator(target),
                "unknown generator",
            );
            return;
        };
        let symbol = generator.symbol().map(str::to_string);
        let owner = generator.owner();
        let Some(command) = generator.command().cloned() else {
            self.add_error(
                ExecutionErrorKind::CommandFailed,
                ErrorLocus::Generator(target),
                "event is not controllable",
            );
            return;
        };

        // start! is where delayed arguments resolve, so the freeze runs
        // before the executability check; "not yet" values stay
        // delayed and leave the task non-executable.
        if let Some(task) = owner {
            if symbol.as_deref() == Some("start") {
                if let Some(t) = self.plan.task_mut(task) {
                    if t.state().pending {
                        let model = t.model().clone();
                        t.arguments_mut().freeze_delayed(&model).ok();
                    }
                }
            }
        }

        if !self.executable_generator(target) {
            self.command_failure(target, owner, "event is not executable");
            return;
        }
        if let Some(task) = owner {
            if self
                .plan
                .task(task)
                .is_some_and(|t| t.state().finished)
            {
                self.command_failure(target, owner, "task already finished");
                return;
            }
            // start! transition: pending -> starting.
            if symbol.as_deref() == Some("start") {
                let mut status = None;
                if let Some(t) = self.plan.task_mut(task) {
                    if t.state().pending {
                        let state = t.state_mut();
                        state.pending = false;
                        state.starting = true;
                        status = Some((state.label().to_string(), json!(*state)));
                    }
                }
                if let Some((label, flags)) = status {
                    self.record_status(task, &label, flags);
                }
            }
        }

        match command {
            CommandSpec::EmitOnCall => self.do_emit(target, context, sources),
            CommandSpec::Custom(f) => {
                if let Err(err) = (*f)(self, target, context) {
                    self.command_failure(target, owner, &err.to_string());
                }
            }
        }
    }

    /// Command error policy: before the task's first emission the task
    /// fails to start; afterwards it goes through `internal_error`.
    fn command_failure(&mut self, gen: GenId, owner: Option<TaskId>, message: &str) {
        let started = owner
            .and_then(|t| self.plan.task(t))
            .is_some_and(|t| t.state().started);
        let error_id = self.add_error(
            ExecutionErrorKind::CommandFailed,
            ErrorLocus::Generator(gen),
            message,
        );
        match owner {
            Some(task) if !started => {
                self.fail_to_start(task, gen, message);
            }
            Some(task) => {
                self.raise_internal_error(task, message, Some(error_id));
            }
            None => {}
        }
    }

    fn fail_to_start(&mut self, task: TaskId, start_gen: GenId, reason: &str) {
        let Some(t) = self.plan.task_mut(task) else {
            return;
        };
        let state = t.state_mut();
        state.pending = false;
        state.starting = false;
        state.failed_to_start = true;
        state.finished = true;
        state.running = false;
        t.set_failure_reason(warden_plan::FailureReason::Error(reason.to_string()));
        let remote = t.remote_id();
        self.plan
            .garbage_mut()
            .failed_to_start
            .push((remote, reason.to_string()));
        self.record(
            LogMethod::TaskFailedToStart,
            vec![json!(task.as_u64()), json!(reason)],
        );
        warn!(%task, reason, "task failed to start");

        // The start event will never emit.
        if let Some(handlers) = self
            .plan
            .generator_mut(start_gen)
            .and_then(|g| g.mark_unreachable(UnreachableReason::EmitFailed(reason.to_string())))
        {
            self.record(
                LogMethod::GeneratorUnreachable,
                vec![json!(start_gen.as_u64()), json!(reason)],
            );
            for handler in handlers {
                let reason = UnreachableReason::EmitFailed(reason.to_string());
                if let Err(err) = (*handler.f)(self, start_gen, &reason) {
                    self.task_code_error(task, &err.to_string());
                }
            }
        }
    }

    fn do_emit(&mut self, target: GenId, context: Vec<Value>, sources: Vec<PropagationId>) {
        let Some(generator) = self.plan.generator(target) else {
            self.add_error(
                ExecutionErrorKind::EmissionFailed,
                ErrorLocus::Generator(target),
                "unknown generator",
            );
            return;
        };
        let owner = generator.owner();
        let symbol = generator.symbol().map(str::to_string);
        let terminal = generator.is_terminal();
        let flags = generator.flags();

        if generator.is_unreachable() {
            self.add_error(
                ExecutionErrorKind::EmissionFailed,
                ErrorLocus::Generator(target),
                "generator is unreachable",
            );
            return;
        }
        if !self.executable_generator(target) {
            self.add_error(
                ExecutionErrorKind::EmissionFailed,
                ErrorLocus::Generator(target),
                "event is not executable",
            );
            if let Some(task) = owner {
                let started = self.plan.task(task).is_some_and(|t| t.state().started);
                if symbol.as_deref() == Some("start") && !started {
                    self.fail_to_start(task, target, "start emission on non-executable task");
                }
            }
            return;
        }
        if let Some(task) = owner {
            let Some(t) = self.plan.task(task) else {
                return;
            };
            if t.state().finished {
                self.add_error(
                    ExecutionErrorKind::EmissionFailed,
                    ErrorLocus::Generator(target),
                    "task already finished",
                );
                return;
            }
            if t.state().finishing && !terminal {
                self.add_error(
                    ExecutionErrorKind::EmissionFailed,
                    ErrorLocus::Generator(target),
                    "only terminal events may emit while the task finishes",
                );
                return;
            }
        }

        // Provenance closure.
        let pid = PropagationId::from_raw(self.next_propagation);
        self.next_propagation += 1;
        let mut closure: Vec<PropagationId> = Vec::new();
        let mut task_closure: Vec<PropagationId> = Vec::new();
        for source in &sources {
            if let Some(info) = self.provenance.get(source) {
                for id in &info.closure {
                    if !closure.contains(id) {
                        closure.push(*id);
                    }
                }
                for id in &info.task_closure {
                    if !task_closure.contains(id) {
                        task_closure.push(*id);
                    }
                }
            }
        }

        let emission = Emission::new(
            pid,
            target,
            owner,
            context.clone(),
            sources.clone(),
            closure.clone(),
            task_closure.clone(),
        );

        let mut own_closure = closure;
        own_closure.push(pid);
        let mut own_task_closure = task_closure;
        if owner.is_some() {
            own_task_closure.push(pid);
        }
        self.provenance.insert(
            pid,
            SourceInfo {
                closure: own_closure,
                task_closure: own_task_closure,
                task: owner,
            },
        );

        let Some(generator) = self.plan.generator_mut(target) else {
            return;
        };
        generator.record_emission(emission.clone());
        let handlers = generator.emit_handlers();
        generator.clear_once_handlers();

        self.record(
            LogMethod::GeneratorFired,
            vec![
                json!(target.as_u64()),
                json!(pid.as_u64()),
                json!(context),
            ],
        );
        debug!(gen = %target, %pid, "emitted");

        // Task state machine.
        if let Some(task) = owner {
            self.apply_emission_to_task(task, &symbol, flags, terminal, pid);
        }

        // On-emit handlers, registration order.
        let previous_source = self.current_source.replace(pid);
        for handler in handlers {
            if let Err(err) = (*handler.f)(self, &emission) {
                let failing_terminal = symbol.as_deref() == Some("internal_error")
                    || symbol.as_deref() == Some("stop");
                match owner {
                    Some(task) if failing_terminal => {
                        // A handler of the termination chain itself
                        // raised; escalate, keeping the causal link.
                        let id = self.next_error_id();
                        self.push_error(ExecutionError::new(
                            id,
                            ExecutionErrorKind::CodeError,
                            ErrorLocus::Generator(target),
                            Some(task),
                            err.to_string(),
                        ));
                        self.emergency_terminate(task, &err.to_string(), Some(id));
                    }
                    Some(task) => self.task_code_error(task, &err.to_string()),
                    None => {
                        self.code_error(None, target, &err.to_string());
                    }
                }
            }
        }
        self.current_source = previous_source;

        // Propagation: forwards emit, signals call, edge insertion
        // order per relation.
        let forwards: Vec<GenId> = self
            .plan
            .event_graph(EventRelationKind::Forward)
            .children_of(&target)
            .map(|(child, _)| *child)
            .collect();
        for child in forwards {
            self.record(
                LogMethod::GeneratorPropagateEvents,
                vec![json!(pid.as_u64()), json!(child.as_u64()), json!("forward")],
            );
            self.queue.push_back(Step {
                kind: StepKind::Emit,
                target: child,
                context: context.clone(),
                sources: vec![pid],
            });
        }
        let signals: Vec<GenId> = self
            .plan
            .event_graph(EventRelationKind::Signal)
            .children_of(&target)
            .map(|(child, _)| *child)
            .collect();
        for child in signals {
            self.record(
                LogMethod::GeneratorPropagateEvents,
                vec![json!(pid.as_u64()), json!(child.as_u64()), json!("signal")],
            );
            self.queue.push_back(Step {
                kind: StepKind::Call,
                target: child,
                context: context.clone(),
                sources: vec![pid],
            });
        }
    }

    fn apply_emission_to_task(
        &mut self,
        task: TaskId,
        symbol: &Option<String>,
        flags: warden_model::EventInstanceFlags,
        terminal: bool,
        pid: PropagationId,
    ) {
        let cycle = self.cycle;
        let mut status = None;
        {
            let Some(t) = self.plan.task_mut(task) else {
                return;
            };
            let before = t.state().label();
            match symbol.as_deref() {
                Some("start") => {
                    let state = t.state_mut();
                    state.pending = false;
                    state.starting = false;
                    state.started = true;
                    state.running = true;
                    t.set_started_in_cycle(cycle);
                    t.arguments_mut().freeze();
                }
                Some("stop") => {
                    let state = t.state_mut();
                    state.finishing = true;
                    state.finished = true;
                    state.running = false;
                }
                _ => {}
            }
            let state = t.state_mut();
            if flags.success && state.success.is_none() {
                state.success = Some(true);
            }
            if flags.failure && state.success.is_none() {
                state.success = Some(false);
            }
            if symbol.as_deref() == Some("internal_error") {
                state.internal_error = true;
            }
            if terminal {
                state.finishing = true;
            }
            if flags.failure {
                t.set_failure_reason(warden_plan::FailureReason::Emission(pid));
            }
            let after = t.state().label();
            if before != after {
                status = Some((after.to_string(), json!(*t.state())));
            }
        }
        if let Some((label, flags_json)) = status {
            self.record_status(task, &label, flags_json);
        }

        // Dependency monitoring: a forbidden event fails the
        // dependency.
        if let Some(symbol) = symbol {
            let parents: Vec<(TaskId, Value)> = {
                let graph = self.plan.task_graph(TaskRelationKind::Dependency);
                graph
                    .parents_of(&task)
                    .map(|parent| {
                        let info = graph
                            .edge_info(parent, &task)
                            .cloned()
                            .unwrap_or(Value::Null);
                        (*parent, info)
                    })
                    .collect()
            };
            for (parent, info) in parents {
                let Some(info) = DependencyInfo::from_value(&info) else {
                    continue;
                };
                if info.forbidden.iter().any(|s| s == symbol) {
                    let id = self.next_error_id();
                    let error = ExecutionError::new(
                        id,
                        ExecutionErrorKind::ChildFailed,
                        ErrorLocus::Emission(pid),
                        Some(task),
                        format!("child of {parent} emitted forbidden event '{symbol}'"),
                    );
                    self.push_error(error);
                }
            }
        }
    }

    fn record_status(&self, task: TaskId, label: &str, flags: Value) {
        self.record(
            LogMethod::TaskStatusChange,
            vec![json!(task.as_u64()), json!(label), flags],
        );
    }

    fn do_fail(&mut self, target: GenId, reason: &str) {
        let Some(generator) = self.plan.generator_mut(target) else {
            return;
        };
        let owner = generator.owner();
        let symbol = generator.symbol().map(str::to_string);
        let Some(handlers) =
            generator.mark_unreachable(UnreachableReason::EmitFailed(reason.to_string()))
        else {
            return;
        };
        self.record(
            LogMethod::GeneratorEmitFailed,
            vec![json!(target.as_u64()), json!(reason)],
        );
        self.record(
            LogMethod::GeneratorUnreachable,
            vec![json!(target.as_u64()), json!(reason)],
        );

        if let Some(task) = owner {
            let started = self.plan.task(task).is_some_and(|t| t.state().started);
            if symbol.as_deref() == Some("start") && !started {
                self.fail_to_start(task, target, reason);
            } else if self
                .plan
                .task(task)
                .is_some_and(|t| !t.state().finished)
            {
                self.add_error(
                    ExecutionErrorKind::UnreachableEvent,
                    ErrorLocus::Generator(target),
                    reason,
                );
            }

            // Dependency monitoring: a desired event will never come.
            if let Some(symbol) = &symbol {
                let parents: Vec<(TaskId, Value)> = {
                    let graph = self.plan.task_graph(TaskRelationKind::Dependency);
                    graph
                        .parents_of(&task)
                        .map(|parent| {
                            let info = graph
                                .edge_info(parent, &task)
                                .cloned()
                                .unwrap_or(Value::Null);
                            (*parent, info)
                        })
                        .collect()
                };
                for (parent, info) in parents {
                    let Some(info) = DependencyInfo::from_value(&info) else {
                        continue;
                    };
                    if info.desired.iter().any(|s| s == symbol) {
                        let id = self.next_error_id();
                        self.push_error(ExecutionError::new(
                            id,
                            ExecutionErrorKind::ChildFailed,
                            ErrorLocus::Generator(target),
                            Some(task),
                            format!("desired event '{symbol}' of a child of {parent} became unreachable"),
                        ));
                    }
                }
            }
        }

        let reason = UnreachableReason::EmitFailed(reason.to_string());
        for handler in handlers {
            if let Err(err) = (*handler.f)(self, target, &reason) {
                let owner = self.plan.generator(target).and_then(|g| g.owner());
                self.code_error(owner, target, &err.to_string());
            }
        }
    }

    // ------------------------------------------------------------------
    // Failure policy

    fn code_error(&mut self, task: Option<TaskId>, gen: GenId, message: &str) {
        let id = self.next_error_id();
        let error = ExecutionError::new(
            id,
            ExecutionErrorKind::CodeError,
            ErrorLocus::Generator(gen),
            task,
            message,
        );
        self.push_error(error);
        if let Some(task) = task {
            self.raise_internal_error(task, message, Some(id));
        }
    }

    fn task_code_error(&mut self, task: TaskId, message: &str) {
        let id = self.next_error_id();
        self.push_error(ExecutionError::new(
            id,
            ExecutionErrorKind::CodeError,
            ErrorLocus::Task(task),
            Some(task),
            message,
        ));
        self.raise_internal_error(task, message, Some(id));
    }

    /// Routes a captured user error into the task's `internal_error`
    /// event; if the task is already failing terminally, escalates to
    /// emergency termination. `original` is the id of the error this
    /// one derives from, carried into the escalation so the cycle
    /// aggregate keeps the causal chain.
    fn raise_internal_error(&mut self, task: TaskId, message: &str, original: Option<u64>) {
        let Some(t) = self.plan.task(task) else {
            return;
        };
        if t.state().internal_error || t.state().finished {
            self.emergency_terminate(task, message, original);
            return;
        }
        let Some(internal_error) = t.event("internal_error") else {
            return;
        };
        if let Some(t) = self.plan.task_mut(task) {
            t.set_failure_reason(warden_plan::FailureReason::Error(message.to_string()));
        }
        self.queue.push_back(Step {
            kind: StepKind::Emit,
            target: internal_error,
            context: vec![json!(message)],
            sources: Vec::new(),
        });
    }

    /// Even stopping failed: freeze the task and never touch it again.
    /// The termination error references the error that caused it, so
    /// the aggregate's transitive filter surfaces the failure once.
    fn emergency_terminate(&mut self, task: TaskId, message: &str, original: Option<u64>) {
        if !self.quarantined.insert(task) {
            return;
        }
        let id = self.next_error_id();
        let mut error = ExecutionError::new(
            id,
            ExecutionErrorKind::EmergencyTermination,
            ErrorLocus::Task(task),
            Some(task),
            message,
        );
        if let Some(original) = original {
            error = error.caused_by(original);
        }
        self.push_error(error);
        if let Some(t) = self.plan.task_mut(task) {
            let state = t.state_mut();
            state.internal_error = true;
            if state.success.is_none() {
                state.success = Some(false);
            }
            t.set_failure_reason(warden_plan::FailureReason::Error(message.to_string()));
        }
        warn!(%task, message, "emergency termination, task quarantined");
    }

    // ------------------------------------------------------------------
    // Error detection

    fn detect_errors(&mut self) -> usize {
        let errors = std::mem::take(&mut self.cycle_errors);
        let aggregate = MultipleExecutionErrors::new(errors.clone());

        for error in aggregate.original_exceptions() {
            let handled = self.find_repair(error);
            self.record(
                LogMethod::ExceptionNotification,
                vec![
                    json!(warden_types::ErrorCode::code(error)),
                    json!(error.to_string()),
                    json!(error.task.map(|t| t.as_u64())),
                ],
            );
            if handled {
                info!(error = %error, "error covered by a repair task");
                continue;
            }
            warn!(error = %error, "unhandled execution error");
            self.plan
                .garbage_mut()
                .propagated_exceptions
                .push(error.to_string());
            if let Some(task) = error.task {
                self.condemn(task);
            }
        }

        self.last_errors = aggregate;
        errors.len()
    }

    /// A running repair task attached through the error-handling
    /// relation covers the failure.
    fn find_repair(&self, error: &ExecutionError) -> bool {
        let Some(task) = error.task else {
            return false;
        };
        let symbol = match &error.locus {
            ErrorLocus::Generator(gen) => self
                .plan
                .generator(*gen)
                .and_then(|g| g.symbol())
                .map(str::to_string),
            _ => None,
        };
        let graph = self.plan.task_graph(TaskRelationKind::ErrorHandling);
        graph.parents_of(&task).any(|repair| {
            let running = self
                .plan
                .task(*repair)
                .is_some_and(|t| t.state().running && !t.state().finished);
            if !running {
                return false;
            }
            let covered: Vec<String> = graph
                .edge_info(repair, &task)
                .and_then(|info| serde_json::from_value(info.clone()).ok())
                .unwrap_or_default();
            covered.is_empty()
                || symbol
                    .as_ref()
                    .is_some_and(|s| covered.iter().any(|c| c == s))
        })
    }

    /// Marks the failing task and its dependency ancestors for
    /// collection. Mission and permanent marks come off: a condemned
    /// subplan is not a root anymore.
    fn condemn(&mut self, task: TaskId) {
        if let Some(t) = self.plan.task_mut(task) {
            let state = t.state_mut();
            if !state.finished && state.success.is_none() {
                state.success = Some(false);
            }
        }
        let mut to_mark = vec![task];
        let mut seen: HashSet<TaskId> = HashSet::new();
        while let Some(current) = to_mark.pop() {
            if !seen.insert(current) {
                continue;
            }
            self.plan.unmark_mission(current);
            self.plan.unmark_permanent_task(current);
            self.plan.mark_for_gc(current);
            let parents: Vec<TaskId> = self
                .plan
                .task_graph(TaskRelationKind::Dependency)
                .parents_of(&current)
                .copied()
                .collect();
            to_mark.extend(parents);
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection

    /// Removes tasks unreachable from the mission/permanent roots,
    /// stopping running ones first. Returns `(collected, forced_stops)`.
    fn collect_garbage(&mut self) -> (usize, usize) {
        let forced: BTreeSet<TaskId> = self.plan.take_forced_gc().into_iter().collect();
        let roots: Vec<TaskId> = self
            .plan
            .missions()
            .iter()
            .chain(self.plan.permanent_tasks().iter())
            .copied()
            .collect();
        let useful = self
            .plan
            .task_graph(TaskRelationKind::Dependency)
            .descendants(&roots);

        let mut collected = 0usize;
        let mut forced_stops = 0usize;

        for task_id in self.plan.task_ids() {
            if self.quarantined.contains(&task_id) {
                continue;
            }
            if useful.contains(&task_id) && !forced.contains(&task_id) {
                continue;
            }
            let Some(task) = self.plan.task(task_id) else {
                continue;
            };
            if task.state().running && !task.state().finished {
                let stop = task.event("stop");
                let stoppable = stop
                    .and_then(|gen| self.plan.generator(gen))
                    .is_some_and(|g| g.controllable());
                if stoppable {
                    if !task.state().finishing {
                        let stop = stop.expect("checked above");
                        debug!(task = %task_id, "garbage collection stops running task");
                        self.queue.push_back(Step {
                            kind: StepKind::Call,
                            target: stop,
                            context: Vec::new(),
                            sources: Vec::new(),
                        });
                        forced_stops += 1;
                    }
                } else {
                    warn!(task = %task_id, "cannot stop non-interruptible task, quarantining");
                    self.quarantined.insert(task_id);
                }
                continue;
            }

            let remote = task.remote_id();
            self.record(LogMethod::GarbageTask, vec![json!(task_id.as_u64())]);
            self.plan.garbage_mut().garbaged.push(remote);
            if self.plan.remove_task(task_id).is_ok() {
                collected += 1;
            }
        }

        // Free events with no relation left, unless marked permanent.
        let free: Vec<GenId> = self.plan.free_event_ids().collect();
        for gen in free {
            if self.plan.permanent_events().contains(&gen) {
                continue;
            }
            let attached = EventRelationKind::ALL.iter().any(|&kind| {
                let graph = self.plan.event_graph(kind);
                graph.children_of(&gen).next().is_some() || graph.parents_of(&gen).next().is_some()
            });
            if !attached {
                let _ = self.plan.remove_free_event(gen);
                collected += 1;
            }
        }

        (collected, forced_stops)
    }
}

impl EventScope for ExecutionEngine {
    fn emit(&mut self, target: GenId, context: Vec<Value>) -> Result<(), ScopeError> {
        if !self.plan.has_generator(target) {
            return Err(ScopeError::UnknownGenerator(target));
        }
        let sources = self.current_source.map(|pid| vec![pid]).unwrap_or_default();
        self.queue.push_back(Step {
            kind: StepKind::Emit,
            target,
            context,
            sources,
        });
        Ok(())
    }

    fn call(&mut self, target: GenId, context: Vec<Value>) -> Result<(), ScopeError> {
        let Some(generator) = self.plan.generator(target) else {
            return Err(ScopeError::UnknownGenerator(target));
        };
        if !generator.controllable() {
            return Err(ScopeError::NotControllable(target));
        }
        let sources = self.current_source.map(|pid| vec![pid]).unwrap_or_default();
        self.queue.push_back(Step {
            kind: StepKind::Call,
            target,
            context,
            sources,
        });
        Ok(())
    }

    fn emit_failed(&mut self, target: GenId, reason: &str) -> Result<(), ScopeError> {
        if !self.plan.has_generator(target) {
            return Err(ScopeError::UnknownGenerator(target));
        }
        self.queue.push_back(Step {
            kind: StepKind::Fail(reason.to_string()),
            target,
            context: Vec::new(),
            sources: Vec::new(),
        });
        Ok(())
    }

    fn task_event(&self, task: TaskId, symbol: &str) -> Option<GenId> {
        self.plan.task_event(task, symbol)
    }

    fn owner_task(&self, target: GenId) -> Option<TaskId> {
        self.plan.generator(target).and_then(|g| g.owner())
    }

    fn argument(&self, task: TaskId, name: &str) -> Option<Value> {
        self.plan
            .task(task)
            .and_then(|t| t.arguments().get(name).cloned())
    }

    fn emitted(&self, target: GenId) -> bool {
        self.plan
            .generator(target)
            .is_some_and(|g| g.emitted())
    }

    fn cycle(&self) -> CycleIndex {
        self.cycle
    }
}
