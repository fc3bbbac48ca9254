//! Tasks and their state machine flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use warden_event::{EventScope, ExecuteHandler, HandlerResult, PollHandler, ReplacePolicy};
use warden_model::{TaskArguments, TaskModel};
use warden_types::{CycleIndex, GenId, PropagationId, RemoteId, TaskId};

/// Status flags of a task.
///
/// The flags are not mutually exclusive: a finishing task is still
/// running until its `stop` event completes, and a failed-to-start task
/// is failed and finished at once.
///
/// ```text
/// pending ──start!──► starting ──start emitted──► started+running
///    │                    │                            │
///    │ emit_failed /      │                    terminal emission
///    │ pre-emit error     │                            ▼
///    └──────────────► failed_to_start            finishing ──stop──► finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskState {
    /// Not started yet.
    pub pending: bool,
    /// `start!` invoked, `start` not yet emitted.
    pub starting: bool,
    /// `start` emitted at least once.
    pub started: bool,
    /// Between `start` emission and the completion of a stop-family
    /// emission.
    pub running: bool,
    /// A terminal emission began; `stop` has not completed yet.
    pub finishing: bool,
    /// `stop` is in the history.
    pub finished: bool,
    /// Outcome: `Some(true)` success, `Some(false)` failed, `None`
    /// undecided.
    pub success: Option<bool>,
    /// The start event failed or errored before any emission.
    pub failed_to_start: bool,
    /// A handler, poll block or command errored while running.
    pub internal_error: bool,
}

impl TaskState {
    /// The initial state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: true,
            ..Self::default()
        }
    }

    /// Whether the task failed: explicit failure outcome or failure to
    /// start.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.success == Some(false) || self.failed_to_start
    }

    /// Single-word label for logs and status records.
    #[must_use]
    pub fn label(&self) -> &'static str {
        if self.failed_to_start {
            "failed_to_start"
        } else if self.finished {
            "finished"
        } else if self.finishing {
            "finishing"
        } else if self.running {
            "running"
        } else if self.starting {
            "starting"
        } else {
            "pending"
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A failure-classified emission; resolved against the plan's
    /// emission records by id.
    Emission(PropagationId),
    /// A localized error message.
    Error(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emission(id) => write!(f, "failed by emission {id}"),
            Self::Error(message) => write!(f, "{message}"),
        }
    }
}

/// A finalization handler registered on a task, invoked once when the
/// task is removed from its plan.
#[derive(Clone)]
pub struct TaskFinalizationHandler {
    /// The handler body.
    pub f: Arc<dyn Fn(TaskId) + Send + Sync>,
    /// Replacement behavior.
    pub policy: ReplacePolicy,
}

impl TaskFinalizationHandler {
    /// A handler with the default replace policy.
    #[must_use]
    pub fn new(f: impl Fn(TaskId) + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            policy: ReplacePolicy::Default,
        }
    }

    /// Sets the replace policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ReplacePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for TaskFinalizationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFinalizationHandler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// A long-lived activity with lifecycle, owned by a plan.
pub struct Task {
    id: TaskId,
    remote_id: RemoteId,
    model: Arc<TaskModel>,
    arguments: TaskArguments,
    events: BTreeMap<String, GenId>,
    state: TaskState,
    executable_forced_off: bool,
    reusable: bool,
    poll_handlers: Vec<PollHandler>,
    execute_handlers: Vec<ExecuteHandler>,
    finalization_handlers: Vec<TaskFinalizationHandler>,
    failure_reason: Option<FailureReason>,
    started_in_cycle: Option<CycleIndex>,
    poll_count: u64,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("model", &self.model.name())
            .field("state", &self.state.label())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        model: Arc<TaskModel>,
        arguments: TaskArguments,
        events: BTreeMap<String, GenId>,
    ) -> Self {
        let poll_handlers = model.poll_handlers();
        Self {
            id,
            remote_id: RemoteId::new(),
            model,
            arguments,
            events,
            state: TaskState::new(),
            executable_forced_off: false,
            reusable: true,
            poll_handlers,
            execute_handlers: Vec::new(),
            finalization_handlers: Vec::new(),
            failure_reason: None,
            started_in_cycle: None,
            poll_count: 0,
        }
    }

    /// Arena id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Stable cross-process identity.
    #[must_use]
    pub fn remote_id(&self) -> RemoteId {
        self.remote_id
    }

    /// Overrides the stable identity; used by restore paths that must
    /// preserve the identity carried in a dump.
    pub fn set_remote_id(&mut self, remote_id: RemoteId) {
        self.remote_id = remote_id;
    }

    /// The task's model.
    #[must_use]
    pub fn model(&self) -> &Arc<TaskModel> {
        &self.model
    }

    /// The arguments map.
    #[must_use]
    pub fn arguments(&self) -> &TaskArguments {
        &self.arguments
    }

    /// Mutable arguments map. Assignment rules are enforced by the map
    /// itself.
    pub fn arguments_mut(&mut self) -> &mut TaskArguments {
        &mut self.arguments
    }

    /// The status flags.
    #[must_use]
    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Mutable status flags. Engine-facing: the engine owns the state
    /// machine transitions.
    pub fn state_mut(&mut self) -> &mut TaskState {
        &mut self.state
    }

    /// The event generator for `symbol`.
    #[must_use]
    pub fn event(&self, symbol: &str) -> Option<GenId> {
        self.events.get(symbol).copied()
    }

    /// Every `(symbol, generator)` pair, in symbol order.
    pub fn each_event(&self) -> impl Iterator<Item = (&str, GenId)> {
        self.events.iter().map(|(s, id)| (s.as_str(), *id))
    }

    /// Whether the model forbids execution.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.model.is_abstract()
    }

    /// Whether the task may execute: not forced off, not abstract, and
    /// fully instanciated. The plan-level executability is the caller's
    /// input.
    #[must_use]
    pub fn executable(&self, plan_executable: bool) -> bool {
        !self.executable_forced_off
            && plan_executable
            && !self.is_abstract()
            && self.arguments.fully_instanciated(&self.model)
    }

    /// Forces executability off (or lifts the force).
    pub fn force_executable_off(&mut self, off: bool) {
        self.executable_forced_off = off;
    }

    /// Whether the task may be reused by a planning layer.
    #[must_use]
    pub fn reusable(&self) -> bool {
        self.reusable && !self.state.finished && !self.state.failed()
    }

    /// Marks the task non-reusable.
    pub fn do_not_reuse(&mut self) {
        self.reusable = false;
    }

    /// Why the task failed, if it did.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.failure_reason.as_ref()
    }

    /// Records why the task failed; the first reason wins.
    pub fn set_failure_reason(&mut self, reason: FailureReason) {
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason);
        }
    }

    /// Schedules a block for the next cycle on which the task is
    /// running.
    pub fn execute(
        &mut self,
        f: impl Fn(&mut dyn EventScope, TaskId) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.execute_handler(ExecuteHandler::new(f));
    }

    /// Schedules a prepared execute block.
    pub fn execute_handler(&mut self, handler: ExecuteHandler) {
        self.execute_handlers.push(handler);
    }

    /// Adds a poll block, run every cycle the task is running.
    pub fn poll(
        &mut self,
        f: impl Fn(&mut dyn EventScope, TaskId) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.poll_handler(PollHandler::new(f));
    }

    /// Adds a prepared poll block.
    pub fn poll_handler(&mut self, handler: PollHandler) {
        self.poll_handlers.push(handler);
    }

    /// Snapshot of the poll blocks.
    #[must_use]
    pub fn poll_handlers(&self) -> Vec<PollHandler> {
        self.poll_handlers.clone()
    }

    /// Drains the pending execute blocks.
    pub fn take_execute_handlers(&mut self) -> Vec<ExecuteHandler> {
        std::mem::take(&mut self.execute_handlers)
    }

    /// Registers a finalization handler, invoked once when the task is
    /// removed from its plan.
    pub fn when_finalized(&mut self, f: impl Fn(TaskId) + Send + Sync + 'static) {
        self.when_finalized_handler(TaskFinalizationHandler::new(f));
    }

    /// Registers a prepared finalization handler.
    pub fn when_finalized_handler(&mut self, handler: TaskFinalizationHandler) {
        self.finalization_handlers.push(handler);
    }

    /// Finalization handlers, drained when the task leaves its plan.
    pub(crate) fn take_finalization_handlers(&mut self) -> Vec<TaskFinalizationHandler> {
        std::mem::take(&mut self.finalization_handlers)
    }

    /// Cycle on which the task became running, engine bookkeeping.
    #[must_use]
    pub fn started_in_cycle(&self) -> Option<CycleIndex> {
        self.started_in_cycle
    }

    pub fn set_started_in_cycle(&mut self, cycle: CycleIndex) {
        self.started_in_cycle = Some(cycle);
    }

    /// Number of poll invocations so far.
    #[must_use]
    pub fn poll_count(&self) -> u64 {
        self.poll_count
    }

    pub fn bump_poll_count(&mut self) {
        self.poll_count += 1;
    }

    /// Handlers to copy onto a replacement task.
    #[must_use]
    pub(crate) fn handlers_to_copy(
        &self,
        replaced_is_abstract: bool,
    ) -> (
        Vec<PollHandler>,
        Vec<ExecuteHandler>,
        Vec<TaskFinalizationHandler>,
    ) {
        let copies = |policy: ReplacePolicy| policy.copies(replaced_is_abstract);
        (
            self.poll_handlers
                .iter()
                .filter(|h| copies(h.policy))
                .cloned()
                .collect(),
            self.execute_handlers
                .iter()
                .filter(|h| copies(h.policy))
                .cloned()
                .collect(),
            self.finalization_handlers
                .iter()
                .filter(|h| copies(h.policy))
                .cloned()
                .collect(),
        )
    }
}
