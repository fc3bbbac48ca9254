//! The plan: arenas of tasks and generators, relation graphs, and the
//! structural mutation surface.

use crate::error::PlanError;
use crate::generator::EventGenerator;
use crate::graph::RelationGraph;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;
use warden_event::{
    CommandSpec, EmitHandler, EventRelationKind, TaskRelationKind, UnreachableHandler,
    UnreachableReason,
};
use warden_model::{ArgumentValue, TaskArguments, TaskModel};
use warden_types::{GenId, RemoteId, TaskId};

/// One relation edge, for hook notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRef {
    /// An edge between event generators.
    Event {
        /// Relation kind.
        kind: EventRelationKind,
        /// Source generator.
        from: GenId,
        /// Target generator.
        to: GenId,
    },
    /// An edge between tasks.
    Task {
        /// Relation kind.
        kind: TaskRelationKind,
        /// Parent task.
        from: TaskId,
        /// Child task.
        to: TaskId,
    },
}

/// Symmetric hooks around relation mutations.
///
/// `adding_*` failing prevents the mutation; `added_*` failing leaves
/// the mutation in place but surfaces the error to the caller. The
/// DAG cycle check runs before any hook.
#[allow(unused_variables)]
pub trait RelationObserver: Send {
    /// About to add an edge; returning an error vetoes it.
    fn adding_edge(&mut self, edge: &EdgeRef, info: &Value) -> Result<(), PlanError> {
        Ok(())
    }

    /// An edge was added; errors do not remove it.
    fn added_edge(&mut self, edge: &EdgeRef, info: &Value) -> Result<(), PlanError> {
        Ok(())
    }

    /// About to remove an edge; returning an error vetoes it.
    fn removing_edge(&mut self, edge: &EdgeRef) -> Result<(), PlanError> {
        Ok(())
    }

    /// An edge was removed; errors do not restore it.
    fn removed_edge(&mut self, edge: &EdgeRef) -> Result<(), PlanError> {
        Ok(())
    }

    /// An edge's info payload changed.
    fn updated_edge_info(&mut self, edge: &EdgeRef, info: &Value) {}

    /// A task left the plan.
    fn finalized_task(&mut self, task: TaskId, remote: RemoteId) {}

    /// A generator left the plan.
    fn finalized_event(&mut self, gen: GenId, remote: RemoteId) {}
}

/// Edge info of the dependency relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    /// Events the parent needs from the child.
    pub desired: Vec<String>,
    /// Events whose emission fails the dependency.
    pub forbidden: Vec<String>,
    /// Role of the child within the parent.
    pub role: Option<String>,
}

impl Default for DependencyInfo {
    fn default() -> Self {
        Self {
            desired: vec!["success".to_string()],
            forbidden: vec!["failed".to_string()],
            role: None,
        }
    }
}

impl DependencyInfo {
    /// Serializes into an edge info payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Deserializes from an edge info payload.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Buckets tracking what left the plan and why.
#[derive(Debug, Clone, Default)]
pub struct GarbageBuckets {
    /// Tasks removed by garbage collection.
    pub garbaged: Vec<RemoteId>,
    /// Every object finalized out of the plan.
    pub finalized: Vec<RemoteId>,
    /// Tasks that failed to start, with the failure message.
    pub failed_to_start: Vec<(RemoteId, String)>,
    /// Formatted exceptions propagated during execution.
    pub propagated_exceptions: Vec<String>,
}

/// The live set of tasks, free events and relation graphs.
///
/// A plain plan is inert; an **executable** plan is one whose tasks'
/// commands the engine may invoke. All structural mutations go through
/// the plan so that relation hooks and the garbage buckets stay
/// consistent.
pub struct Plan {
    remote_id: RemoteId,
    executable: bool,
    next_task: u64,
    next_gen: u64,
    tasks: HashMap<TaskId, Task>,
    generators: HashMap<GenId, EventGenerator>,
    free_events: BTreeSet<GenId>,
    missions: BTreeSet<TaskId>,
    permanent_tasks: BTreeSet<TaskId>,
    permanent_events: BTreeSet<GenId>,
    signal_graph: RelationGraph<GenId>,
    forward_graph: RelationGraph<GenId>,
    precedence_graph: RelationGraph<GenId>,
    causal_graph: RelationGraph<GenId>,
    dependency_graph: RelationGraph<TaskId>,
    error_handling_graph: RelationGraph<TaskId>,
    planned_by_graph: RelationGraph<TaskId>,
    gc: GarbageBuckets,
    forced_gc: BTreeSet<TaskId>,
    pending_unreachable: Vec<(GenId, UnreachableReason, Vec<UnreachableHandler>)>,
    observers: Vec<Box<dyn RelationObserver>>,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan {
    /// An empty, inert plan.
    #[must_use]
    pub fn new() -> Self {
        let event_graph = || RelationGraph::new(EventRelationKind::Signal.flags());
        Self {
            remote_id: RemoteId::new(),
            executable: false,
            next_task: 1,
            next_gen: 1,
            tasks: HashMap::new(),
            generators: HashMap::new(),
            free_events: BTreeSet::new(),
            missions: BTreeSet::new(),
            permanent_tasks: BTreeSet::new(),
            permanent_events: BTreeSet::new(),
            signal_graph: event_graph(),
            forward_graph: event_graph(),
            precedence_graph: event_graph(),
            causal_graph: event_graph(),
            dependency_graph: RelationGraph::new(TaskRelationKind::Dependency.flags()),
            error_handling_graph: RelationGraph::new(TaskRelationKind::ErrorHandling.flags()),
            planned_by_graph: RelationGraph::new(TaskRelationKind::PlannedBy.flags()),
            gc: GarbageBuckets::default(),
            forced_gc: BTreeSet::new(),
            pending_unreachable: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// An empty plan whose tasks the engine may execute.
    #[must_use]
    pub fn new_executable() -> Self {
        let mut plan = Self::new();
        plan.executable = true;
        plan
    }

    /// Stable identity of the plan.
    #[must_use]
    pub fn remote_id(&self) -> RemoteId {
        self.remote_id
    }

    /// Whether the engine may invoke task commands in this plan.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Switches executability.
    pub fn set_executable(&mut self, executable: bool) {
        self.executable = executable;
    }

    /// Attaches a relation observer.
    pub fn add_observer(&mut self, observer: Box<dyn RelationObserver>) {
        self.observers.push(observer);
    }

    // ------------------------------------------------------------------
    // Object access

    /// Looks up a task.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Looks up a task mutably.
    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Looks up a generator.
    #[must_use]
    pub fn generator(&self, id: GenId) -> Option<&EventGenerator> {
        self.generators.get(&id)
    }

    /// Looks up a generator mutably.
    pub fn generator_mut(&mut self, id: GenId) -> Option<&mut EventGenerator> {
        self.generators.get_mut(&id)
    }

    /// Whether the task is in the plan.
    #[must_use]
    pub fn has_task(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Whether the generator is in the plan.
    #[must_use]
    pub fn has_generator(&self, id: GenId) -> bool {
        self.generators.contains_key(&id)
    }

    /// Every task id, ascending.
    #[must_use]
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Every free event id, ascending.
    pub fn free_event_ids(&self) -> impl Iterator<Item = GenId> + '_ {
        self.free_events.iter().copied()
    }

    /// Number of tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Finds a task by its stable identity.
    #[must_use]
    pub fn find_task_by_remote(&self, remote: RemoteId) -> Option<TaskId> {
        self.tasks
            .values()
            .find(|t| t.remote_id() == remote)
            .map(Task::id)
    }

    /// Resolves a task event generator.
    #[must_use]
    pub fn task_event(&self, task: TaskId, symbol: &str) -> Option<GenId> {
        self.tasks.get(&task)?.event(symbol)
    }

    // ------------------------------------------------------------------
    // Mission and permanent marks

    /// Mission task ids.
    #[must_use]
    pub fn missions(&self) -> &BTreeSet<TaskId> {
        &self.missions
    }

    /// Permanent task ids.
    #[must_use]
    pub fn permanent_tasks(&self) -> &BTreeSet<TaskId> {
        &self.permanent_tasks
    }

    /// Permanent free event ids.
    #[must_use]
    pub fn permanent_events(&self) -> &BTreeSet<GenId> {
        &self.permanent_events
    }

    /// Whether the task is a mission.
    #[must_use]
    pub fn is_mission(&self, task: TaskId) -> bool {
        self.missions.contains(&task)
    }

    /// Marks an existing task as a mission.
    pub fn add_mission_task(&mut self, task: TaskId) -> Result<(), PlanError> {
        if !self.has_task(task) {
            return Err(PlanError::UnknownTask(task));
        }
        self.missions.insert(task);
        Ok(())
    }

    /// Unmarks a mission.
    pub fn unmark_mission(&mut self, task: TaskId) {
        self.missions.remove(&task);
    }

    /// Marks an existing task permanent.
    pub fn add_permanent_task(&mut self, task: TaskId) -> Result<(), PlanError> {
        if !self.has_task(task) {
            return Err(PlanError::UnknownTask(task));
        }
        self.permanent_tasks.insert(task);
        Ok(())
    }

    /// Unmarks a permanent task.
    pub fn unmark_permanent_task(&mut self, task: TaskId) {
        self.permanent_tasks.remove(&task);
    }

    /// Marks an existing free event permanent.
    pub fn add_permanent_event(&mut self, gen: GenId) -> Result<(), PlanError> {
        if !self.has_generator(gen) {
            return Err(PlanError::UnknownGenerator(gen));
        }
        self.permanent_events.insert(gen);
        Ok(())
    }

    /// Unmarks a permanent event.
    pub fn unmark_permanent_event(&mut self, gen: GenId) {
        self.permanent_events.remove(&gen);
    }

    // ------------------------------------------------------------------
    // Object creation and removal

    /// Instantiates a task from its model, assigning the initial
    /// arguments through the parallel-assignment protocol (setters are
    /// not called for delayed initial values).
    ///
    /// Materializes the model's event set, its declared relations, and
    /// the precedence skeleton: `start` precedes every root
    /// intermediate event, and every leaf intermediate event precedes
    /// every root terminal event.
    ///
    /// # Errors
    ///
    /// Argument errors from the initial assignment; structural errors
    /// from the model's relation declarations.
    pub fn add_task(
        &mut self,
        model: &Arc<TaskModel>,
        initial: Vec<(String, ArgumentValue)>,
    ) -> Result<TaskId, PlanError> {
        let mut arguments = TaskArguments::from_model(model);
        arguments.assign(model, initial)?;

        let task_id = TaskId::from_raw(self.next_task);
        self.next_task += 1;

        let flags = model.instance_flags();
        let mut events = BTreeMap::new();
        for decl in model.events() {
            let gen_id = GenId::from_raw(self.next_gen);
            self.next_gen += 1;
            let mut generator = EventGenerator::new(
                gen_id,
                Some(decl.symbol.clone()),
                decl.command.clone(),
                Some(task_id),
                flags.get(&decl.symbol).copied().unwrap_or_default(),
            );
            for handler in model.handlers_for(&decl.symbol) {
                generator.on_handler(handler);
            }
            self.generators.insert(gen_id, generator);
            events.insert(decl.symbol.clone(), gen_id);
        }

        let task = Task::new(task_id, model.clone(), arguments, events.clone());
        self.tasks.insert(task_id, task);
        debug!(task = %task_id, model = model.name(), "added task");

        // Model-declared relations. The built-in internal_error
        // forward targets stop only while stop has no command: a
        // scripted stop may not be bypassed, so the failure is forced
        // through failed instead and the failed -> stop chain completes
        // the termination.
        for relation in model.relations() {
            let from = events[&relation.from];
            let mut to = events[&relation.to];
            if relation.kind == EventRelationKind::Forward
                && relation.from == "internal_error"
                && relation.to == "stop"
                && self.generators[&to].controllable()
            {
                if let Some(&failed) = events.get("failed") {
                    to = failed;
                }
            }
            self.add_event_edge(relation.kind, from, to, Value::Null)?;
        }

        // Precedence skeleton. Forward topology is computed on the
        // task's own events only.
        let forward = &self.forward_graph;
        let internal: BTreeSet<GenId> = events.values().copied().collect();
        let has_internal_parent = |gen: GenId| {
            forward
                .parents_of(&gen)
                .any(|parent| internal.contains(parent))
        };
        let has_internal_child = |gen: GenId| {
            forward
                .children_of(&gen)
                .any(|(child, _)| internal.contains(child))
        };

        let start = events["start"];
        let mut root_intermediate = Vec::new();
        let mut leaf_intermediate = Vec::new();
        let mut root_terminal = Vec::new();
        for (symbol, &gen) in &events {
            if symbol == "start" {
                continue;
            }
            let terminal = self.generators[&gen].is_terminal();
            if terminal {
                if !has_internal_parent(gen) {
                    root_terminal.push(gen);
                }
            } else {
                if !has_internal_parent(gen) {
                    root_intermediate.push(gen);
                }
                if !has_internal_child(gen) {
                    leaf_intermediate.push(gen);
                }
            }
        }
        for gen in root_intermediate {
            self.add_event_edge(EventRelationKind::Precedence, start, gen, Value::Null)?;
        }
        for &intermediate in &leaf_intermediate {
            for &terminal in &root_terminal {
                self.add_event_edge(
                    EventRelationKind::Precedence,
                    intermediate,
                    terminal,
                    Value::Null,
                )?;
            }
        }

        Ok(task_id)
    }

    /// Adds a free event generator.
    pub fn add_free_event(
        &mut self,
        symbol: Option<&str>,
        command: Option<CommandSpec>,
    ) -> GenId {
        let gen_id = GenId::from_raw(self.next_gen);
        self.next_gen += 1;
        let generator = EventGenerator::new(
            gen_id,
            symbol.map(str::to_string),
            command,
            None,
            Default::default(),
        );
        self.generators.insert(gen_id, generator);
        self.free_events.insert(gen_id);
        debug!(gen = %gen_id, "added free event");
        gen_id
    }

    /// Removes a task: detaches every relation edge incident to it or
    /// its events, runs finalization handlers, marks non-emitted
    /// generators unreachable with the `Finalized` cause, and moves the
    /// identities into the finalized bucket.
    ///
    /// # Errors
    ///
    /// [`PlanError::UnknownTask`] when the task is not in the plan.
    pub fn remove_task(&mut self, task_id: TaskId) -> Result<(), PlanError> {
        if !self.has_task(task_id) {
            return Err(PlanError::UnknownTask(task_id));
        }
        let gen_ids: Vec<GenId> = self.tasks[&task_id]
            .each_event()
            .map(|(_, gen)| gen)
            .collect();

        for &gen in &gen_ids {
            self.detach_generator(gen);
        }
        for kind in TaskRelationKind::ALL {
            let removed = self.task_graph_mut(kind).remove_vertex(&task_id);
            for (from, to, _) in removed {
                self.notify(|o| o.removed_edge(&EdgeRef::Task { kind, from, to }));
            }
        }

        self.missions.remove(&task_id);
        self.permanent_tasks.remove(&task_id);
        self.forced_gc.remove(&task_id);

        for gen in gen_ids {
            self.finalize_generator(gen);
        }

        let mut task = self.tasks.remove(&task_id).expect("checked above");
        for handler in task.take_finalization_handlers() {
            (*handler.f)(task_id);
        }
        let remote = task.remote_id();
        self.gc.finalized.push(remote);
        self.observers_notify_finalized_task(task_id, remote);
        debug!(task = %task_id, "finalized task");
        Ok(())
    }

    /// Removes a free event generator.
    ///
    /// # Errors
    ///
    /// [`PlanError::UnknownGenerator`] when the generator is not a free
    /// event of this plan.
    pub fn remove_free_event(&mut self, gen: GenId) -> Result<(), PlanError> {
        if !self.free_events.remove(&gen) {
            return Err(PlanError::UnknownGenerator(gen));
        }
        self.permanent_events.remove(&gen);
        self.detach_generator(gen);
        self.finalize_generator(gen);
        Ok(())
    }

    /// Removes every event edge incident to `gen`, with hooks.
    fn detach_generator(&mut self, gen: GenId) {
        for kind in EventRelationKind::ALL {
            let removed = self.event_graph_mut(kind).remove_vertex(&gen);
            for (from, to, _) in removed {
                self.notify(|o| o.removed_edge(&EdgeRef::Event { kind, from, to }));
            }
        }
    }

    /// Runs finalization handlers, queues unreachability notification
    /// for non-emitted generators, and drops the generator.
    fn finalize_generator(&mut self, gen_id: GenId) {
        let Some(mut generator) = self.generators.remove(&gen_id) else {
            return;
        };
        for handler in generator.take_finalization_handlers() {
            (*handler.f)(gen_id);
        }
        if !generator.emitted() {
            if let Some(handlers) = generator.mark_unreachable(UnreachableReason::Finalized) {
                if !handlers.is_empty() {
                    self.pending_unreachable
                        .push((gen_id, UnreachableReason::Finalized, handlers));
                }
            }
        }
        let remote = generator.remote_id();
        self.gc.finalized.push(remote);
        self.observers_notify_finalized_event(gen_id, remote);
    }

    // ------------------------------------------------------------------
    // Relation graphs

    /// The graph of one event relation kind.
    #[must_use]
    pub fn event_graph(&self, kind: EventRelationKind) -> &RelationGraph<GenId> {
        match kind {
            EventRelationKind::Signal => &self.signal_graph,
            EventRelationKind::Forward => &self.forward_graph,
            EventRelationKind::Precedence => &self.precedence_graph,
            EventRelationKind::CausalLink => &self.causal_graph,
        }
    }

    fn event_graph_mut(&mut self, kind: EventRelationKind) -> &mut RelationGraph<GenId> {
        match kind {
            EventRelationKind::Signal => &mut self.signal_graph,
            EventRelationKind::Forward => &mut self.forward_graph,
            EventRelationKind::Precedence => &mut self.precedence_graph,
            EventRelationKind::CausalLink => &mut self.causal_graph,
        }
    }

    /// The graph of one task relation kind.
    #[must_use]
    pub fn task_graph(&self, kind: TaskRelationKind) -> &RelationGraph<TaskId> {
        match kind {
            TaskRelationKind::Dependency => &self.dependency_graph,
            TaskRelationKind::ErrorHandling => &self.error_handling_graph,
            TaskRelationKind::PlannedBy => &self.planned_by_graph,
        }
    }

    fn task_graph_mut(&mut self, kind: TaskRelationKind) -> &mut RelationGraph<TaskId> {
        match kind {
            TaskRelationKind::Dependency => &mut self.dependency_graph,
            TaskRelationKind::ErrorHandling => &mut self.error_handling_graph,
            TaskRelationKind::PlannedBy => &mut self.planned_by_graph,
        }
    }

    fn notify(&mut self, mut f: impl FnMut(&mut dyn RelationObserver) -> Result<(), PlanError>) {
        let mut observers = std::mem::take(&mut self.observers);
        for observer in &mut observers {
            let _ = f(observer.as_mut());
        }
        self.observers = observers;
    }

    fn notify_fallible(
        &mut self,
        mut f: impl FnMut(&mut dyn RelationObserver) -> Result<(), PlanError>,
    ) -> Result<(), PlanError> {
        let mut observers = std::mem::take(&mut self.observers);
        let mut result = Ok(());
        for observer in &mut observers {
            if let Err(err) = f(observer.as_mut()) {
                result = Err(err);
                break;
            }
        }
        self.observers = observers;
        result
    }

    fn observers_notify_finalized_task(&mut self, task: TaskId, remote: RemoteId) {
        let mut observers = std::mem::take(&mut self.observers);
        for observer in &mut observers {
            observer.finalized_task(task, remote);
        }
        self.observers = observers;
    }

    fn observers_notify_finalized_event(&mut self, gen: GenId, remote: RemoteId) {
        let mut observers = std::mem::take(&mut self.observers);
        for observer in &mut observers {
            observer.finalized_event(gen, remote);
        }
        self.observers = observers;
    }

    /// Adds an event relation edge.
    ///
    /// Adding an edge that already exists updates its info payload and
    /// fires `updated_edge_info`. The DAG cycle check runs before any
    /// hook; a vetoing `adding_edge` hook leaves the graph untouched; a
    /// failing `added_edge` hook leaves the edge in place and surfaces
    /// the error.
    ///
    /// # Errors
    ///
    /// [`PlanError::CycleFound`], [`PlanError::UnknownGenerator`], and
    /// [`PlanError::ModelViolation`] for a signal edge whose terminal
    /// source targets a non-terminal event.
    pub fn add_event_edge(
        &mut self,
        kind: EventRelationKind,
        from: GenId,
        to: GenId,
        info: Value,
    ) -> Result<(), PlanError> {
        let from_terminal = self
            .generators
            .get(&from)
            .ok_or(PlanError::UnknownGenerator(from))?
            .is_terminal();
        let to_terminal = self
            .generators
            .get(&to)
            .ok_or(PlanError::UnknownGenerator(to))?
            .is_terminal();
        if kind == EventRelationKind::Signal && from_terminal && !to_terminal {
            return Err(PlanError::ModelViolation(format!(
                "signal edge from terminal {from} to non-terminal {to}"
            )));
        }

        let edge = EdgeRef::Event { kind, from, to };
        let graph = self.event_graph(kind);
        if graph.has_edge(&from, &to) {
            if graph.edge_info(&from, &to) != Some(&info) {
                self.event_graph_mut(kind).set_info(&from, &to, info.clone());
                self.notify(|o| {
                    o.updated_edge_info(&edge, &info);
                    Ok(())
                });
            }
            return Ok(());
        }
        if graph.would_cycle(&from, &to) {
            return Err(PlanError::CycleFound {
                relation: kind.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.notify_fallible(|o| o.adding_edge(&edge, &info))?;
        self.event_graph_mut(kind).insert(from, to, info.clone());
        self.notify_fallible(|o| o.added_edge(&edge, &info))
    }

    /// Removes an event relation edge. Returns its info payload.
    ///
    /// # Errors
    ///
    /// A vetoing `removing_edge` hook.
    pub fn remove_event_edge(
        &mut self,
        kind: EventRelationKind,
        from: GenId,
        to: GenId,
    ) -> Result<Option<Value>, PlanError> {
        if !self.event_graph(kind).has_edge(&from, &to) {
            return Ok(None);
        }
        let edge = EdgeRef::Event { kind, from, to };
        self.notify_fallible(|o| o.removing_edge(&edge))?;
        let info = self.event_graph_mut(kind).remove(&from, &to);
        self.notify(|o| o.removed_edge(&edge));
        Ok(info)
    }

    /// Adds a task relation edge, with the same hook and DAG semantics
    /// as [`add_event_edge`](Self::add_event_edge).
    ///
    /// # Errors
    ///
    /// [`PlanError::CycleFound`], [`PlanError::UnknownTask`].
    pub fn add_task_edge(
        &mut self,
        kind: TaskRelationKind,
        from: TaskId,
        to: TaskId,
        info: Value,
    ) -> Result<(), PlanError> {
        if !self.has_task(from) {
            return Err(PlanError::UnknownTask(from));
        }
        if !self.has_task(to) {
            return Err(PlanError::UnknownTask(to));
        }

        let edge = EdgeRef::Task { kind, from, to };
        let graph = self.task_graph(kind);
        if graph.has_edge(&from, &to) {
            if graph.edge_info(&from, &to) != Some(&info) {
                self.task_graph_mut(kind).set_info(&from, &to, info.clone());
                self.notify(|o| {
                    o.updated_edge_info(&edge, &info);
                    Ok(())
                });
            }
            return Ok(());
        }
        if graph.would_cycle(&from, &to) {
            return Err(PlanError::CycleFound {
                relation: kind.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.notify_fallible(|o| o.adding_edge(&edge, &info))?;
        self.task_graph_mut(kind).insert(from, to, info.clone());
        self.notify_fallible(|o| o.added_edge(&edge, &info))
    }

    /// Removes a task relation edge. Returns its info payload.
    ///
    /// # Errors
    ///
    /// A vetoing `removing_edge` hook.
    pub fn remove_task_edge(
        &mut self,
        kind: TaskRelationKind,
        from: TaskId,
        to: TaskId,
    ) -> Result<Option<Value>, PlanError> {
        if !self.task_graph(kind).has_edge(&from, &to) {
            return Ok(None);
        }
        let edge = EdgeRef::Task { kind, from, to };
        self.notify_fallible(|o| o.removing_edge(&edge))?;
        let info = self.task_graph_mut(kind).remove(&from, &to);
        self.notify(|o| o.removed_edge(&edge));
        Ok(info)
    }

    /// Declares that `parent` depends on `child`.
    ///
    /// # Errors
    ///
    /// Same as [`add_task_edge`](Self::add_task_edge).
    pub fn add_dependency(
        &mut self,
        parent: TaskId,
        child: TaskId,
        info: DependencyInfo,
    ) -> Result<(), PlanError> {
        self.add_task_edge(TaskRelationKind::Dependency, parent, child, info.to_value())
    }

    /// Associates a repair task with failures of `failing`, restricted
    /// to the given event symbols (empty = all).
    ///
    /// # Errors
    ///
    /// Same as [`add_task_edge`](Self::add_task_edge).
    pub fn add_error_handler(
        &mut self,
        repair: TaskId,
        failing: TaskId,
        symbols: Vec<String>,
    ) -> Result<(), PlanError> {
        self.add_task_edge(
            TaskRelationKind::ErrorHandling,
            repair,
            failing,
            serde_json::to_value(symbols).unwrap_or(Value::Null),
        )
    }

    /// Sugar for a signal edge: emitting `from` calls `to`'s command.
    ///
    /// # Errors
    ///
    /// Same as [`add_event_edge`](Self::add_event_edge).
    pub fn signals(&mut self, from: GenId, to: GenId) -> Result<(), PlanError> {
        self.add_event_edge(EventRelationKind::Signal, from, to, Value::Null)
    }

    /// Sugar for a forward edge: emitting `from` emits `to`.
    ///
    /// # Errors
    ///
    /// Same as [`add_event_edge`](Self::add_event_edge).
    pub fn forward_to(&mut self, from: GenId, to: GenId) -> Result<(), PlanError> {
        self.add_event_edge(EventRelationKind::Forward, from, to, Value::Null)
    }

    // ------------------------------------------------------------------
    // Achievement

    /// Makes `achiever` emit when `source` emits, and fail when
    /// `source` becomes unreachable first.
    ///
    /// # Errors
    ///
    /// [`PlanError::UnknownGenerator`] for either endpoint.
    pub fn achieve_with(&mut self, achiever: GenId, source: GenId) -> Result<(), PlanError> {
        if !self.has_generator(achiever) {
            return Err(PlanError::UnknownGenerator(achiever));
        }
        let source_gen = self
            .generators
            .get_mut(&source)
            .ok_or(PlanError::UnknownGenerator(source))?;

        source_gen.on_handler(
            EmitHandler::new(move |scope, emission| {
                scope.emit(achiever, emission.context.clone())?;
                Ok(())
            })
            .once(),
        );
        source_gen.if_unreachable_handler(UnreachableHandler::new(
            true,
            move |scope, gen, reason| {
                scope.emit_failed(achiever, &format!("achievement through {gen} failed: {reason}"))?;
                Ok(())
            },
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Engine-facing bookkeeping

    /// The garbage buckets.
    #[must_use]
    pub fn garbage(&self) -> &GarbageBuckets {
        &self.gc
    }

    /// Mutable garbage buckets. Engine-facing.
    pub fn garbage_mut(&mut self) -> &mut GarbageBuckets {
        &mut self.gc
    }

    /// Queues a task for forced garbage collection on the next cycle.
    pub fn mark_for_gc(&mut self, task: TaskId) {
        self.forced_gc.insert(task);
    }

    /// Drains the forced-collection queue. Engine-facing.
    pub fn take_forced_gc(&mut self) -> Vec<TaskId> {
        let drained: Vec<TaskId> = self.forced_gc.iter().copied().collect();
        self.forced_gc.clear();
        drained
    }

    /// Drains unreachability notifications produced by finalization.
    /// Engine-facing: the engine runs the handlers.
    pub fn take_pending_unreachable(
        &mut self,
    ) -> Vec<(GenId, UnreachableReason, Vec<UnreachableHandler>)> {
        std::mem::take(&mut self.pending_unreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plain_model() -> Arc<TaskModel> {
        TaskModel::builder("plain").build().unwrap()
    }

    #[test]
    fn add_task_materializes_events() {
        let mut plan = Plan::new();
        let task_id = plan.add_task(&plain_model(), vec![]).unwrap();
        let task = plan.task(task_id).unwrap();
        for symbol in ["start", "stop", "success", "failed", "aborted", "internal_error"] {
            assert!(task.event(symbol).is_some(), "missing {symbol}");
        }
        let start = task.event("start").unwrap();
        assert!(plan.generator(start).unwrap().controllable());
        assert!(!plan.generator(task.event("stop").unwrap()).unwrap().controllable());
    }

    #[test]
    fn add_task_materializes_builtin_forwards() {
        let mut plan = Plan::new();
        let task_id = plan.add_task(&plain_model(), vec![]).unwrap();
        let task = plan.task(task_id).unwrap();
        let success = task.event("success").unwrap();
        let stop = task.event("stop").unwrap();
        let failed = task.event("failed").unwrap();
        let aborted = task.event("aborted").unwrap();
        let forward = plan.event_graph(EventRelationKind::Forward);
        assert!(forward.has_edge(&success, &stop));
        assert!(forward.has_edge(&failed, &stop));
        assert!(forward.has_edge(&aborted, &failed));
    }

    #[test]
    fn precedence_skeleton_orders_start_and_terminals() {
        let mut plan = Plan::new();
        let task_id = plan.add_task(&plain_model(), vec![]).unwrap();
        let task = plan.task(task_id).unwrap();
        let start = task.event("start").unwrap();
        let updated = task.event("updated_data").unwrap();
        let success = task.event("success").unwrap();
        let stop = task.event("stop").unwrap();
        let precedence = plan.event_graph(EventRelationKind::Precedence);
        // start precedes root intermediates
        assert!(precedence.has_edge(&start, &updated));
        // leaf intermediates precede root terminals
        assert!(precedence.has_edge(&updated, &success));
        // stop has a forward parent, so it is not a root terminal
        assert!(!precedence.has_edge(&updated, &stop));
    }

    #[test]
    fn internal_error_forward_depends_on_stop_command() {
        let mut plan = Plan::new();
        let plain = plan.add_task(&plain_model(), vec![]).unwrap();
        let scripted_model = TaskModel::builder("scripted").terminates().build().unwrap();
        let scripted = plan.add_task(&scripted_model, vec![]).unwrap();

        let event = |task, symbol| plan.task(task).unwrap().event(symbol).unwrap();
        let forward = plan.event_graph(EventRelationKind::Forward);

        // stop has no command: internal_error forwards into it directly.
        assert!(forward.has_edge(&event(plain, "internal_error"), &event(plain, "stop")));
        // A scripted stop may not be bypassed: the failure is forced
        // through failed, whose forward completes the chain.
        assert!(!forward.has_edge(&event(scripted, "internal_error"), &event(scripted, "stop")));
        assert!(forward.has_edge(
            &event(scripted, "internal_error"),
            &event(scripted, "failed")
        ));
        assert!(forward.has_edge(&event(scripted, "failed"), &event(scripted, "stop")));
    }

    #[test]
    fn dag_relation_rejects_cycles_and_keeps_edges() {
        let mut plan = Plan::new();
        let a = plan.add_free_event(Some("a"), None);
        let b = plan.add_free_event(Some("b"), None);
        let c = plan.add_free_event(Some("c"), None);
        let kind = EventRelationKind::Forward;

        plan.add_event_edge(kind, a, b, Value::Null).unwrap();
        plan.add_event_edge(kind, b, c, Value::Null).unwrap();
        let err = plan.add_event_edge(kind, c, a, Value::Null).unwrap_err();
        assert!(matches!(err, PlanError::CycleFound { .. }));

        let graph = plan.event_graph(kind);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.has_edge(&a, &b));
        assert!(graph.has_edge(&b, &c));
        assert!(!graph.has_edge(&c, &a));
    }

    #[test]
    fn signal_from_terminal_to_non_terminal_is_rejected() {
        let mut plan = Plan::new();
        let task_id = plan.add_task(&plain_model(), vec![]).unwrap();
        let task = plan.task(task_id).unwrap();
        let success = task.event("success").unwrap();
        let updated = task.event("updated_data").unwrap();
        let err = plan
            .add_event_edge(EventRelationKind::Signal, success, updated, Value::Null)
            .unwrap_err();
        assert!(matches!(err, PlanError::ModelViolation(_)));
    }

    struct VetoingObserver;
    impl RelationObserver for VetoingObserver {
        fn adding_edge(&mut self, _: &EdgeRef, _: &Value) -> Result<(), PlanError> {
            Err(PlanError::ModelViolation("vetoed".into()))
        }
    }

    #[test]
    fn vetoing_hook_prevents_the_edge() {
        let mut plan = Plan::new();
        let a = plan.add_free_event(Some("a"), None);
        let b = plan.add_free_event(Some("b"), None);
        plan.add_observer(Box::new(VetoingObserver));
        let err = plan
            .add_event_edge(EventRelationKind::Forward, a, b, Value::Null)
            .unwrap_err();
        assert!(matches!(err, PlanError::ModelViolation(_)));
        assert!(!plan
            .event_graph(EventRelationKind::Forward)
            .has_edge(&a, &b));
    }

    struct FailingAddedObserver;
    impl RelationObserver for FailingAddedObserver {
        fn added_edge(&mut self, _: &EdgeRef, _: &Value) -> Result<(), PlanError> {
            Err(PlanError::ModelViolation("late".into()))
        }
    }

    #[test]
    fn failing_added_hook_keeps_the_edge() {
        let mut plan = Plan::new();
        let a = plan.add_free_event(Some("a"), None);
        let b = plan.add_free_event(Some("b"), None);
        plan.add_observer(Box::new(FailingAddedObserver));
        let err = plan
            .add_event_edge(EventRelationKind::Forward, a, b, Value::Null)
            .unwrap_err();
        assert!(matches!(err, PlanError::ModelViolation(_)));
        assert!(plan
            .event_graph(EventRelationKind::Forward)
            .has_edge(&a, &b));
    }

    #[test]
    fn duplicate_edge_updates_info_only() {
        let mut plan = Plan::new();
        let a = plan.add_free_event(Some("a"), None);
        let b = plan.add_free_event(Some("b"), None);
        let kind = EventRelationKind::CausalLink;
        plan.add_event_edge(kind, a, b, serde_json::json!(1)).unwrap();
        plan.add_event_edge(kind, a, b, serde_json::json!(2)).unwrap();
        let graph = plan.event_graph(kind);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edge_info(&a, &b), Some(&serde_json::json!(2)));
    }

    #[test]
    fn remove_task_finalizes_and_detaches() {
        let mut plan = Plan::new();
        let t1 = plan.add_task(&plain_model(), vec![]).unwrap();
        let t2 = plan.add_task(&plain_model(), vec![]).unwrap();
        plan.add_dependency(t1, t2, DependencyInfo::default()).unwrap();

        let finalized = Arc::new(AtomicUsize::new(0));
        let counter = finalized.clone();
        plan.task_mut(t2)
            .unwrap()
            .when_finalized(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let start2 = plan.task(t2).unwrap().event("start").unwrap();
        plan.remove_task(t2).unwrap();

        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(plan.task(t2).is_none());
        assert!(plan.generator(start2).is_none());
        assert!(!plan
            .task_graph(TaskRelationKind::Dependency)
            .has_edge(&t1, &t2));
        assert!(!plan.garbage().finalized.is_empty());
        assert!(plan.remove_task(t2).is_err());
    }

    #[test]
    fn finalizing_non_emitted_generator_queues_unreachability() {
        let mut plan = Plan::new();
        let gen = plan.add_free_event(Some("never"), None);
        plan.generator_mut(gen)
            .unwrap()
            .if_unreachable(false, |_, _, _| Ok(()));
        plan.remove_free_event(gen).unwrap();

        let pending = plan.take_pending_unreachable();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, gen);
        assert_eq!(pending[0].1, UnreachableReason::Finalized);
        assert_eq!(pending[0].2.len(), 1);
    }

    #[test]
    fn mission_marks_require_membership() {
        let mut plan = Plan::new();
        assert!(plan.add_mission_task(TaskId::from_raw(99)).is_err());
        let t = plan.add_task(&plain_model(), vec![]).unwrap();
        plan.add_mission_task(t).unwrap();
        assert!(plan.is_mission(t));
        plan.unmark_mission(t);
        assert!(!plan.is_mission(t));
    }
}
