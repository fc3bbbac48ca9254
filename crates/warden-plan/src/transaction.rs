//! Staged, atomic plan mutations.
//!
//! A transaction shadows a plan with an overlay of staged operations.
//! Plan objects are wrapped lazily: a task proxy exists once the task
//! is explicitly accessed, an event proxy only once one of its
//! relations is altered, a staged handler references it, or a staged
//! replacement needs it. Commit replays the staged operations against
//! the live plan, with the same relation hooks as direct mutation, and
//! is atomic: structural validity is established against the merged
//! view before the first mutation is applied.

use crate::error::PlanError;
use crate::plan::Plan;
use crate::replace::{compute_replace, GraphView, ReplaceMode};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;
use warden_event::{EmitHandler, EventRelationKind, TaskRelationKind};
use warden_model::{ArgumentValue, TaskArguments, TaskModel};
use warden_types::{GenId, RemoteId, TaskId};

/// A task as seen by a transaction: wrapped from the plan, or created
/// inside the transaction and materialized at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxTask {
    /// Proxy of a plan task.
    Real(TaskId),
    /// Task staged in this transaction, by staging index.
    New(u32),
}

/// An event generator as seen by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TxGen {
    /// Proxy of a plan generator.
    Real(GenId),
    /// Event of a staged task.
    New {
        /// Staging index of the owning task.
        task: u32,
        /// Event symbol.
        symbol: String,
    },
}

struct NewTaskSpec {
    model: Arc<TaskModel>,
    initial: Vec<(String, ArgumentValue)>,
}

enum StagedOp {
    AddEventEdge {
        kind: EventRelationKind,
        from: TxGen,
        to: TxGen,
        info: Value,
    },
    RemoveEventEdge {
        kind: EventRelationKind,
        from: TxGen,
        to: TxGen,
    },
    AddTaskEdge {
        kind: TaskRelationKind,
        from: TxTask,
        to: TxTask,
        info: Value,
    },
    RemoveTaskEdge {
        kind: TaskRelationKind,
        from: TxTask,
        to: TxTask,
    },
    AddEmitHandler {
        gen: TxGen,
        handler: EmitHandler,
    },
    RemoveTask(TaskId),
    AddMission(TxTask),
    AddPermanentTask(TxTask),
    AssignArguments {
        task: TaskId,
        args: Vec<(String, ArgumentValue)>,
    },
    Replace {
        old: TaskId,
        new: TxTask,
        mode: ReplaceMode,
    },
}

/// A staged set of plan mutations, committed atomically or discarded.
pub struct Transaction {
    base: RemoteId,
    wrapped_tasks: BTreeSet<TaskId>,
    wrapped_gens: BTreeSet<GenId>,
    arg_snapshots: HashMap<TaskId, TaskArguments>,
    new_tasks: Vec<NewTaskSpec>,
    removed_tasks: BTreeSet<TaskId>,
    staged: Vec<StagedOp>,
}

impl Transaction {
    /// Opens a transaction over `plan`. The plan is not borrowed: reads
    /// pass it explicitly, and commit takes it mutably.
    #[must_use]
    pub fn new(plan: &Plan) -> Self {
        Self {
            base: plan.remote_id(),
            wrapped_tasks: BTreeSet::new(),
            wrapped_gens: BTreeSet::new(),
            arg_snapshots: HashMap::new(),
            new_tasks: Vec::new(),
            removed_tasks: BTreeSet::new(),
            staged: Vec::new(),
        }
    }

    /// Tasks wrapped so far.
    #[must_use]
    pub fn wrapped_tasks(&self) -> &BTreeSet<TaskId> {
        &self.wrapped_tasks
    }

    /// Generators wrapped so far.
    #[must_use]
    pub fn wrapped_events(&self) -> &BTreeSet<GenId> {
        &self.wrapped_gens
    }

    /// Number of staged operations.
    #[must_use]
    pub fn staged_op_count(&self) -> usize {
        self.staged.len()
    }

    /// Whether a removal of `task` is staged.
    #[must_use]
    pub fn is_removed(&self, task: TaskId) -> bool {
        self.removed_tasks.contains(&task)
    }

    /// Wraps a plan task into the transaction, snapshotting its
    /// arguments on first access.
    ///
    /// # Errors
    ///
    /// [`PlanError::UnknownTask`] when the task is not in `plan`.
    pub fn wrap_task(&mut self, plan: &Plan, task: TaskId) -> Result<TxTask, PlanError> {
        let live = plan.task(task).ok_or(PlanError::UnknownTask(task))?;
        if self.wrapped_tasks.insert(task) {
            self.arg_snapshots.insert(task, live.arguments().clone());
        }
        Ok(TxTask::Real(task))
    }

    fn wrap_gen(&mut self, gen: &TxGen) {
        if let TxGen::Real(id) = gen {
            self.wrapped_gens.insert(*id);
        }
    }

    /// The proxy's view of a task's arguments: the snapshot taken when
    /// the task was wrapped, with staged assignments applied, not the
    /// live plan value.
    #[must_use]
    pub fn arguments(&self, task: TaskId) -> Option<&TaskArguments> {
        self.arg_snapshots.get(&task)
    }

    /// Stages a new task; it joins the plan at commit.
    pub fn add_task(
        &mut self,
        model: &Arc<TaskModel>,
        initial: Vec<(String, ArgumentValue)>,
    ) -> TxTask {
        self.new_tasks.push(NewTaskSpec {
            model: model.clone(),
            initial,
        });
        TxTask::New(self.new_tasks.len() as u32 - 1)
    }

    /// Resolves a task event through the overlay.
    ///
    /// # Errors
    ///
    /// [`PlanError::UnknownTask`] / [`PlanError::NoSuchEvent`].
    pub fn task_event(
        &self,
        plan: &Plan,
        task: TxTask,
        symbol: &str,
    ) -> Result<TxGen, PlanError> {
        match task {
            TxTask::Real(id) => {
                let live = plan.task(id).ok_or(PlanError::UnknownTask(id))?;
                let gen = live.event(symbol).ok_or_else(|| PlanError::NoSuchEvent {
                    task: id,
                    symbol: symbol.to_string(),
                })?;
                Ok(TxGen::Real(gen))
            }
            TxTask::New(index) => {
                let spec = &self.new_tasks[index as usize];
                if spec.model.find_event(symbol).is_none() {
                    return Err(PlanError::NoSuchEvent {
                        task: TaskId::from_raw(u64::MAX),
                        symbol: symbol.to_string(),
                    });
                }
                Ok(TxGen::New {
                    task: index,
                    symbol: symbol.to_string(),
                })
            }
        }
    }

    /// Stages an event relation edge. Wraps both endpoints.
    pub fn add_event_edge(&mut self, kind: EventRelationKind, from: TxGen, to: TxGen, info: Value) {
        self.wrap_gen(&from);
        self.wrap_gen(&to);
        self.staged.push(StagedOp::AddEventEdge {
            kind,
            from,
            to,
            info,
        });
    }

    /// Stages an event edge removal. Wraps both endpoints.
    pub fn remove_event_edge(&mut self, kind: EventRelationKind, from: TxGen, to: TxGen) {
        self.wrap_gen(&from);
        self.wrap_gen(&to);
        self.staged.push(StagedOp::RemoveEventEdge { kind, from, to });
    }

    /// Stages a task relation edge.
    pub fn add_task_edge(&mut self, kind: TaskRelationKind, from: TxTask, to: TxTask, info: Value) {
        if let TxTask::Real(id) = from {
            self.wrapped_tasks.insert(id);
        }
        if let TxTask::Real(id) = to {
            self.wrapped_tasks.insert(id);
        }
        self.staged.push(StagedOp::AddTaskEdge {
            kind,
            from,
            to,
            info,
        });
    }

    /// Stages a task edge removal.
    pub fn remove_task_edge(&mut self, kind: TaskRelationKind, from: TxTask, to: TxTask) {
        self.staged.push(StagedOp::RemoveTaskEdge { kind, from, to });
    }

    /// Stages an on-emit handler registration. Wraps the generator.
    pub fn add_emit_handler(&mut self, gen: TxGen, handler: EmitHandler) {
        self.wrap_gen(&gen);
        self.staged.push(StagedOp::AddEmitHandler { gen, handler });
    }

    /// Stages a task removal.
    pub fn remove_task(&mut self, task: TaskId) {
        self.removed_tasks.insert(task);
        self.staged.push(StagedOp::RemoveTask(task));
    }

    /// Stages a mission mark.
    pub fn add_mission_task(&mut self, task: TxTask) {
        self.staged.push(StagedOp::AddMission(task));
    }

    /// Stages a permanent mark.
    pub fn add_permanent_task(&mut self, task: TxTask) {
        self.staged.push(StagedOp::AddPermanentTask(task));
    }

    /// Stages an argument assignment.
    ///
    /// For wrapped tasks the assignment is validated against the
    /// proxy's snapshot immediately, so conflicts surface at staging
    /// time; the live plan is only written at commit.
    ///
    /// # Errors
    ///
    /// Argument errors from the snapshot validation.
    pub fn assign_arguments(
        &mut self,
        plan: &Plan,
        task: TxTask,
        args: Vec<(String, ArgumentValue)>,
    ) -> Result<(), PlanError> {
        match task {
            TxTask::Real(id) => {
                self.wrap_task(plan, id)?;
                let model = plan
                    .task(id)
                    .ok_or(PlanError::UnknownTask(id))?
                    .model()
                    .clone();
                let snapshot = self
                    .arg_snapshots
                    .get_mut(&id)
                    .expect("wrapped above");
                snapshot.assign(&model, args.clone())?;
                self.staged.push(StagedOp::AssignArguments { task: id, args });
                Ok(())
            }
            TxTask::New(index) => {
                self.new_tasks[index as usize].initial.extend(args);
                Ok(())
            }
        }
    }

    /// Overlay edge query: staged mutations first, then the base plan.
    #[must_use]
    pub fn has_event_edge(
        &self,
        plan: &Plan,
        kind: EventRelationKind,
        from: &TxGen,
        to: &TxGen,
    ) -> bool {
        let mut present = match (from, to) {
            (TxGen::Real(f), TxGen::Real(t)) => plan.event_graph(kind).has_edge(f, t),
            _ => false,
        };
        for op in &self.staged {
            match op {
                StagedOp::AddEventEdge {
                    kind: k,
                    from: f,
                    to: t,
                    ..
                } if k == &kind && f == from && t == to => present = true,
                StagedOp::RemoveEventEdge {
                    kind: k,
                    from: f,
                    to: t,
                } if k == &kind && f == from && t == to => present = false,
                _ => {}
            }
        }
        present
    }

    /// Stages a full replacement (see [`Plan::replace_by`]).
    ///
    /// # Errors
    ///
    /// [`PlanError::UnknownTask`] when `old` is not wrapped from the
    /// plan.
    pub fn replace_by(
        &mut self,
        plan: &Plan,
        old: TxTask,
        new: TxTask,
    ) -> Result<(), PlanError> {
        self.stage_replace(plan, old, new, ReplaceMode::Full)
    }

    /// Stages a subplan replacement (see [`Plan::replace_subplan_by`]).
    ///
    /// # Errors
    ///
    /// [`PlanError::UnknownTask`] when `old` is not wrapped from the
    /// plan.
    pub fn replace_subplan_by(
        &mut self,
        plan: &Plan,
        old: TxTask,
        new: TxTask,
    ) -> Result<(), PlanError> {
        self.stage_replace(plan, old, new, ReplaceMode::Subplan)
    }

    fn stage_replace(
        &mut self,
        plan: &Plan,
        old: TxTask,
        new: TxTask,
        mode: ReplaceMode,
    ) -> Result<(), PlanError> {
        let TxTask::Real(old_id) = old else {
            return Err(PlanError::ModelViolation(
                "the replaced task must come from the plan".into(),
            ));
        };
        self.wrap_task(plan, old_id)?;

        // Wrap exactly the events the rewiring has to examine.
        match new {
            TxTask::Real(new_id) => {
                self.wrap_task(plan, new_id)?;
                let view = TxView { tx: self, plan };
                let ops = compute_replace(&view, old_id, new_id, mode);
                for (old_gen, new_gen) in &ops.touched_pairs {
                    self.wrapped_gens.insert(*old_gen);
                    self.wrapped_gens.insert(*new_gen);
                }
            }
            TxTask::New(_) => {
                let view = TxView { tx: self, plan };
                let mut touched = Vec::new();
                for (_, gen) in view.task_events(old_id) {
                    let examined = EventRelationKind::ALL.iter().any(|&kind| {
                        !view.event_parents(kind, gen).is_empty()
                            || !view.event_children(kind, gen).is_empty()
                    });
                    if examined {
                        touched.push(gen);
                    }
                }
                self.wrapped_gens.extend(touched);
            }
        }

        self.staged.push(StagedOp::Replace {
            old: old_id,
            new,
            mode,
        });
        Ok(())
    }

    /// Discards the transaction: every staged mutation and proxy is
    /// dropped, the plan is untouched.
    pub fn discard(self) {
        debug!(base = %self.base, staged = self.staged.len(), "discarded transaction");
    }

    /// Commits the staged mutations.
    ///
    /// Order: staleness and DAG validation, argument assignments (with
    /// rollback on failure), new task materialization, then the staged
    /// operations in staging order, firing the same hooks as direct
    /// mutation. Returns the ids of tasks created by the transaction.
    ///
    /// # Errors
    ///
    /// [`PlanError::StaleProxy`] when a wrapped object left the plan,
    /// [`PlanError::CycleFound`] when the merged structure is cyclic;
    /// in both cases the plan is unchanged.
    pub fn commit(self, plan: &mut Plan) -> Result<Vec<TaskId>, PlanError> {
        // Staleness.
        for &task in &self.wrapped_tasks {
            if !plan.has_task(task) {
                return Err(PlanError::StaleProxy(task.to_string()));
            }
        }
        for &gen in &self.wrapped_gens {
            if !plan.has_generator(gen) {
                return Err(PlanError::StaleProxy(gen.to_string()));
            }
        }

        self.validate_structure(plan)?;

        // Argument assignments, rolled back as a group on failure.
        let mut argument_backups: HashMap<TaskId, TaskArguments> = HashMap::new();
        for op in &self.staged {
            let StagedOp::AssignArguments { task, args } = op else {
                continue;
            };
            let live = plan.task_mut(*task).ok_or(PlanError::UnknownTask(*task))?;
            argument_backups
                .entry(*task)
                .or_insert_with(|| live.arguments().clone());
            let model = live.model().clone();
            if let Err(err) = live.arguments_mut().assign(&model, args.clone()) {
                for (task, backup) in argument_backups {
                    if let Some(t) = plan.task_mut(task) {
                        *t.arguments_mut() = backup;
                    }
                }
                return Err(err.into());
            }
        }

        // New tasks.
        let mut new_ids = Vec::with_capacity(self.new_tasks.len());
        for spec in &self.new_tasks {
            let id = plan.add_task(&spec.model, spec.initial.clone())?;
            new_ids.push(id);
        }
        let resolve_task = |task: &TxTask| -> TaskId {
            match task {
                TxTask::Real(id) => *id,
                TxTask::New(index) => new_ids[*index as usize],
            }
        };
        let resolve_gen = |plan: &Plan, gen: &TxGen| -> Result<GenId, PlanError> {
            match gen {
                TxGen::Real(id) => Ok(*id),
                TxGen::New { task, symbol } => {
                    let id = new_ids[*task as usize];
                    plan.task_event(id, symbol).ok_or_else(|| PlanError::NoSuchEvent {
                        task: id,
                        symbol: symbol.clone(),
                    })
                }
            }
        };

        // Staged operations, in staging order.
        for op in &self.staged {
            match op {
                StagedOp::AddEventEdge {
                    kind,
                    from,
                    to,
                    info,
                } => {
                    let from = resolve_gen(plan, from)?;
                    let to = resolve_gen(plan, to)?;
                    plan.add_event_edge(*kind, from, to, info.clone())?;
                }
                StagedOp::RemoveEventEdge { kind, from, to } => {
                    let from = resolve_gen(plan, from)?;
                    let to = resolve_gen(plan, to)?;
                    plan.remove_event_edge(*kind, from, to)?;
                }
                StagedOp::AddTaskEdge {
                    kind,
                    from,
                    to,
                    info,
                } => {
                    plan.add_task_edge(*kind, resolve_task(from), resolve_task(to), info.clone())?;
                }
                StagedOp::RemoveTaskEdge { kind, from, to } => {
                    plan.remove_task_edge(*kind, resolve_task(from), resolve_task(to))?;
                }
                StagedOp::AddEmitHandler { gen, handler } => {
                    let gen = resolve_gen(plan, gen)?;
                    plan.generator_mut(gen)
                        .ok_or(PlanError::UnknownGenerator(gen))?
                        .on_handler(handler.clone());
                }
                StagedOp::RemoveTask(task) => {
                    plan.remove_task(*task)?;
                }
                StagedOp::AddMission(task) => {
                    plan.add_mission_task(resolve_task(task))?;
                }
                StagedOp::AddPermanentTask(task) => {
                    plan.add_permanent_task(resolve_task(task))?;
                }
                StagedOp::AssignArguments { .. } => {} // applied above
                StagedOp::Replace { old, new, mode } => {
                    let new = resolve_task(new);
                    match mode {
                        ReplaceMode::Full => plan.replace_by(*old, new)?,
                        ReplaceMode::Subplan => plan.replace_subplan_by(*old, new)?,
                    }
                }
            }
        }

        debug!(base = %self.base, new_tasks = new_ids.len(), "committed transaction");
        Ok(new_ids)
    }

    /// Rejects a transaction whose merged structure breaks a DAG
    /// relation, before anything is applied.
    fn validate_structure(&self, plan: &Plan) -> Result<(), PlanError> {
        // Merged event graphs over the overlay id space.
        for kind in EventRelationKind::ALL {
            if !kind.flags().dag {
                continue;
            }
            let mut merged =
                crate::graph::RelationGraph::<TxGen>::new(kind.flags());
            for (from, to, info) in plan.event_graph(kind).each_edge() {
                merged.insert(TxGen::Real(*from), TxGen::Real(*to), info.clone());
            }
            for op in &self.staged {
                match op {
                    StagedOp::RemoveEventEdge {
                        kind: k,
                        from,
                        to,
                    } if k == &kind => {
                        merged.remove(from, to);
                    }
                    StagedOp::AddEventEdge {
                        kind: k,
                        from,
                        to,
                        info,
                    } if k == &kind => {
                        if merged.would_cycle(from, to) {
                            return Err(PlanError::CycleFound {
                                relation: kind.to_string(),
                                from: format!("{from:?}"),
                                to: format!("{to:?}"),
                            });
                        }
                        merged.insert(from.clone(), to.clone(), info.clone());
                    }
                    _ => {}
                }
            }
        }
        for kind in TaskRelationKind::ALL {
            if !kind.flags().dag {
                continue;
            }
            let mut merged = crate::graph::RelationGraph::<TxTask>::new(kind.flags());
            for (from, to, info) in plan.task_graph(kind).each_edge() {
                merged.insert(TxTask::Real(*from), TxTask::Real(*to), info.clone());
            }
            for op in &self.staged {
                match op {
                    StagedOp::RemoveTaskEdge { kind: k, from, to } if k == &kind => {
                        merged.remove(from, to);
                    }
                    StagedOp::AddTaskEdge {
                        kind: k,
                        from,
                        to,
                        info,
                    } if k == &kind => {
                        if merged.would_cycle(from, to) {
                            return Err(PlanError::CycleFound {
                                relation: kind.to_string(),
                                from: format!("{from:?}"),
                                to: format!("{to:?}"),
                            });
                        }
                        merged.insert(*from, *to, info.clone());
                    }
                    _ => {}
                }
            }
        }

        // Replacements validate against the merged view.
        for op in &self.staged {
            let StagedOp::Replace { old, new: TxTask::Real(new), mode } = op else {
                continue;
            };
            let view = TxView { tx: self, plan };
            let ops = compute_replace(&view, *old, *new, *mode);
            plan.validate_replace_ops(&ops)?;
        }
        Ok(())
    }
}

/// The merged view of a transaction over its base plan: base edges,
/// minus staged removals, plus staged additions between plan objects.
struct TxView<'a> {
    tx: &'a Transaction,
    plan: &'a Plan,
}

impl TxView<'_> {
    fn merged_event_children(&self, kind: EventRelationKind, gen: GenId) -> Vec<(GenId, Value)> {
        let graph = self.plan.event_graph(kind);
        let mut edges: Vec<(GenId, Value)> = graph
            .children_of(&gen)
            .map(|(child, info)| (*child, info.clone()))
            .collect();
        for op in &self.tx.staged {
            match op {
                StagedOp::AddEventEdge {
                    kind: k,
                    from: TxGen::Real(f),
                    to: TxGen::Real(t),
                    info,
                } if k == &kind && f == &gen => edges.push((*t, info.clone())),
                StagedOp::RemoveEventEdge {
                    kind: k,
                    from: TxGen::Real(f),
                    to: TxGen::Real(t),
                } if k == &kind && f == &gen => edges.retain(|(c, _)| c != t),
                _ => {}
            }
        }
        edges
    }

    fn merged_task_children(&self, kind: TaskRelationKind, task: TaskId) -> Vec<(TaskId, Value)> {
        let graph = self.plan.task_graph(kind);
        let mut edges: Vec<(TaskId, Value)> = graph
            .children_of(&task)
            .map(|(child, info)| (*child, info.clone()))
            .collect();
        for op in &self.tx.staged {
            match op {
                StagedOp::AddTaskEdge {
                    kind: k,
                    from: TxTask::Real(f),
                    to: TxTask::Real(t),
                    info,
                } if k == &kind && f == &task => edges.push((*t, info.clone())),
                StagedOp::RemoveTaskEdge {
                    kind: k,
                    from: TxTask::Real(f),
                    to: TxTask::Real(t),
                } if k == &kind && f == &task => edges.retain(|(c, _)| c != t),
                _ => {}
            }
        }
        edges
    }
}

impl GraphView for TxView<'_> {
    fn event_parents(&self, kind: EventRelationKind, gen: GenId) -> Vec<(GenId, Value)> {
        let graph = self.plan.event_graph(kind);
        let mut edges: Vec<(GenId, Value)> = graph
            .parents_of(&gen)
            .map(|parent| {
                let info = graph.edge_info(parent, &gen).cloned().unwrap_or(Value::Null);
                (*parent, info)
            })
            .collect();
        for op in &self.tx.staged {
            match op {
                StagedOp::AddEventEdge {
                    kind: k,
                    from: TxGen::Real(f),
                    to: TxGen::Real(t),
                    info,
                } if k == &kind && t == &gen => edges.push((*f, info.clone())),
                StagedOp::RemoveEventEdge {
                    kind: k,
                    from: TxGen::Real(f),
                    to: TxGen::Real(t),
                } if k == &kind && t == &gen => edges.retain(|(p, _)| p != f),
                _ => {}
            }
        }
        edges
    }

    fn event_children(&self, kind: EventRelationKind, gen: GenId) -> Vec<(GenId, Value)> {
        self.merged_event_children(kind, gen)
    }

    fn task_parents(&self, kind: TaskRelationKind, task: TaskId) -> Vec<(TaskId, Value)> {
        let graph = self.plan.task_graph(kind);
        let mut edges: Vec<(TaskId, Value)> = graph
            .parents_of(&task)
            .map(|parent| {
                let info = graph
                    .edge_info(parent, &task)
                    .cloned()
                    .unwrap_or(Value::Null);
                (*parent, info)
            })
            .collect();
        for op in &self.tx.staged {
            match op {
                StagedOp::AddTaskEdge {
                    kind: k,
                    from: TxTask::Real(f),
                    to: TxTask::Real(t),
                    info,
                } if k == &kind && t == &task => edges.push((*f, info.clone())),
                StagedOp::RemoveTaskEdge {
                    kind: k,
                    from: TxTask::Real(f),
                    to: TxTask::Real(t),
                } if k == &kind && t == &task => edges.retain(|(p, _)| p != f),
                _ => {}
            }
        }
        edges
    }

    fn task_children(&self, kind: TaskRelationKind, task: TaskId) -> Vec<(TaskId, Value)> {
        self.merged_task_children(kind, task)
    }

    fn dependency_descendants(&self, root: TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            for (child, _) in self.merged_task_children(TaskRelationKind::Dependency, current) {
                queue.push_back(child);
            }
        }
        seen
    }

    fn task_events(&self, task: TaskId) -> Vec<(String, GenId)> {
        self.plan
            .task(task)
            .map(|t| {
                t.each_event()
                    .map(|(symbol, gen)| (symbol.to_string(), gen))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_model::TaskModel;

    fn model() -> Arc<TaskModel> {
        TaskModel::builder("t").build().unwrap()
    }

    fn start_of(plan: &Plan, task: TaskId) -> GenId {
        plan.task(task).unwrap().event("start").unwrap()
    }

    #[test]
    fn commit_applies_staged_edges() {
        let mut plan = Plan::new();
        let m = model();
        let a = plan.add_task(&m, vec![]).unwrap();
        let b = plan.add_task(&m, vec![]).unwrap();
        let a_start = start_of(&plan, a);
        let b_start = start_of(&plan, b);

        let mut tx = Transaction::new(&plan);
        tx.add_event_edge(
            EventRelationKind::Signal,
            TxGen::Real(a_start),
            TxGen::Real(b_start),
            Value::Null,
        );
        assert!(!plan
            .event_graph(EventRelationKind::Signal)
            .has_edge(&a_start, &b_start));
        assert!(tx.has_event_edge(
            &plan,
            EventRelationKind::Signal,
            &TxGen::Real(a_start),
            &TxGen::Real(b_start)
        ));

        tx.commit(&mut plan).unwrap();
        assert!(plan
            .event_graph(EventRelationKind::Signal)
            .has_edge(&a_start, &b_start));
    }

    #[test]
    fn discard_leaves_the_plan_untouched() {
        let mut plan = Plan::new();
        let m = model();
        let a = plan.add_task(&m, vec![]).unwrap();
        let b = plan.add_task(&m, vec![]).unwrap();
        let a_start = start_of(&plan, a);
        let b_start = start_of(&plan, b);

        let mut tx = Transaction::new(&plan);
        tx.add_event_edge(
            EventRelationKind::Forward,
            TxGen::Real(a_start),
            TxGen::Real(b_start),
            Value::Null,
        );
        tx.discard();

        assert!(!plan
            .event_graph(EventRelationKind::Forward)
            .has_edge(&a_start, &b_start));
    }

    #[test]
    fn cyclic_overlay_is_rejected_at_commit() {
        let mut plan = Plan::new();
        let x = plan.add_free_event(Some("x"), None);
        let y = plan.add_free_event(Some("y"), None);
        plan.add_event_edge(EventRelationKind::Forward, x, y, Value::Null)
            .unwrap();

        let mut tx = Transaction::new(&plan);
        tx.add_event_edge(
            EventRelationKind::Forward,
            TxGen::Real(y),
            TxGen::Real(x),
            Value::Null,
        );

        let err = tx.commit(&mut plan).unwrap_err();
        assert!(matches!(err, PlanError::CycleFound { .. }));
        // Atomicity: nothing was applied.
        assert!(!plan
            .event_graph(EventRelationKind::Forward)
            .has_edge(&y, &x));
    }

    #[test]
    fn staged_tasks_materialize_at_commit() {
        let mut plan = Plan::new();
        let m = model();

        let mut tx = Transaction::new(&plan);
        let new = tx.add_task(&m, vec![("x".into(), json!(3).into())]);
        tx.add_mission_task(new);

        let new_ids = tx.commit(&mut plan).unwrap();
        assert_eq!(new_ids.len(), 1);
        let task = plan.task(new_ids[0]).unwrap();
        assert_eq!(task.arguments().get("x"), Some(&json!(3)));
        assert!(plan.is_mission(new_ids[0]));
    }

    #[test]
    fn proxy_arguments_are_snapshots() {
        let mut plan = Plan::new();
        let m = TaskModel::builder("t").argument("x").build().unwrap();
        let a = plan.add_task(&m, vec![("x".into(), json!(1).into())]).unwrap();

        let mut tx = Transaction::new(&plan);
        tx.wrap_task(&plan, a).unwrap();

        // Live mutation after wrap is not visible through the proxy.
        plan.task_mut(a)
            .unwrap()
            .arguments_mut()
            .assign(&m, vec![("x".into(), json!(2).into())])
            .unwrap();
        assert_eq!(tx.arguments(a).unwrap().get("x"), Some(&json!(1)));
    }

    #[test]
    fn stale_proxy_is_rejected_at_commit() {
        let mut plan = Plan::new();
        let m = model();
        let a = plan.add_task(&m, vec![]).unwrap();

        let mut tx = Transaction::new(&plan);
        tx.wrap_task(&plan, a).unwrap();
        plan.remove_task(a).unwrap();

        let err = tx.commit(&mut plan).unwrap_err();
        assert!(matches!(err, PlanError::StaleProxy(_)));
    }

    #[test]
    fn replace_subplan_wraps_only_the_needed_events() {
        let mut plan = Plan::new();
        let m = model();
        let a = plan.add_task(&m, vec![]).unwrap();
        let b = plan.add_task(&m, vec![]).unwrap();
        let c = plan.add_task(&m, vec![]).unwrap();

        let a_start = start_of(&plan, a);
        let b_start = start_of(&plan, b);
        let c_start = start_of(&plan, c);
        plan.add_event_edge(EventRelationKind::Signal, a_start, c_start, Value::Null)
            .unwrap();

        let mut tx = Transaction::new(&plan);
        let ta = tx.wrap_task(&plan, a).unwrap();
        let tb = tx.wrap_task(&plan, b).unwrap();
        tx.replace_subplan_by(&plan, ta, tb).unwrap();

        // Only the start pair was needed to express the rewiring.
        assert_eq!(
            tx.wrapped_events().iter().copied().collect::<Vec<_>>(),
            vec![a_start, b_start]
        );
        assert!(!tx.wrapped_events().contains(&c_start));

        tx.commit(&mut plan).unwrap();
        // The subplan variant does not move child-side edges.
        let signal = plan.event_graph(EventRelationKind::Signal);
        assert!(signal.has_edge(&a_start, &c_start));
        assert!(!signal.has_edge(&b_start, &c_start));
    }

    #[test]
    fn transaction_replace_equals_direct_replace() {
        let build = |direct: bool| {
            let mut plan = Plan::new();
            let m = model();
            let parent = plan.add_task(&m, vec![]).unwrap();
            let old = plan.add_task(&m, vec![]).unwrap();
            let new = plan.add_task(&m, vec![]).unwrap();
            plan.add_dependency(parent, old, crate::plan::DependencyInfo::default())
                .unwrap();
            let old_start = start_of(&plan, old);
            let new_start = start_of(&plan, new);
            let parent_start = start_of(&plan, parent);
            plan.add_event_edge(
                EventRelationKind::Signal,
                parent_start,
                old_start,
                Value::Null,
            )
            .unwrap();

            if direct {
                plan.replace_by(old, new).unwrap();
            } else {
                let mut tx = Transaction::new(&plan);
                let told = tx.wrap_task(&plan, old).unwrap();
                let tnew = tx.wrap_task(&plan, new).unwrap();
                tx.replace_by(&plan, told, tnew).unwrap();
                tx.commit(&mut plan).unwrap();
            }

            let signal_moved = plan
                .event_graph(EventRelationKind::Signal)
                .has_edge(&new_start, &parent_start);
            let dep = plan.task_graph(TaskRelationKind::Dependency);
            (
                plan.event_graph(EventRelationKind::Signal)
                    .has_edge(&parent_start, &new_start),
                plan.event_graph(EventRelationKind::Signal)
                    .has_edge(&parent_start, &old_start),
                dep.has_edge(&parent, &new),
                dep.has_edge(&parent, &old),
                signal_moved,
            )
        };

        assert_eq!(build(true), build(false));
    }
}
