//! Replacement operators.
//!
//! `replace_by` rewires every external, non-strong relation from the
//! replaced task to its replacement; `replace_subplan_by` rewires only
//! the parent-side relations and leaves the replaced task's own subplan
//! attached to it. The rewiring is computed against a [`GraphView`] so
//! that transactions can stage the same operation against their merged
//! overlay and commit to an identical plan state.

use crate::error::PlanError;
use crate::plan::Plan;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;
use warden_event::{EventRelationKind, TaskRelationKind};
use warden_types::{GenId, TaskId};

/// Which side of the replaced task gets rewired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Parents and non-descendant children.
    Full,
    /// Parents only.
    Subplan,
}

/// Read access to the relation structure a replacement is computed
/// against: the live plan, or a transaction's merged overlay.
pub(crate) trait GraphView {
    fn event_parents(&self, kind: EventRelationKind, gen: GenId) -> Vec<(GenId, Value)>;
    fn event_children(&self, kind: EventRelationKind, gen: GenId) -> Vec<(GenId, Value)>;
    fn task_parents(&self, kind: TaskRelationKind, task: TaskId) -> Vec<(TaskId, Value)>;
    fn task_children(&self, kind: TaskRelationKind, task: TaskId) -> Vec<(TaskId, Value)>;
    fn dependency_descendants(&self, root: TaskId) -> HashSet<TaskId>;
    fn task_events(&self, task: TaskId) -> Vec<(String, GenId)>;
}

/// The staged edge rewiring of one replacement.
#[derive(Debug, Default, Clone)]
pub(crate) struct ReplaceOps {
    pub event_removes: Vec<(EventRelationKind, GenId, GenId)>,
    pub event_adds: Vec<(EventRelationKind, GenId, GenId, Value)>,
    pub task_removes: Vec<(TaskRelationKind, TaskId, TaskId)>,
    pub task_adds: Vec<(TaskRelationKind, TaskId, TaskId, Value)>,
    /// Generator pairs `(old, new)` the rewiring had to examine: the
    /// events a transaction must wrap.
    pub touched_pairs: Vec<(GenId, GenId)>,
}

/// Computes the rewiring of `replace(old, new)` against a view.
pub(crate) fn compute_replace(
    view: &dyn GraphView,
    old: TaskId,
    new: TaskId,
    mode: ReplaceMode,
) -> ReplaceOps {
    let mut ops = ReplaceOps::default();

    let descendants = view.dependency_descendants(old);
    let old_events = view.task_events(old);
    let new_events = view.task_events(new);

    let mut internal_gens: HashSet<GenId> = HashSet::new();
    for task in &descendants {
        for (_, gen) in view.task_events(*task) {
            internal_gens.insert(gen);
        }
    }
    for (_, gen) in &old_events {
        internal_gens.insert(*gen);
    }
    let new_gens: HashSet<GenId> = new_events.iter().map(|(_, gen)| *gen).collect();

    // Event relations: rewire per symbol pair.
    for (symbol, old_gen) in &old_events {
        let Some((_, new_gen)) = new_events.iter().find(|(s, _)| s == symbol) else {
            continue;
        };
        let mut touched = false;
        for kind in EventRelationKind::ALL {
            let flags = kind.flags();
            if flags.strong {
                continue;
            }
            for (parent, info) in view.event_parents(kind, *old_gen) {
                if internal_gens.contains(&parent) || new_gens.contains(&parent) {
                    continue;
                }
                touched = true;
                ops.event_adds.push((kind, parent, *new_gen, info));
                if !flags.copy_on_replace {
                    ops.event_removes.push((kind, parent, *old_gen));
                }
            }
            // Child-side edges are examined in both modes (that is what
            // decides whether the pair is wrapped in a transaction) but
            // moved only by a full replace.
            for (child, info) in view.event_children(kind, *old_gen) {
                if internal_gens.contains(&child) || new_gens.contains(&child) {
                    continue;
                }
                touched = true;
                if mode == ReplaceMode::Full {
                    ops.event_adds.push((kind, *new_gen, child, info));
                    if !flags.copy_on_replace {
                        ops.event_removes.push((kind, *old_gen, child));
                    }
                }
            }
        }
        if touched {
            ops.touched_pairs.push((*old_gen, *new_gen));
        }
    }

    // Task relations.
    for kind in TaskRelationKind::ALL {
        let flags = kind.flags();
        if flags.strong {
            continue;
        }
        for (parent, info) in view.task_parents(kind, old) {
            if descendants.contains(&parent) || parent == new {
                continue;
            }
            ops.task_adds.push((kind, parent, new, info));
            if !flags.copy_on_replace {
                ops.task_removes.push((kind, parent, old));
            }
        }
        if mode == ReplaceMode::Full {
            for (child, info) in view.task_children(kind, old) {
                if descendants.contains(&child) || child == new {
                    continue;
                }
                ops.task_adds.push((kind, new, child, info));
                if !flags.copy_on_replace {
                    ops.task_removes.push((kind, old, child));
                }
            }
        }
    }

    ops
}

impl GraphView for Plan {
    fn event_parents(&self, kind: EventRelationKind, gen: GenId) -> Vec<(GenId, Value)> {
        let graph = self.event_graph(kind);
        graph
            .parents_of(&gen)
            .map(|parent| {
                let info = graph.edge_info(parent, &gen).cloned().unwrap_or(Value::Null);
                (*parent, info)
            })
            .collect()
    }

    fn event_children(&self, kind: EventRelationKind, gen: GenId) -> Vec<(GenId, Value)> {
        self.event_graph(kind)
            .children_of(&gen)
            .map(|(child, info)| (*child, info.clone()))
            .collect()
    }

    fn task_parents(&self, kind: TaskRelationKind, task: TaskId) -> Vec<(TaskId, Value)> {
        let graph = self.task_graph(kind);
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
    }

    fn task_children(&self, kind: TaskRelationKind, task: TaskId) -> Vec<(TaskId, Value)> {
        self.task_graph(kind)
            .children_of(&task)
            .map(|(child, info)| (*child, info.clone()))
            .collect()
    }

    fn dependency_descendants(&self, root: TaskId) -> HashSet<TaskId> {
        self.task_graph(TaskRelationKind::Dependency)
            .descendants(&[root])
    }

    fn task_events(&self, task: TaskId) -> Vec<(String, GenId)> {
        self.task(task)
            .map(|t| {
                t.each_event()
                    .map(|(symbol, gen)| (symbol.to_string(), gen))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Plan {
    /// Replaces `old` by `new`: every external, non-strong relation
    /// incident to `old` (parents and non-descendant children) becomes
    /// incident to `new`; `copy_on_replace` relations end up on both.
    /// Handlers with a resolved `Copy` policy are copied event by
    /// event, and mission/permanent marks transfer.
    ///
    /// # Errors
    ///
    /// [`PlanError::UnknownTask`] for either task,
    /// [`PlanError::CycleFound`] when the rewiring would close a cycle;
    /// nothing is applied in that case.
    pub fn replace_by(&mut self, old: TaskId, new: TaskId) -> Result<(), PlanError> {
        self.replace(old, new, ReplaceMode::Full)
    }

    /// Replaces `old` by `new` in its parents only: child-side
    /// relations, the subplan below `old` included, stay with `old`.
    ///
    /// # Errors
    ///
    /// Same as [`replace_by`](Self::replace_by).
    pub fn replace_subplan_by(&mut self, old: TaskId, new: TaskId) -> Result<(), PlanError> {
        self.replace(old, new, ReplaceMode::Subplan)
    }

    fn replace(&mut self, old: TaskId, new: TaskId, mode: ReplaceMode) -> Result<(), PlanError> {
        if !self.has_task(old) {
            return Err(PlanError::UnknownTask(old));
        }
        if !self.has_task(new) {
            return Err(PlanError::UnknownTask(new));
        }
        let ops = compute_replace(self, old, new, mode);
        self.validate_replace_ops(&ops)?;
        self.apply_replace_ops(&ops)?;
        self.copy_replace_handlers(old, new);

        if self.missions().contains(&old) {
            self.unmark_mission(old);
            self.add_mission_task(new)?;
        }
        if self.permanent_tasks().contains(&old) {
            self.unmark_permanent_task(old);
            self.add_permanent_task(new)?;
        }
        debug!(%old, %new, ?mode, "replaced task");
        Ok(())
    }

    /// Simulates the rewiring against graph clones so that a cycle is
    /// detected before anything is applied.
    pub(crate) fn validate_replace_ops(&self, ops: &ReplaceOps) -> Result<(), PlanError> {
        for kind in EventRelationKind::ALL {
            let mut graph = self.event_graph(kind).clone();
            for (k, from, to) in &ops.event_removes {
                if k == &kind {
                    graph.remove(from, to);
                }
            }
            for (k, from, to, info) in &ops.event_adds {
                if k != &kind {
                    continue;
                }
                if graph.would_cycle(from, to) {
                    return Err(PlanError::CycleFound {
                        relation: kind.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
                graph.insert(*from, *to, info.clone());
            }
        }
        for kind in TaskRelationKind::ALL {
            let mut graph = self.task_graph(kind).clone();
            for (k, from, to) in &ops.task_removes {
                if k == &kind {
                    graph.remove(from, to);
                }
            }
            for (k, from, to, info) in &ops.task_adds {
                if k != &kind {
                    continue;
                }
                if graph.would_cycle(from, to) {
                    return Err(PlanError::CycleFound {
                        relation: kind.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
                graph.insert(*from, *to, info.clone());
            }
        }
        Ok(())
    }

    /// Applies a validated rewiring, removals first.
    pub(crate) fn apply_replace_ops(&mut self, ops: &ReplaceOps) -> Result<(), PlanError> {
        for (kind, from, to) in &ops.event_removes {
            self.remove_event_edge(*kind, *from, *to)?;
        }
        for (kind, from, to) in &ops.task_removes {
            self.remove_task_edge(*kind, *from, *to)?;
        }
        for (kind, from, to, info) in &ops.event_adds {
            self.add_event_edge(*kind, *from, *to, info.clone())?;
        }
        for (kind, from, to, info) in &ops.task_adds {
            self.add_task_edge(*kind, *from, *to, info.clone())?;
        }
        Ok(())
    }

    /// Copies `Copy`-resolved handlers from `old` to `new`, event by
    /// event and at task level.
    pub(crate) fn copy_replace_handlers(&mut self, old: TaskId, new: TaskId) {
        let Some(old_task) = self.task(old) else {
            return;
        };
        let old_abstract = old_task.is_abstract();
        let symbol_pairs: Vec<(GenId, GenId)> = old_task
            .each_event()
            .filter_map(|(symbol, old_gen)| {
                self.task(new)
                    .and_then(|t| t.event(symbol))
                    .map(|new_gen| (old_gen, new_gen))
            })
            .collect();

        for (old_gen, new_gen) in symbol_pairs {
            let Some(source) = self.generator(old_gen) else {
                continue;
            };
            let (emit, unreachable, finalization) = source.handlers_to_copy(old_abstract);
            let Some(target) = self.generator_mut(new_gen) else {
                continue;
            };
            for handler in emit {
                target.on_handler(handler);
            }
            for handler in unreachable {
                target.if_unreachable_handler(handler);
            }
            for handler in finalization {
                target.when_finalized_handler(handler);
            }
        }

        let Some(old_task) = self.task(old) else {
            return;
        };
        let (polls, executes, finalizations) = old_task.handlers_to_copy(old_abstract);
        let Some(new_task) = self.task_mut(new) else {
            return;
        };
        for handler in polls {
            new_task.poll_handler(handler);
        }
        for handler in executes {
            new_task.execute_handler(handler);
        }
        for handler in finalizations {
            new_task.when_finalized_handler(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::DependencyInfo;
    use std::sync::Arc;
    use warden_model::TaskModel;

    fn model() -> Arc<TaskModel> {
        TaskModel::builder("t").build().unwrap()
    }

    fn start_of(plan: &Plan, task: TaskId) -> GenId {
        plan.task(task).unwrap().event("start").unwrap()
    }

    #[test]
    fn replace_moves_external_event_edges() {
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

        plan.replace_by(a, b).unwrap();

        let signal = plan.event_graph(EventRelationKind::Signal);
        assert!(!signal.has_edge(&a_start, &c_start));
        assert!(signal.has_edge(&b_start, &c_start));
    }

    #[test]
    fn replace_subplan_keeps_child_side_edges() {
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

        plan.replace_subplan_by(a, b).unwrap();

        let signal = plan.event_graph(EventRelationKind::Signal);
        assert!(signal.has_edge(&a_start, &c_start), "outgoing edge stays");
        assert!(!signal.has_edge(&b_start, &c_start));
    }

    #[test]
    fn replace_moves_parent_dependencies_and_keeps_subplan() {
        let mut plan = Plan::new();
        let m = model();
        let parent = plan.add_task(&m, vec![]).unwrap();
        let old = plan.add_task(&m, vec![]).unwrap();
        let child = plan.add_task(&m, vec![]).unwrap();
        let new = plan.add_task(&m, vec![]).unwrap();

        plan.add_dependency(parent, old, DependencyInfo::default())
            .unwrap();
        plan.add_dependency(old, child, DependencyInfo::default())
            .unwrap();

        plan.replace_by(old, new).unwrap();

        let deps = plan.task_graph(TaskRelationKind::Dependency);
        assert!(deps.has_edge(&parent, &new));
        assert!(!deps.has_edge(&parent, &old));
        // The subplan below old stays with old.
        assert!(deps.has_edge(&old, &child));
        assert!(!deps.has_edge(&new, &child));
    }

    #[test]
    fn strong_relations_are_never_moved() {
        let mut plan = Plan::new();
        let m = model();
        let planner = plan.add_task(&m, vec![]).unwrap();
        let old = plan.add_task(&m, vec![]).unwrap();
        let new = plan.add_task(&m, vec![]).unwrap();

        plan.add_task_edge(TaskRelationKind::PlannedBy, planner, old, Value::Null)
            .unwrap();

        plan.replace_by(old, new).unwrap();

        let planned = plan.task_graph(TaskRelationKind::PlannedBy);
        assert!(planned.has_edge(&planner, &old));
        assert!(!planned.has_edge(&planner, &new));
    }

    #[test]
    fn copy_on_replace_relations_end_up_on_both() {
        let mut plan = Plan::new();
        let m = model();
        let repair = plan.add_task(&m, vec![]).unwrap();
        let old = plan.add_task(&m, vec![]).unwrap();
        let new = plan.add_task(&m, vec![]).unwrap();

        plan.add_error_handler(repair, old, vec![]).unwrap();
        // old as the covered side: repair -> old
        // After replace, repair must cover both.
        let parents: Vec<(TaskId, Value)> =
            plan.task_parents(TaskRelationKind::ErrorHandling, old);
        assert_eq!(parents.len(), 1);

        plan.replace_by(old, new).unwrap();

        let handling = plan.task_graph(TaskRelationKind::ErrorHandling);
        assert!(handling.has_edge(&repair, &old));
        assert!(handling.has_edge(&repair, &new));
    }

    #[test]
    fn mission_mark_transfers() {
        let mut plan = Plan::new();
        let m = model();
        let old = plan.add_task(&m, vec![]).unwrap();
        let new = plan.add_task(&m, vec![]).unwrap();
        plan.add_mission_task(old).unwrap();

        plan.replace_by(old, new).unwrap();

        assert!(!plan.is_mission(old));
        assert!(plan.is_mission(new));
    }

    #[test]
    fn replace_rejecting_cycle_applies_nothing() {
        let mut plan = Plan::new();
        let m = model();
        let parent = plan.add_task(&m, vec![]).unwrap();
        let old = plan.add_task(&m, vec![]).unwrap();
        let new = plan.add_task(&m, vec![]).unwrap();

        plan.add_dependency(parent, old, DependencyInfo::default())
            .unwrap();
        // new is already above parent: moving parent -> old onto
        // parent -> new closes parent -> new -> parent.
        plan.add_dependency(new, parent, DependencyInfo::default())
            .unwrap();

        let err = plan.replace_by(old, new).unwrap_err();
        assert!(matches!(err, PlanError::CycleFound { .. }));

        let deps = plan.task_graph(TaskRelationKind::Dependency);
        assert!(deps.has_edge(&parent, &old), "nothing was applied");
        assert!(!deps.has_edge(&parent, &new));
    }
}
