//! Plan dump and restore.
//!
//! A [`PlanDump`] is the serialized form of a plan's public structure.
//! Every object is keyed by its stable remote id; restoring the same
//! dump twice, or a dump containing objects already restored, is
//! idempotent.

use crate::error::LogError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use warden_event::{EventRelationKind, TaskRelationKind};
use warden_model::{ArgumentValue, ModelRegistry};
use warden_plan::{Plan, TaskState};
use warden_types::{GenId, ModelId, RemoteId, TaskId};

/// Serialized form of one event generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorDump {
    /// Stable identity.
    pub remote_id: RemoteId,
    /// Arena id in the dumping process, the key of log records.
    pub arena: u64,
    /// Symbol, when named.
    pub symbol: Option<String>,
    /// Whether the generator has a command.
    pub controllable: bool,
    /// Whether it emitted at least once.
    pub emitted: bool,
}

/// Serialized form of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDump {
    /// Stable identity.
    pub remote_id: RemoteId,
    /// Arena id in the dumping process, the key of log records.
    pub arena: u64,
    /// Model identity, resolved through a registry at restore.
    pub model: ModelId,
    /// Model name, for diagnostics.
    pub model_name: String,
    /// Remote peers holding siblings of this task.
    pub remote_siblings: Vec<RemoteId>,
    /// Owning peers.
    pub owners: Vec<RemoteId>,
    /// Concrete arguments.
    pub arguments: BTreeMap<String, Value>,
    /// Status flags.
    pub state: TaskState,
    /// The task's event generators.
    pub events: Vec<GeneratorDump>,
}

/// One serialized relation edge, endpoints by remote id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDump {
    /// Relation name (`signal`, `forward`, `dependency`, ...).
    pub kind: String,
    /// Source object.
    pub from: RemoteId,
    /// Target object.
    pub to: RemoteId,
    /// Edge info payload.
    pub info: Value,
}

/// Serialized form of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDump {
    /// The plan's stable identity.
    pub plan: RemoteId,
    /// Whether the plan was executable.
    pub executable: bool,
    /// Tasks, with their generators.
    pub tasks: Vec<TaskDump>,
    /// Free event generators.
    pub free_events: Vec<GeneratorDump>,
    /// Event relation edges.
    pub event_edges: Vec<EdgeDump>,
    /// Task relation edges.
    pub task_edges: Vec<EdgeDump>,
    /// Mission marks.
    pub missions: Vec<RemoteId>,
    /// Permanent task marks.
    pub permanent_tasks: Vec<RemoteId>,
    /// Permanent event marks.
    pub permanent_events: Vec<RemoteId>,
}

/// Serializes a plan's public structure.
#[must_use]
pub fn dump_plan(plan: &Plan) -> PlanDump {
    let gen_remote = |gen: GenId| plan.generator(gen).map(|g| g.remote_id());
    let task_remote = |task: TaskId| plan.task(task).map(|t| t.remote_id());

    let mut tasks = Vec::new();
    for task_id in plan.task_ids() {
        let task = plan.task(task_id).expect("listed id");
        let events = task
            .each_event()
            .filter_map(|(_, gen)| plan.generator(gen))
            .map(|gen| GeneratorDump {
                remote_id: gen.remote_id(),
                arena: gen.id().as_u64(),
                symbol: gen.symbol().map(str::to_string),
                controllable: gen.controllable(),
                emitted: gen.emitted(),
            })
            .collect();
        tasks.push(TaskDump {
            remote_id: task.remote_id(),
            arena: task.id().as_u64(),
            model: task.model().id(),
            model_name: task.model().name().to_string(),
            remote_siblings: Vec::new(),
            owners: Vec::new(),
            arguments: task.arguments().concrete_map(),
            state: *task.state(),
            events,
        });
    }

    let free_events = plan
        .free_event_ids()
        .filter_map(|gen| plan.generator(gen))
        .map(|gen| GeneratorDump {
            remote_id: gen.remote_id(),
            arena: gen.id().as_u64(),
            symbol: gen.symbol().map(str::to_string),
            controllable: gen.controllable(),
            emitted: gen.emitted(),
        })
        .collect();

    let mut event_edges = Vec::new();
    for kind in EventRelationKind::ALL {
        for (from, to, info) in plan.event_graph(kind).each_edge() {
            if let (Some(from), Some(to)) = (gen_remote(*from), gen_remote(*to)) {
                event_edges.push(EdgeDump {
                    kind: kind.to_string(),
                    from,
                    to,
                    info: info.clone(),
                });
            }
        }
    }
    let mut task_edges = Vec::new();
    for kind in TaskRelationKind::ALL {
        for (from, to, info) in plan.task_graph(kind).each_edge() {
            if let (Some(from), Some(to)) = (task_remote(*from), task_remote(*to)) {
                task_edges.push(EdgeDump {
                    kind: kind.to_string(),
                    from,
                    to,
                    info: info.clone(),
                });
            }
        }
    }
    // Deterministic order regardless of arena iteration.
    event_edges.sort_by_key(|e| (e.kind.clone(), e.from.to_string(), e.to.to_string()));
    task_edges.sort_by_key(|e| (e.kind.clone(), e.from.to_string(), e.to.to_string()));

    PlanDump {
        plan: plan.remote_id(),
        executable: plan.is_executable(),
        tasks,
        free_events,
        event_edges,
        task_edges,
        missions: plan
            .missions()
            .iter()
            .filter_map(|&t| task_remote(t))
            .collect(),
        permanent_tasks: plan
            .permanent_tasks()
            .iter()
            .filter_map(|&t| task_remote(t))
            .collect(),
        permanent_events: plan
            .permanent_events()
            .iter()
            .filter_map(|&g| gen_remote(g))
            .collect(),
    }
}

/// Restores a dump into `plan`, resolving models through `registry`.
///
/// Objects already present (by remote id) are updated in place rather
/// than duplicated, which makes duplicate delivery idempotent.
///
/// # Errors
///
/// [`LogError::UnknownModel`] when a task's model is not registered;
/// structural errors while re-adding edges.
pub fn restore_plan(
    plan: &mut Plan,
    registry: &ModelRegistry,
    dump: &PlanDump,
) -> Result<(), LogError> {
    plan.set_executable(dump.executable);

    let mut tasks_by_remote: HashMap<RemoteId, TaskId> = HashMap::new();
    let mut gens_by_remote: HashMap<RemoteId, GenId> = HashMap::new();

    for task_dump in &dump.tasks {
        let task_id = match plan.find_task_by_remote(task_dump.remote_id) {
            Some(existing) => existing,
            None => {
                let model = registry
                    .get(task_dump.model)
                    .ok_or_else(|| LogError::UnknownModel(task_dump.model_name.clone()))?;
                let initial: Vec<(String, ArgumentValue)> = task_dump
                    .arguments
                    .iter()
                    .map(|(k, v)| (k.clone(), ArgumentValue::Concrete(v.clone())))
                    .collect();
                let id = plan.add_task(model, initial).map_err(LogError::Plan)?;
                let task = plan.task_mut(id).expect("just added");
                task.set_remote_id(task_dump.remote_id);
                id
            }
        };
        tasks_by_remote.insert(task_dump.remote_id, task_id);

        // Status flags and per-generator identities.
        if let Some(task) = plan.task_mut(task_id) {
            *task.state_mut() = task_dump.state;
        }
        for gen_dump in &task_dump.events {
            let Some(symbol) = &gen_dump.symbol else {
                continue;
            };
            if let Some(gen_id) = plan.task_event(task_id, symbol) {
                gens_by_remote.insert(gen_dump.remote_id, gen_id);
                if let Some(gen) = plan.generator_mut(gen_id) {
                    gen.set_remote_id(gen_dump.remote_id);
                }
            }
        }
    }

    for gen_dump in &dump.free_events {
        let gen_id = match gens_by_remote.get(&gen_dump.remote_id) {
            Some(&existing) => existing,
            None => {
                let found = plan
                    .free_event_ids()
                    .find(|&g| plan.generator(g).is_some_and(|gen| gen.remote_id() == gen_dump.remote_id));
                match found {
                    Some(existing) => existing,
                    None => {
                        let command = gen_dump
                            .controllable
                            .then_some(warden_event::CommandSpec::EmitOnCall);
                        let id = plan.add_free_event(gen_dump.symbol.as_deref(), command);
                        if let Some(gen) = plan.generator_mut(id) {
                            gen.set_remote_id(gen_dump.remote_id);
                        }
                        id
                    }
                }
            }
        };
        gens_by_remote.insert(gen_dump.remote_id, gen_id);
    }

    for edge in &dump.event_edges {
        let kind = event_kind_by_name(&edge.kind).ok_or_else(|| LogError::MalformedRecord {
            method: "merged_plan".into(),
            reason: format!("unknown event relation '{}'", edge.kind),
        })?;
        let (Some(&from), Some(&to)) = (
            gens_by_remote.get(&edge.from),
            gens_by_remote.get(&edge.to),
        ) else {
            continue;
        };
        plan.add_event_edge(kind, from, to, edge.info.clone())
            .map_err(LogError::Plan)?;
    }
    for edge in &dump.task_edges {
        let kind = task_kind_by_name(&edge.kind).ok_or_else(|| LogError::MalformedRecord {
            method: "merged_plan".into(),
            reason: format!("unknown task relation '{}'", edge.kind),
        })?;
        let (Some(&from), Some(&to)) = (
            tasks_by_remote.get(&edge.from),
            tasks_by_remote.get(&edge.to),
        ) else {
            continue;
        };
        plan.add_task_edge(kind, from, to, edge.info.clone())
            .map_err(LogError::Plan)?;
    }

    for remote in &dump.missions {
        if let Some(&task) = tasks_by_remote.get(remote) {
            plan.add_mission_task(task).map_err(LogError::Plan)?;
        }
    }
    for remote in &dump.permanent_tasks {
        if let Some(&task) = tasks_by_remote.get(remote) {
            plan.add_permanent_task(task).map_err(LogError::Plan)?;
        }
    }
    for remote in &dump.permanent_events {
        if let Some(&gen) = gens_by_remote.get(remote) {
            plan.add_permanent_event(gen).map_err(LogError::Plan)?;
        }
    }

    Ok(())
}

pub(crate) fn event_kind_by_name(name: &str) -> Option<EventRelationKind> {
    EventRelationKind::ALL
        .into_iter()
        .find(|k| k.to_string() == name)
}

pub(crate) fn task_kind_by_name(name: &str) -> Option<TaskRelationKind> {
    TaskRelationKind::ALL
        .into_iter()
        .find(|k| k.to_string() == name)
}
