//! Log replay into public observables.
//!
//! The rebuilder is a pure fold over the record stream plus an id
//! table: raw arena ids key the reconstructed objects, and
//! `finalized_*` records deregister them so that a later generation
//! reusing an id never cross-links with the old one.

use crate::dump::{event_kind_by_name, task_kind_by_name, PlanDump};
use crate::error::LogError;
use crate::records::{LogEntry, LogMethod};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Reconstructed view of one task.
#[derive(Debug, Clone, Default)]
pub struct RebuiltTask {
    /// Latest status label (`pending`, `running`, ...).
    pub state: String,
    /// Latest argument assignment.
    pub arguments: BTreeMap<String, Value>,
    /// Whether a `task_failed_to_start` record was seen.
    pub failed_to_start: bool,
}

/// Reconstructed view of one event generator.
#[derive(Debug, Clone, Default)]
pub struct RebuiltGenerator {
    /// Whether a `generator_fired` record was seen.
    pub emitted: bool,
    /// Propagation ids of the emissions, in stream order.
    pub history: Vec<u64>,
    /// Whether the generator became unreachable.
    pub unreachable: bool,
}

/// Folds a log stream back into plan observables.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use warden_log::{LogEntry, LogMethod, PlanRebuilder};
///
/// let mut rebuilder = PlanRebuilder::new();
/// rebuilder
///     .apply(&LogEntry::at(
///         LogMethod::GeneratorFired,
///         0,
///         0,
///         vec![json!(3), json!(17), json!([])],
///     ))
///     .unwrap();
///
/// assert!(rebuilder.generator(3).unwrap().emitted);
/// assert_eq!(rebuilder.generator(3).unwrap().history, vec![17]);
/// ```
#[derive(Debug, Default)]
pub struct PlanRebuilder {
    plan: Option<Value>,
    tasks: HashMap<u64, RebuiltTask>,
    generators: HashMap<u64, RebuiltGenerator>,
    event_edges: HashMap<(String, u64, u64), Value>,
    task_edges: HashMap<(String, u64, u64), Value>,
    missions: BTreeSet<u64>,
    permanent_tasks: BTreeSet<u64>,
    garbage: Vec<u64>,
    finalized: Vec<u64>,
    exceptions: Vec<String>,
    cycles: u64,
}

impl PlanRebuilder {
    /// An empty rebuilder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered plan identity, if the stream carried one.
    #[must_use]
    pub fn plan(&self) -> Option<&Value> {
        self.plan.as_ref()
    }

    /// Reconstructed task by raw id.
    #[must_use]
    pub fn task(&self, id: u64) -> Option<&RebuiltTask> {
        self.tasks.get(&id)
    }

    /// Reconstructed generator by raw id.
    #[must_use]
    pub fn generator(&self, id: u64) -> Option<&RebuiltGenerator> {
        self.generators.get(&id)
    }

    /// Mission task ids at the last cycle boundary.
    #[must_use]
    pub fn mission_tasks(&self) -> &BTreeSet<u64> {
        &self.missions
    }

    /// Permanent task ids at the last cycle boundary.
    #[must_use]
    pub fn permanent_tasks(&self) -> &BTreeSet<u64> {
        &self.permanent_tasks
    }

    /// Tasks removed by garbage collection, in stream order.
    #[must_use]
    pub fn garbage(&self) -> &[u64] {
        &self.garbage
    }

    /// Ids deregistered by `finalized_*` records.
    #[must_use]
    pub fn finalized(&self) -> &[u64] {
        &self.finalized
    }

    /// Formatted exception notifications.
    #[must_use]
    pub fn exceptions(&self) -> &[String] {
        &self.exceptions
    }

    /// Number of completed cycles.
    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.cycles
    }

    /// Whether an event edge is present.
    #[must_use]
    pub fn has_event_edge(&self, kind: &str, from: u64, to: u64) -> bool {
        self.event_edges
            .contains_key(&(kind.to_string(), from, to))
    }

    /// Whether a task edge is present.
    #[must_use]
    pub fn has_task_edge(&self, kind: &str, from: u64, to: u64) -> bool {
        self.task_edges.contains_key(&(kind.to_string(), from, to))
    }

    /// Applies one record.
    ///
    /// # Errors
    ///
    /// [`LogError::MalformedRecord`] when the args do not match the
    /// method, [`LogError::UnknownId`] when a record that requires a
    /// known object references a deregistered or never-seen id.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<(), LogError> {
        match entry.method {
            LogMethod::RegisterExecutablePlan => {
                self.plan = entry.args.first().cloned();
            }
            LogMethod::MergedPlan => {
                let dump: PlanDump = serde_json::from_value(
                    entry.args.first().cloned().unwrap_or(Value::Null),
                )
                .map_err(|e| malformed(entry.method, &e.to_string()))?;
                self.merge_dump(&dump);
            }
            LogMethod::AddedEdge | LogMethod::UpdatedEdgeInfo => {
                let (space, kind, from, to) = edge_args(entry)?;
                let info = entry.args.get(4).cloned().unwrap_or(Value::Null);
                if space == "event" {
                    self.generators.entry(from).or_default();
                    self.generators.entry(to).or_default();
                    self.event_edges.insert((kind, from, to), info);
                } else {
                    self.tasks.entry(from).or_default();
                    self.tasks.entry(to).or_default();
                    self.task_edges.insert((kind, from, to), info);
                }
            }
            LogMethod::RemovedEdge => {
                let (space, kind, from, to) = edge_args(entry)?;
                if space == "event" {
                    self.event_edges.remove(&(kind, from, to));
                } else {
                    self.task_edges.remove(&(kind, from, to));
                }
            }
            LogMethod::TaskStatusChange => {
                let id = id_arg(entry, 0)?;
                let label = str_arg(entry, 1)?;
                self.tasks.entry(id).or_default().state = label;
            }
            LogMethod::EventStatusChange => {
                let id = id_arg(entry, 0)?;
                self.generators.entry(id).or_default();
            }
            LogMethod::GarbageTask => {
                let id = id_arg(entry, 0)?;
                if !self.tasks.contains_key(&id) {
                    return Err(LogError::UnknownId {
                        method: entry.method.to_string(),
                        id,
                    });
                }
                self.garbage.push(id);
            }
            LogMethod::FinalizedTask => {
                let id = id_arg(entry, 0)?;
                self.tasks.remove(&id);
                self.missions.remove(&id);
                self.permanent_tasks.remove(&id);
                self.task_edges.retain(|(_, f, t), _| *f != id && *t != id);
                self.finalized.push(id);
            }
            LogMethod::FinalizedEvent => {
                let id = id_arg(entry, 0)?;
                self.generators.remove(&id);
                self.event_edges.retain(|(_, f, t), _| *f != id && *t != id);
                self.finalized.push(id);
            }
            LogMethod::TaskArgumentsUpdated => {
                let id = id_arg(entry, 0)?;
                let arguments = entry
                    .args
                    .get(1)
                    .and_then(Value::as_object)
                    .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                self.tasks.entry(id).or_default().arguments = arguments;
            }
            LogMethod::TaskFailedToStart => {
                let id = id_arg(entry, 0)?;
                let task = self.tasks.entry(id).or_default();
                task.failed_to_start = true;
                task.state = "failed_to_start".to_string();
            }
            LogMethod::GeneratorFired => {
                let id = id_arg(entry, 0)?;
                let pid = id_arg(entry, 1)?;
                let generator = self.generators.entry(id).or_default();
                generator.emitted = true;
                generator.history.push(pid);
            }
            LogMethod::GeneratorEmitFailed | LogMethod::GeneratorUnreachable => {
                let id = id_arg(entry, 0)?;
                self.generators.entry(id).or_default().unreachable = true;
            }
            LogMethod::GeneratorPropagateEvents => {
                // Traced for timing analysis; carries no plan state.
            }
            LogMethod::ExceptionNotification => {
                let message = entry
                    .args
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.exceptions.push(message);
            }
            LogMethod::CycleEnd => {
                let cycle = id_arg(entry, 0)?;
                self.cycles = cycle + 1;
                if let Some(stats) = entry.args.get(1) {
                    if let Some(missions) = stats.get("missions").and_then(Value::as_array) {
                        self.missions = missions.iter().filter_map(Value::as_u64).collect();
                    }
                    if let Some(permanent) =
                        stats.get("permanent_tasks").and_then(Value::as_array)
                    {
                        self.permanent_tasks =
                            permanent.iter().filter_map(Value::as_u64).collect();
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies a whole stream.
    ///
    /// # Errors
    ///
    /// First record error, if any.
    pub fn apply_all<'a>(
        &mut self,
        entries: impl IntoIterator<Item = &'a LogEntry>,
    ) -> Result<(), LogError> {
        for entry in entries {
            self.apply(entry)?;
        }
        Ok(())
    }

    fn merge_dump(&mut self, dump: &PlanDump) {
        let mut task_arena_by_remote = HashMap::new();
        let mut gen_arena_by_remote = HashMap::new();

        for task in &dump.tasks {
            task_arena_by_remote.insert(task.remote_id, task.arena);
            let rebuilt = self.tasks.entry(task.arena).or_default();
            rebuilt.state = task.state.label().to_string();
            rebuilt.arguments = task.arguments.clone();
            for gen in &task.events {
                gen_arena_by_remote.insert(gen.remote_id, gen.arena);
                let rebuilt = self.generators.entry(gen.arena).or_default();
                rebuilt.emitted = rebuilt.emitted || gen.emitted;
            }
        }
        for gen in &dump.free_events {
            gen_arena_by_remote.insert(gen.remote_id, gen.arena);
            let rebuilt = self.generators.entry(gen.arena).or_default();
            rebuilt.emitted = rebuilt.emitted || gen.emitted;
        }

        for edge in &dump.event_edges {
            if event_kind_by_name(&edge.kind).is_none() {
                continue;
            }
            if let (Some(&from), Some(&to)) = (
                gen_arena_by_remote.get(&edge.from),
                gen_arena_by_remote.get(&edge.to),
            ) {
                self.event_edges
                    .insert((edge.kind.clone(), from, to), edge.info.clone());
            }
        }
        for edge in &dump.task_edges {
            if task_kind_by_name(&edge.kind).is_none() {
                continue;
            }
            if let (Some(&from), Some(&to)) = (
                task_arena_by_remote.get(&edge.from),
                task_arena_by_remote.get(&edge.to),
            ) {
                self.task_edges
                    .insert((edge.kind.clone(), from, to), edge.info.clone());
            }
        }

        self.missions = dump
            .missions
            .iter()
            .filter_map(|r| task_arena_by_remote.get(r).copied())
            .collect();
        self.permanent_tasks = dump
            .permanent_tasks
            .iter()
            .filter_map(|r| task_arena_by_remote.get(r).copied())
            .collect();
    }
}

fn malformed(method: LogMethod, reason: &str) -> LogError {
    LogError::MalformedRecord {
        method: method.to_string(),
        reason: reason.to_string(),
    }
}

fn id_arg(entry: &LogEntry, index: usize) -> Result<u64, LogError> {
    entry
        .args
        .get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed(entry.method, &format!("arg {index} is not an id")))
}

fn str_arg(entry: &LogEntry, index: usize) -> Result<String, LogError> {
    entry
        .args
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed(entry.method, &format!("arg {index} is not a string")))
}

fn edge_args(entry: &LogEntry) -> Result<(String, String, u64, u64), LogError> {
    Ok((
        str_arg(entry, 0)?,
        str_arg(entry, 1)?,
        id_arg(entry, 2)?,
        id_arg(entry, 3)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(method: LogMethod, args: Vec<Value>) -> LogEntry {
        LogEntry::at(method, 0, 0, args)
    }

    #[test]
    fn fired_records_build_history() {
        let mut rebuilder = PlanRebuilder::new();
        rebuilder
            .apply_all(&[
                entry(LogMethod::GeneratorFired, vec![json!(1), json!(10), json!([])]),
                entry(LogMethod::GeneratorFired, vec![json!(1), json!(11), json!([])]),
            ])
            .unwrap();
        let generator = rebuilder.generator(1).unwrap();
        assert!(generator.emitted);
        assert_eq!(generator.history, vec![10, 11]);
    }

    #[test]
    fn edges_are_added_and_removed() {
        let mut rebuilder = PlanRebuilder::new();
        rebuilder
            .apply(&entry(
                LogMethod::AddedEdge,
                vec![json!("event"), json!("signal"), json!(1), json!(2), Value::Null],
            ))
            .unwrap();
        assert!(rebuilder.has_event_edge("signal", 1, 2));

        rebuilder
            .apply(&entry(
                LogMethod::RemovedEdge,
                vec![json!("event"), json!("signal"), json!(1), json!(2)],
            ))
            .unwrap();
        assert!(!rebuilder.has_event_edge("signal", 1, 2));
    }

    #[test]
    fn finalization_deregisters_ids() {
        let mut rebuilder = PlanRebuilder::new();
        rebuilder
            .apply_all(&[
                entry(LogMethod::GeneratorFired, vec![json!(5), json!(1), json!([])]),
                entry(
                    LogMethod::AddedEdge,
                    vec![json!("event"), json!("forward"), json!(5), json!(6), Value::Null],
                ),
                entry(LogMethod::FinalizedEvent, vec![json!(5)]),
            ])
            .unwrap();

        assert!(rebuilder.generator(5).is_none());
        assert!(!rebuilder.has_event_edge("forward", 5, 6));
        assert_eq!(rebuilder.finalized(), &[5]);

        // A later generation reusing the id starts clean.
        rebuilder
            .apply(&entry(
                LogMethod::GeneratorFired,
                vec![json!(5), json!(2), json!([])],
            ))
            .unwrap();
        assert_eq!(rebuilder.generator(5).unwrap().history, vec![2]);
    }

    #[test]
    fn garbage_requires_a_known_task() {
        let mut rebuilder = PlanRebuilder::new();
        let err = rebuilder
            .apply(&entry(LogMethod::GarbageTask, vec![json!(9)]))
            .unwrap_err();
        assert!(matches!(err, LogError::UnknownId { .. }));
    }

    #[test]
    fn cycle_end_updates_marks() {
        let mut rebuilder = PlanRebuilder::new();
        rebuilder
            .apply(&entry(
                LogMethod::CycleEnd,
                vec![
                    json!(0),
                    json!({"missions": [1, 2], "permanent_tasks": [3]}),
                ],
            ))
            .unwrap();
        assert_eq!(rebuilder.cycle_count(), 1);
        assert_eq!(
            rebuilder.mission_tasks().iter().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            rebuilder.permanent_tasks().iter().copied().collect::<Vec<_>>(),
            vec![3]
        );
    }

    #[test]
    fn malformed_records_are_rejected() {
        let mut rebuilder = PlanRebuilder::new();
        let err = rebuilder
            .apply(&entry(LogMethod::GeneratorFired, vec![json!("nope")]))
            .unwrap_err();
        assert!(matches!(err, LogError::MalformedRecord { .. }));
    }
}
