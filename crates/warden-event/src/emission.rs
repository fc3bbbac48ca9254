//! The immutable record of one event occurrence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use warden_types::{GenId, PropagationId, TaskId};

/// One occurrence of an event.
///
/// An `Emission` is produced when an event generator fires and is never
/// mutated afterwards: the generator's history is an append-only sequence
/// of emissions, and `failure_reason` references on tasks point at
/// emissions by [`PropagationId`].
///
/// # Provenance
///
/// The engine records where an emission came from:
///
/// - [`sources`](Self::sources): the emissions whose propagation step
///   (signal or forward edge, or a handler running for them) directly
///   produced this one.
/// - [`all_sources`](Self::all_sources): the transitive closure of
///   `sources`, computed at creation.
/// - [`task_sources`](Self::task_sources): the subset of `all_sources`
///   that was emitted by task-bound generators.
///
/// # Example
///
/// ```
/// use warden_event::Emission;
/// use warden_types::{GenId, PropagationId};
///
/// let e = Emission::new(
///     PropagationId::from_raw(4),
///     GenId::from_raw(1),
///     None,
///     vec![serde_json::json!(10)],
///     vec![PropagationId::from_raw(2)],
///     vec![PropagationId::from_raw(1), PropagationId::from_raw(2)],
///     vec![],
/// );
/// assert_eq!(e.context[0], serde_json::json!(10));
/// assert_eq!(e.sources.len(), 1);
/// assert_eq!(e.all_sources.len(), 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emission {
    /// Identifier of this emission, unique per engine.
    pub propagation_id: PropagationId,
    /// Time at which the emission was recorded.
    pub time: DateTime<Utc>,
    /// The generator this emission fired from.
    pub generator: GenId,
    /// The owning task, when the generator is task-bound.
    pub task: Option<TaskId>,
    /// User payload attached at emission time.
    pub context: Vec<Value>,
    /// Emissions that directly produced this one.
    pub sources: Vec<PropagationId>,
    /// Transitive closure of `sources`.
    pub all_sources: Vec<PropagationId>,
    /// Subset of `all_sources` emitted by task-bound generators.
    pub task_sources: Vec<PropagationId>,
}

impl Emission {
    /// Builds an emission record. The engine stamps `time` with the
    /// current instant.
    #[must_use]
    pub fn new(
        propagation_id: PropagationId,
        generator: GenId,
        task: Option<TaskId>,
        context: Vec<Value>,
        sources: Vec<PropagationId>,
        all_sources: Vec<PropagationId>,
        task_sources: Vec<PropagationId>,
    ) -> Self {
        Self {
            propagation_id,
            time: Utc::now(),
            generator,
            task,
            context,
            sources,
            all_sources,
            task_sources,
        }
    }

    /// The owning task, when the generator is task-bound.
    #[must_use]
    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    /// Whether this emission was produced by another emission (rather
    /// than an external call or injection).
    #[must_use]
    pub fn is_propagated(&self) -> bool {
        !self.sources.is_empty()
    }
}

impl fmt::Display for Emission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emission {} of {}", self.propagation_id, self.generator)
    }
}

/// Why a generator will never emit again.
///
/// Attached to a generator when it becomes unreachable; if-unreachable
/// handlers receive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnreachableReason {
    /// The generator was removed from its plan before emitting.
    Finalized,
    /// `emit_failed` was called with the given reason.
    EmitFailed(String),
    /// An upstream generator this one achieved through became
    /// unreachable first.
    UpstreamUnreachable(GenId),
}

impl fmt::Display for UnreachableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finalized => write!(f, "finalized before emission"),
            Self::EmitFailed(reason) => write!(f, "emission failed: {reason}"),
            Self::UpstreamUnreachable(gen) => {
                write!(f, "upstream generator {gen} became unreachable")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emission(sources: Vec<PropagationId>) -> Emission {
        Emission::new(
            PropagationId::from_raw(10),
            GenId::from_raw(1),
            Some(TaskId::from_raw(2)),
            vec![],
            sources.clone(),
            sources,
            vec![],
        )
    }

    #[test]
    fn propagated_iff_sourced() {
        assert!(!emission(vec![]).is_propagated());
        assert!(emission(vec![PropagationId::from_raw(1)]).is_propagated());
    }

    #[test]
    fn task_backreference() {
        assert_eq!(emission(vec![]).task(), Some(TaskId::from_raw(2)));
    }

    #[test]
    fn unreachable_reason_display() {
        assert_eq!(
            UnreachableReason::EmitFailed("no route".into()).to_string(),
            "emission failed: no route"
        );
        assert_eq!(
            UnreachableReason::Finalized.to_string(),
            "finalized before emission"
        );
    }

    #[test]
    fn emission_serializes() {
        let e = emission(vec![PropagationId::from_raw(7)]);
        let json = serde_json::to_string(&e).unwrap();
        let back: Emission = serde_json::from_str(&json).unwrap();
        assert_eq!(back.propagation_id, e.propagation_id);
        assert_eq!(back.sources, e.sources);
    }
}
