//! Relation vocabulary.
//!
//! A relation is a typed directed graph between plan objects. The kinds
//! defined here name the graphs every plan maintains; the graphs
//! themselves live in the plan layer.
//!
//! # Flags
//!
//! | Flag | Meaning |
//! |------|---------|
//! | `dag` | adding an edge that closes a cycle is rejected |
//! | `copy_on_replace` | replacement copies the edge instead of moving it |
//! | `strong` | replacement never touches the edge |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structural properties of a relation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelationFlags {
    /// Cycles are forbidden.
    pub dag: bool,
    /// On task replacement the edge is duplicated onto the replacement
    /// instead of moved.
    pub copy_on_replace: bool,
    /// Replacement-time rewiring skips the edge entirely.
    pub strong: bool,
}

impl RelationFlags {
    /// A plain DAG relation.
    #[must_use]
    pub fn dag() -> Self {
        Self {
            dag: true,
            ..Self::default()
        }
    }
}

/// Relations between event generators.
///
/// # Semantics
///
/// - `Signal`: on source emission, the target's command is invoked.
/// - `Forward`: on source emission, the target is emitted (no command).
/// - `Precedence`: orders emissions within one execution cycle.
/// - `CausalLink`: documents a causal dependency; not walked by
///   propagation, but validated and rewired like the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventRelationKind {
    /// Source emission invokes the target's command.
    Signal,
    /// Source emission emits the target.
    Forward,
    /// In-cycle emission ordering.
    Precedence,
    /// Declared causality, not propagated.
    CausalLink,
}

impl EventRelationKind {
    /// All event relation kinds, in graph-registration order.
    pub const ALL: [Self; 4] = [Self::Signal, Self::Forward, Self::Precedence, Self::CausalLink];

    /// Structural flags of this kind.
    #[must_use]
    pub fn flags(self) -> RelationFlags {
        // All event relations are DAGs; none is strong or copied.
        RelationFlags::dag()
    }
}

impl fmt::Display for EventRelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Forward => write!(f, "forward"),
            Self::Precedence => write!(f, "precedence"),
            Self::CausalLink => write!(f, "causal_link"),
        }
    }
}

/// Relations between tasks.
///
/// # Semantics
///
/// - `Dependency`: parent needs child; edge info carries the desired and
///   forbidden event sets and an optional role name.
/// - `ErrorHandling`: associates a repair task with the failures it may
///   recover from; copied on replacement so the repair keeps covering the
///   replacement task.
/// - `PlannedBy`: links a task to the task that plans it; strong, so
///   replacement leaves the planning relation where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskRelationKind {
    /// Parent-needs-child, with desired/forbidden event sets.
    Dependency,
    /// Repair task coverage.
    ErrorHandling,
    /// Planning provenance; never rewired.
    PlannedBy,
}

impl TaskRelationKind {
    /// All task relation kinds, in graph-registration order.
    pub const ALL: [Self; 3] = [Self::Dependency, Self::ErrorHandling, Self::PlannedBy];

    /// Structural flags of this kind.
    #[must_use]
    pub fn flags(self) -> RelationFlags {
        match self {
            Self::Dependency => RelationFlags::dag(),
            Self::ErrorHandling => RelationFlags {
                dag: false,
                copy_on_replace: true,
                strong: false,
            },
            Self::PlannedBy => RelationFlags {
                dag: true,
                copy_on_replace: false,
                strong: true,
            },
        }
    }
}

impl fmt::Display for TaskRelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dependency => write!(f, "dependency"),
            Self::ErrorHandling => write!(f, "error_handling"),
            Self::PlannedBy => write!(f, "planned_by"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_relations_are_dags() {
        for kind in EventRelationKind::ALL {
            let flags = kind.flags();
            assert!(flags.dag, "{kind} must be a DAG");
            assert!(!flags.strong);
            assert!(!flags.copy_on_replace);
        }
    }

    #[test]
    fn error_handling_is_copied_on_replace() {
        let flags = TaskRelationKind::ErrorHandling.flags();
        assert!(flags.copy_on_replace);
        assert!(!flags.strong);
    }

    #[test]
    fn planned_by_is_strong() {
        let flags = TaskRelationKind::PlannedBy.flags();
        assert!(flags.strong);
        assert!(flags.dag);
    }

    #[test]
    fn display_names() {
        assert_eq!(EventRelationKind::Signal.to_string(), "signal");
        assert_eq!(EventRelationKind::CausalLink.to_string(), "causal_link");
        assert_eq!(TaskRelationKind::Dependency.to_string(), "dependency");
    }
}
