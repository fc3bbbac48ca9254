//! Plan layer errors.
//!
//! Structural errors are surfaced to the caller of the offending
//! mutation and never travel through the event graph.
//!
//! | Error | Code | Recoverable |
//! |-------|------|-------------|
//! | [`PlanError::CycleFound`] | `PLAN_CYCLE_FOUND` | No |
//! | [`PlanError::UnknownTask`] | `PLAN_UNKNOWN_TASK` | No |
//! | [`PlanError::UnknownGenerator`] | `PLAN_UNKNOWN_GENERATOR` | No |
//! | [`PlanError::TaskEventNotExecutable`] | `PLAN_TASK_EVENT_NOT_EXECUTABLE` | Yes |
//! | [`PlanError::ModelViolation`] | `PLAN_MODEL_VIOLATION` | No |
//! | [`PlanError::NoSuchEvent`] | `PLAN_NO_SUCH_EVENT` | No |
//! | [`PlanError::StaleProxy`] | `PLAN_STALE_PROXY` | Yes |
//! | [`PlanError::Model`] | inherited | inherited |

use thiserror::Error;
use warden_model::ModelError;
use warden_types::{ErrorCode, GenId, TaskId};

/// Errors raised by structural plan mutations.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    /// Adding the edge to a DAG relation would close a cycle. The graph
    /// is left untouched.
    #[error("{relation} edge {from} -> {to} would close a cycle")]
    CycleFound {
        /// Relation name.
        relation: String,
        /// Source vertex, formatted.
        from: String,
        /// Target vertex, formatted.
        to: String,
    },

    /// The referenced task is not part of this plan.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// The referenced generator is not part of this plan.
    #[error("unknown generator {0}")]
    UnknownGenerator(GenId),

    /// A command or emission was requested on a task event that may not
    /// execute.
    #[error("event '{symbol}' of {task} is not executable")]
    TaskEventNotExecutable {
        /// The owning task.
        task: TaskId,
        /// The event symbol.
        symbol: String,
    },

    /// A mutation breaks a structural rule (e.g. a signal edge from a
    /// terminal event to a non-terminal one).
    #[error("model violation: {0}")]
    ModelViolation(String),

    /// A task has no event with the given symbol.
    #[error("{task} has no event '{symbol}'")]
    NoSuchEvent {
        /// The task.
        task: TaskId,
        /// The missing symbol.
        symbol: String,
    },

    /// A transaction proxy refers to an object that left the plan
    /// between wrap and commit (typically garbage-collected).
    #[error("proxy refers to {0}, which is no longer in the plan")]
    StaleProxy(String),

    /// An argument-system error raised through a plan operation.
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl ErrorCode for PlanError {
    fn code(&self) -> &'static str {
        match self {
            Self::CycleFound { .. } => "PLAN_CYCLE_FOUND",
            Self::UnknownTask(_) => "PLAN_UNKNOWN_TASK",
            Self::UnknownGenerator(_) => "PLAN_UNKNOWN_GENERATOR",
            Self::TaskEventNotExecutable { .. } => "PLAN_TASK_EVENT_NOT_EXECUTABLE",
            Self::ModelViolation(_) => "PLAN_MODEL_VIOLATION",
            Self::NoSuchEvent { .. } => "PLAN_NO_SUCH_EVENT",
            Self::StaleProxy(_) => "PLAN_STALE_PROXY",
            Self::Model(inner) => inner.code(),
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Executability changes when arguments arrive; a stale
            // proxy can be re-wrapped against the live plan.
            Self::TaskEventNotExecutable { .. } | Self::StaleProxy(_) => true,
            Self::Model(inner) => inner.is_recoverable(),
            _ => false,
        }
    }
}
