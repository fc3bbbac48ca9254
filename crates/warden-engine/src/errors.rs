//! Localized execution errors and their per-cycle aggregate.
//!
//! Execution errors are not structural errors: they happen while the
//! plan runs, carry a *localization* (the event, generator or task
//! they happened at), travel through the error-handling relation, and
//! force garbage collection when nothing repairs them.

use std::fmt;
use warden_types::{ErrorCode, GenId, PropagationId, TaskId};

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// A command raised, or was invoked on a non-executable event.
    CommandFailed,
    /// An emission was attempted in an illegal state.
    EmissionFailed,
    /// A generator that something depended on became unreachable.
    UnreachableEvent,
    /// A dependency child emitted a forbidden event or lost a desired
    /// one.
    ChildFailed,
    /// A task could not even be stopped cleanly; it is quarantined.
    EmergencyTermination,
    /// A user handler or poll block raised.
    CodeError,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandFailed => write!(f, "command failed"),
            Self::EmissionFailed => write!(f, "emission failed"),
            Self::UnreachableEvent => write!(f, "unreachable event"),
            Self::ChildFailed => write!(f, "child failed"),
            Self::EmergencyTermination => write!(f, "emergency termination"),
            Self::CodeError => write!(f, "code error"),
        }
    }
}

/// Where an error is localized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLocus {
    /// A task as a whole.
    Task(TaskId),
    /// An event generator.
    Generator(GenId),
    /// One concrete emission.
    Emission(PropagationId),
}

impl fmt::Display for ErrorLocus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(id) => write!(f, "{id}"),
            Self::Generator(id) => write!(f, "{id}"),
            Self::Emission(id) => write!(f, "{id}"),
        }
    }
}

/// One localized execution error.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    /// Engine-unique error id, referenced by `originals` of errors
    /// derived from this one.
    pub id: u64,
    /// Error class.
    pub kind: ExecutionErrorKind,
    /// Where it happened.
    pub locus: ErrorLocus,
    /// The owning task, derived when possible.
    pub task: Option<TaskId>,
    /// Human-readable description.
    pub message: String,
    /// Ids of errors this one was derived from.
    pub originals: Vec<u64>,
}

impl ExecutionError {
    /// Builds an error record.
    #[must_use]
    pub fn new(
        id: u64,
        kind: ExecutionErrorKind,
        locus: ErrorLocus,
        task: Option<TaskId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            locus,
            task,
            message: message.into(),
            originals: Vec::new(),
        }
    }

    /// Links an error this one was derived from.
    #[must_use]
    pub fn caused_by(mut self, original: u64) -> Self {
        self.originals.push(original);
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.kind, self.locus)?;
        if let Some(task) = self.task {
            write!(f, " ({task})")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ExecutionError {}

impl ErrorCode for ExecutionError {
    fn code(&self) -> &'static str {
        match self.kind {
            ExecutionErrorKind::CommandFailed => "ENGINE_COMMAND_FAILED",
            ExecutionErrorKind::EmissionFailed => "ENGINE_EMISSION_FAILED",
            ExecutionErrorKind::UnreachableEvent => "ENGINE_UNREACHABLE_EVENT",
            ExecutionErrorKind::ChildFailed => "ENGINE_CHILD_FAILED",
            ExecutionErrorKind::EmergencyTermination => "ENGINE_EMERGENCY_TERMINATION",
            ExecutionErrorKind::CodeError => "ENGINE_CODE_ERROR",
        }
    }

    fn is_recoverable(&self) -> bool {
        // A repair task can handle these through the error-handling
        // relation; the rest point at broken code.
        matches!(
            self.kind,
            ExecutionErrorKind::CommandFailed
                | ExecutionErrorKind::ChildFailed
                | ExecutionErrorKind::UnreachableEvent
        )
    }
}

/// Every localized error of one cycle, in occurrence order.
#[derive(Debug, Clone, Default)]
pub struct MultipleExecutionErrors {
    errors: Vec<ExecutionError>,
}

impl MultipleExecutionErrors {
    /// Wraps a cycle's errors.
    #[must_use]
    pub fn new(errors: Vec<ExecutionError>) -> Self {
        Self { errors }
    }

    /// Every error, in occurrence order.
    #[must_use]
    pub fn all(&self) -> &[ExecutionError] {
        &self.errors
    }

    /// Whether the cycle was error-free.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The errors that are not transitively referenced by another:
    /// each failure surfaces at most once.
    #[must_use]
    pub fn original_exceptions(&self) -> Vec<&ExecutionError> {
        let mut referenced: Vec<u64> = Vec::new();
        let mut frontier: Vec<u64> = self
            .errors
            .iter()
            .flat_map(|e| e.originals.iter().copied())
            .collect();
        while let Some(id) = frontier.pop() {
            if referenced.contains(&id) {
                continue;
            }
            referenced.push(id);
            if let Some(error) = self.errors.iter().find(|e| e.id == id) {
                frontier.extend(error.originals.iter().copied());
            }
        }
        self.errors
            .iter()
            .filter(|e| !referenced.contains(&e.id))
            .collect()
    }
}

impl fmt::Display for MultipleExecutionErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} execution error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::assert_error_codes;

    fn error(id: u64, kind: ExecutionErrorKind) -> ExecutionError {
        ExecutionError::new(
            id,
            kind,
            ErrorLocus::Task(TaskId::from_raw(1)),
            Some(TaskId::from_raw(1)),
            "boom",
        )
    }

    #[test]
    fn error_codes_follow_convention() {
        assert_error_codes(
            &[
                error(1, ExecutionErrorKind::CommandFailed),
                error(2, ExecutionErrorKind::EmissionFailed),
                error(3, ExecutionErrorKind::UnreachableEvent),
                error(4, ExecutionErrorKind::ChildFailed),
                error(5, ExecutionErrorKind::EmergencyTermination),
                error(6, ExecutionErrorKind::CodeError),
            ],
            "ENGINE_",
        );
    }

    #[test]
    fn display_names_the_localization() {
        let e = ExecutionError::new(
            7,
            ExecutionErrorKind::CommandFailed,
            ErrorLocus::Generator(GenId::from_raw(3)),
            Some(TaskId::from_raw(2)),
            "gripper jammed",
        );
        let text = e.to_string();
        assert!(text.contains("gen:3"));
        assert!(text.contains("task:2"));
        assert!(text.contains("gripper jammed"));
    }

    #[test]
    fn original_exceptions_filters_derived_errors() {
        let root = error(1, ExecutionErrorKind::CodeError);
        let derived = error(2, ExecutionErrorKind::CommandFailed).caused_by(1);
        let independent = error(3, ExecutionErrorKind::ChildFailed);

        let aggregate = MultipleExecutionErrors::new(vec![root, derived, independent]);
        let originals = aggregate.original_exceptions();
        let ids: Vec<u64> = originals.iter().map(|e| e.id).collect();
        // The root is referenced by the derived error and filtered out;
        // order of the survivors is preserved.
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn transitive_references_are_filtered() {
        let a = error(1, ExecutionErrorKind::CodeError);
        let b = error(2, ExecutionErrorKind::CommandFailed).caused_by(1);
        let c = error(3, ExecutionErrorKind::ChildFailed).caused_by(2);

        let aggregate = MultipleExecutionErrors::new(vec![a, b, c]);
        let ids: Vec<u64> = aggregate.original_exceptions().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3]);
    }
}
