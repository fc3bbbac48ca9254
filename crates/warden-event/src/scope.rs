//! The window through which handlers and commands act on the plan.

use crate::handlers::HandlerResult;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use warden_types::{CycleIndex, ErrorCode, GenId, TaskId};

/// Engine surface exposed to handlers, commands and poll blocks.
///
/// User code never holds plan objects; it asks the scope to act on
/// generators by id. Emissions and calls requested through a scope are
/// enqueued into the current propagation pass and delivered in the same
/// cycle when no precedence edge forbids it.
///
/// # Example
///
/// ```no_run
/// use warden_event::{EventScope, HandlerResult};
/// use warden_types::TaskId;
///
/// fn stop_task(scope: &mut dyn EventScope, task: TaskId) -> HandlerResult {
///     let stop = scope
///         .task_event(task, "stop")
///         .ok_or("task has no stop event")?;
///     scope.call(stop, vec![])?;
///     Ok(())
/// }
/// ```
pub trait EventScope {
    /// Enqueues an emission of `target` with the given context.
    ///
    /// # Errors
    ///
    /// [`ScopeError::UnknownGenerator`] when `target` is not in the plan,
    /// [`ScopeError::NotExecutable`] when the target may not emit.
    fn emit(&mut self, target: GenId, context: Vec<Value>) -> Result<(), ScopeError>;

    /// Enqueues a command invocation on `target`.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotControllable`] when `target` has no command, plus
    /// the [`emit`](Self::emit) failure modes.
    fn call(&mut self, target: GenId, context: Vec<Value>) -> Result<(), ScopeError>;

    /// Marks `target` unreachable with the given reason.
    ///
    /// # Errors
    ///
    /// [`ScopeError::UnknownGenerator`] when `target` is not in the plan.
    fn emit_failed(&mut self, target: GenId, reason: &str) -> Result<(), ScopeError>;

    /// Resolves a task event generator by symbol.
    fn task_event(&self, task: TaskId, symbol: &str) -> Option<GenId>;

    /// The task a generator is bound to, `None` for free events.
    fn owner_task(&self, target: GenId) -> Option<TaskId>;

    /// Reads a concrete task argument. Returns `None` for unknown tasks,
    /// unset arguments and delayed values.
    fn argument(&self, task: TaskId, name: &str) -> Option<Value>;

    /// Whether the generator has emitted at least once.
    fn emitted(&self, target: GenId) -> bool;

    /// Index of the cycle currently executing.
    fn cycle(&self) -> CycleIndex;
}

/// Errors surfaced to handlers acting through an [`EventScope`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScopeError {
    /// The target generator is not part of the engine's plan.
    #[error("unknown generator {0}")]
    UnknownGenerator(GenId),

    /// The target has no command.
    #[error("generator {0} is not controllable")]
    NotControllable(GenId),

    /// The target may not emit: its plan is not executable, its task is
    /// abstract or not fully instanciated, or it is already unreachable.
    #[error("generator {0} is not executable")]
    NotExecutable(GenId),
}

impl ErrorCode for ScopeError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownGenerator(_) => "EVENT_UNKNOWN_GENERATOR",
            Self::NotControllable(_) => "EVENT_NOT_CONTROLLABLE",
            Self::NotExecutable(_) => "EVENT_NOT_EXECUTABLE",
        }
    }

    fn is_recoverable(&self) -> bool {
        // Executability can change when arguments get assigned or the
        // plan becomes executable.
        matches!(self, Self::NotExecutable(_))
    }
}

/// Closure type of event commands.
///
/// The command receives the generator being commanded and the invocation
/// context; it must either emit (through the scope, now or on a later
/// cycle) or fail.
pub type CommandFn = Arc<dyn Fn(&mut dyn EventScope, GenId, Vec<Value>) -> HandlerResult + Send + Sync>;

/// The command of a controllable generator.
#[derive(Clone)]
pub enum CommandSpec {
    /// Emit the generator immediately when called. The default command
    /// of `start`.
    EmitOnCall,
    /// User-provided command body.
    Custom(CommandFn),
}

impl CommandSpec {
    /// Wraps a user command body.
    #[must_use]
    pub fn custom(
        f: impl Fn(&mut dyn EventScope, GenId, Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        Self::Custom(Arc::new(f))
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmitOnCall => write!(f, "CommandSpec::EmitOnCall"),
            Self::Custom(_) => write!(f, "CommandSpec::Custom(..)"),
        }
    }
}
