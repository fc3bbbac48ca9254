//! Handler containers attached to generators and tasks.
//!
//! Every handler carries a [`ReplacePolicy`] deciding what happens to it
//! when its owning task is replaced by another (see the plan layer's
//! replacement operators). The closures themselves are reference-counted
//! so that copying a handler to a replacement task shares the same code.

use crate::emission::{Emission, UnreachableReason};
use crate::scope::{EventScope, ScopeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use warden_types::{GenId, TaskId};

/// Error returned by user handlers, commands and poll blocks.
///
/// The engine wraps it into a localized `CodeError` and emits
/// `internal_error` on the owning task.
#[derive(Debug, Clone)]
pub struct HandlerError(String);

impl HandlerError {
    /// Wraps a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The wrapped message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<ScopeError> for HandlerError {
    fn from(err: ScopeError) -> Self {
        Self(err.to_string())
    }
}

/// Result type for user handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// What happens to a handler when its owning task is replaced.
///
/// `Default` resolves at replacement time: `Copy` when the replaced task
/// is abstract, `Drop` when it is concrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplacePolicy {
    /// Resolve from the replaced task's abstractness.
    #[default]
    Default,
    /// The replacement task receives a copy of the handler.
    Copy,
    /// The handler stays on the replaced task only.
    Drop,
}

impl ReplacePolicy {
    /// Resolves `Default` against the replaced task's abstractness.
    #[must_use]
    pub fn resolve(self, replaced_is_abstract: bool) -> Self {
        match self {
            Self::Default if replaced_is_abstract => Self::Copy,
            Self::Default => Self::Drop,
            other => other,
        }
    }

    /// Whether a resolved policy copies the handler.
    #[must_use]
    pub fn copies(self, replaced_is_abstract: bool) -> bool {
        self.resolve(replaced_is_abstract) == Self::Copy
    }
}

/// Closure type of on-emit handlers.
pub type EmitHandlerFn = Arc<dyn Fn(&mut dyn EventScope, &Emission) -> HandlerResult + Send + Sync>;

/// An on-emit handler registered on a generator.
///
/// Dispatched in registration order every time the generator emits.
/// `once` handlers are removed after their first invocation.
#[derive(Clone)]
pub struct EmitHandler {
    /// The handler body.
    pub f: EmitHandlerFn,
    /// Replacement behavior.
    pub policy: ReplacePolicy,
    /// Remove after the first invocation.
    pub once: bool,
}

impl EmitHandler {
    /// A handler with the default replace policy.
    #[must_use]
    pub fn new(
        f: impl Fn(&mut dyn EventScope, &Emission) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            f: Arc::new(f),
            policy: ReplacePolicy::Default,
            once: false,
        }
    }

    /// Sets the replace policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ReplacePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Marks the handler one-shot.
    #[must_use]
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

impl fmt::Debug for EmitHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmitHandler")
            .field("policy", &self.policy)
            .field("once", &self.once)
            .finish_non_exhaustive()
    }
}

/// Closure type of if-unreachable handlers.
pub type UnreachableHandlerFn =
    Arc<dyn Fn(&mut dyn EventScope, GenId, &UnreachableReason) -> HandlerResult + Send + Sync>;

/// A handler invoked when a generator becomes unreachable.
#[derive(Clone)]
pub struct UnreachableHandler {
    /// The handler body.
    pub f: UnreachableHandlerFn,
    /// Cancel the handler if the generator emits before becoming
    /// unreachable.
    pub cancel_at_emission: bool,
    /// Replacement behavior.
    pub policy: ReplacePolicy,
}

impl UnreachableHandler {
    /// A handler with the default replace policy.
    #[must_use]
    pub fn new(
        cancel_at_emission: bool,
        f: impl Fn(&mut dyn EventScope, GenId, &UnreachableReason) -> HandlerResult
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            f: Arc::new(f),
            cancel_at_emission,
            policy: ReplacePolicy::Default,
        }
    }

    /// Sets the replace policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ReplacePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for UnreachableHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnreachableHandler")
            .field("cancel_at_emission", &self.cancel_at_emission)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Closure type of finalization handlers. Finalization runs while the
/// plan is being mutated, so the handler gets no scope, only the identity
/// of what was removed.
pub type FinalizationHandlerFn = Arc<dyn Fn(GenId) + Send + Sync>;

/// A handler invoked once when a generator is removed from its plan.
#[derive(Clone)]
pub struct FinalizationHandler {
    /// The handler body.
    pub f: FinalizationHandlerFn,
    /// Replacement behavior.
    pub policy: ReplacePolicy,
}

impl FinalizationHandler {
    /// A handler with the default replace policy.
    #[must_use]
    pub fn new(f: impl Fn(GenId) + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            policy: ReplacePolicy::Default,
        }
    }

    /// Sets the replace policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ReplacePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for FinalizationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizationHandler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Closure type of poll and execute blocks.
pub type PollFn = Arc<dyn Fn(&mut dyn EventScope, TaskId) -> HandlerResult + Send + Sync>;

/// A poll block: runs every cycle its task is running, after on-start
/// handlers on the cycle the task becomes running, and at least once
/// before the task stops.
#[derive(Clone)]
pub struct PollHandler {
    /// The poll body.
    pub f: PollFn,
    /// Replacement behavior.
    pub policy: ReplacePolicy,
}

impl PollHandler {
    /// A poll block with the default replace policy.
    #[must_use]
    pub fn new(f: impl Fn(&mut dyn EventScope, TaskId) -> HandlerResult + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            policy: ReplacePolicy::Default,
        }
    }

    /// Sets the replace policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ReplacePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for PollHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollHandler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// An execute block: runs exactly once, on the next cycle on which its
/// task is running.
#[derive(Clone)]
pub struct ExecuteHandler {
    /// The block body.
    pub f: PollFn,
    /// Replacement behavior.
    pub policy: ReplacePolicy,
}

impl ExecuteHandler {
    /// A block with the default replace policy.
    #[must_use]
    pub fn new(f: impl Fn(&mut dyn EventScope, TaskId) -> HandlerResult + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            policy: ReplacePolicy::Default,
        }
    }

    /// Sets the replace policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ReplacePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for ExecuteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteHandler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_resolves_from_abstractness() {
        assert_eq!(ReplacePolicy::Default.resolve(true), ReplacePolicy::Copy);
        assert_eq!(ReplacePolicy::Default.resolve(false), ReplacePolicy::Drop);
    }

    #[test]
    fn explicit_policy_wins() {
        assert_eq!(ReplacePolicy::Copy.resolve(false), ReplacePolicy::Copy);
        assert_eq!(ReplacePolicy::Drop.resolve(true), ReplacePolicy::Drop);
    }

    #[test]
    fn copies_combines_resolution() {
        assert!(ReplacePolicy::Default.copies(true));
        assert!(!ReplacePolicy::Default.copies(false));
        assert!(ReplacePolicy::Copy.copies(false));
        assert!(!ReplacePolicy::Drop.copies(true));
    }

    #[test]
    fn emit_handler_builder() {
        let h = EmitHandler::new(|_, _| Ok(()))
            .with_policy(ReplacePolicy::Copy)
            .once();
        assert_eq!(h.policy, ReplacePolicy::Copy);
        assert!(h.once);
    }

    #[test]
    fn handler_error_from_str() {
        let err: HandlerError = "gripper jammed".into();
        assert_eq!(err.message(), "gripper jammed");
        assert_eq!(err.to_string(), "gripper jammed");
    }
}
