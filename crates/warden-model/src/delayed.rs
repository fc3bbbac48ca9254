//! Delayed argument values.
//!
//! A delayed argument defers its value until `freeze_delayed_arguments`
//! runs, typically right before the task starts. "No value yet" is a
//! normal outcome, not an error: the freeze simply leaves the argument
//! delayed and may be retried on a later cycle.

use crate::arguments::TaskArguments;
use serde_json::Value;
use std::sync::Arc;

/// Outcome of evaluating a delayed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayedOutcome {
    /// The value is available.
    Ready(Value),
    /// No value yet; try again on a later freeze.
    NotYet,
}

/// A deferred argument value.
///
/// Evaluation reads the task's other arguments, which covers the common
/// decomposition case where a low-level value derives from a high-level
/// one assigned later.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use warden_model::{delayed_fn, DelayedOutcome, TaskArguments};
///
/// let half_speed = delayed_fn(|args: &TaskArguments| {
///     match args.get("speed") {
///         Some(v) => DelayedOutcome::Ready(json!(v.as_f64().unwrap() / 2.0)),
///         None => DelayedOutcome::NotYet,
///     }
/// });
///
/// let args = TaskArguments::new();
/// assert_eq!(half_speed.evaluate(&args), DelayedOutcome::NotYet);
/// ```
pub trait DelayedArgument: Send + Sync {
    /// Attempts to produce the value.
    fn evaluate(&self, args: &TaskArguments) -> DelayedOutcome;

    /// Human-readable description for diagnostics.
    fn describe(&self) -> String {
        "delayed".to_string()
    }
}

struct DelayedFn<F>(F);

impl<F> DelayedArgument for DelayedFn<F>
where
    F: Fn(&TaskArguments) -> DelayedOutcome + Send + Sync,
{
    fn evaluate(&self, args: &TaskArguments) -> DelayedOutcome {
        (self.0)(args)
    }
}

/// Wraps a closure as a delayed argument.
#[must_use]
pub fn delayed_fn<F>(f: F) -> Arc<dyn DelayedArgument>
where
    F: Fn(&TaskArguments) -> DelayedOutcome + Send + Sync + 'static,
{
    Arc::new(DelayedFn(f))
}

struct DelayedValue(Value);

impl DelayedArgument for DelayedValue {
    fn evaluate(&self, _args: &TaskArguments) -> DelayedOutcome {
        DelayedOutcome::Ready(self.0.clone())
    }

    fn describe(&self) -> String {
        format!("delayed({})", self.0)
    }
}

/// A delayed argument that always resolves to a fixed value.
///
/// Mostly useful in tests, where it stands in for a value that only
/// becomes observable at freeze time.
#[must_use]
pub fn delayed_value(value: Value) -> Arc<dyn DelayedArgument> {
    Arc::new(DelayedValue(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delayed_value_is_always_ready() {
        let d = delayed_value(json!(10));
        assert_eq!(
            d.evaluate(&TaskArguments::new()),
            DelayedOutcome::Ready(json!(10))
        );
        assert_eq!(d.describe(), "delayed(10)");
    }

    #[test]
    fn delayed_fn_reads_other_arguments() {
        let d = delayed_fn(|args: &TaskArguments| match args.get("base") {
            Some(v) => DelayedOutcome::Ready(json!(v.as_i64().unwrap() + 1)),
            None => DelayedOutcome::NotYet,
        });

        let mut args = TaskArguments::new();
        assert_eq!(d.evaluate(&args), DelayedOutcome::NotYet);

        args.insert_concrete("base", json!(41));
        assert_eq!(d.evaluate(&args), DelayedOutcome::Ready(json!(42)));
    }
}
