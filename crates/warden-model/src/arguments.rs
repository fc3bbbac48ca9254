//! Task arguments and the parallel assignment protocol.
//!
//! An arguments map stores concrete JSON values and delayed values side
//! by side. Assignment is **parallel**: all setters run against a shared
//! working view, then the result is reconciled against what the caller
//! requested. Either every requested pair is honored or the map rolls
//! back and the call fails with `ArgumentConflict`.

use crate::delayed::{DelayedArgument, DelayedOutcome};
use crate::error::ModelError;
use crate::model::TaskModel;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use warden_event::HandlerError;

/// A stored argument value: concrete, or deferred until freeze time.
#[derive(Clone)]
pub enum ArgumentValue {
    /// A plain value.
    Concrete(Value),
    /// A value evaluated by `freeze_delayed`.
    Delayed(Arc<dyn DelayedArgument>),
}

impl ArgumentValue {
    /// Whether the value is still delayed.
    #[must_use]
    pub fn is_delayed(&self) -> bool {
        matches!(self, Self::Delayed(_))
    }

    /// The concrete value, `None` when delayed.
    #[must_use]
    pub fn concrete(&self) -> Option<&Value> {
        match self {
            Self::Concrete(v) => Some(v),
            Self::Delayed(_) => None,
        }
    }
}

impl fmt::Debug for ArgumentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(v) => write!(f, "Concrete({v})"),
            Self::Delayed(d) => write!(f, "Delayed({})", d.describe()),
        }
    }
}

impl From<Value> for ArgumentValue {
    fn from(value: Value) -> Self {
        Self::Concrete(value)
    }
}

impl From<Arc<dyn DelayedArgument>> for ArgumentValue {
    fn from(delayed: Arc<dyn DelayedArgument>) -> Self {
        Self::Delayed(delayed)
    }
}

/// One stored argument.
#[derive(Debug, Clone)]
pub struct ArgumentEntry {
    /// The stored value.
    pub value: ArgumentValue,
    /// Whether the value came from the model's declared default.
    pub from_default: bool,
}

/// Setter hook declared on a model argument.
///
/// Receives the working view of the arguments map and the requested
/// value; it may write any number of keys, which is how a high-level
/// argument decomposes into low-level ones.
pub type ArgumentSetter =
    Arc<dyn Fn(&mut SetterScope<'_>, &Value) -> Result<(), HandlerError> + Send + Sync>;

/// Mutable view handed to argument setters during parallel assignment.
pub struct SetterScope<'a> {
    entries: &'a mut BTreeMap<String, ArgumentEntry>,
}

impl SetterScope<'_> {
    /// Writes a concrete value.
    pub fn set(&mut self, name: &str, value: Value) {
        self.entries.insert(
            name.to_string(),
            ArgumentEntry {
                value: ArgumentValue::Concrete(value),
                from_default: false,
            },
        );
    }

    /// Removes an argument.
    pub fn unset(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Reads a concrete value from the working view.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).and_then(|e| e.value.concrete())
    }
}

/// The arguments map of a task.
///
/// Writable until the task starts; the engine freezes it at `start!`.
#[derive(Debug, Clone, Default)]
pub struct TaskArguments {
    entries: BTreeMap<String, ArgumentEntry>,
    frozen: bool,
}

impl TaskArguments {
    /// An empty, writable map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A map pre-filled with the model's declared defaults.
    #[must_use]
    pub fn from_model(model: &TaskModel) -> Self {
        let mut entries = BTreeMap::new();
        for decl in model.arguments() {
            if let Some(default) = &decl.default {
                entries.insert(
                    decl.name.clone(),
                    ArgumentEntry {
                        value: ArgumentValue::Concrete(default.clone()),
                        from_default: true,
                    },
                );
            }
        }
        Self {
            entries,
            frozen: false,
        }
    }

    /// Reads a concrete value. Returns `None` for unset names and
    /// delayed values.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).and_then(|e| e.value.concrete())
    }

    /// Reads the raw entry, delayed or not.
    #[must_use]
    pub fn raw(&self, name: &str) -> Option<&ArgumentEntry> {
        self.entries.get(name)
    }

    /// True iff the name is set and the value is not delayed.
    #[must_use]
    pub fn has_argument(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True iff the name is set at all, delayed included.
    #[must_use]
    pub fn is_set(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// True iff no stored value is delayed.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.entries.values().all(|e| !e.value.is_delayed())
    }

    /// Whether the map still accepts assignments.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freezes the map; further assignments fail with
    /// [`ModelError::ArgumentsFrozen`].
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Number of stored arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over stored entries in name order.
    pub fn each(&self) -> impl Iterator<Item = (&str, &ArgumentEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Direct insertion of a concrete value, bypassing setters. Used by
    /// restore paths and tests; regular code goes through
    /// [`assign`](Self::assign).
    pub fn insert_concrete(&mut self, name: &str, value: Value) {
        self.entries.insert(
            name.to_string(),
            ArgumentEntry {
                value: ArgumentValue::Concrete(value),
                from_default: false,
            },
        );
    }

    /// True iff every declared argument is set and not delayed.
    #[must_use]
    pub fn fully_instanciated(&self, model: &TaskModel) -> bool {
        model.arguments().iter().all(|d| self.has_argument(&d.name))
    }

    /// Concrete arguments, excluding those equal to their declared
    /// default.
    #[must_use]
    pub fn meaningful(&self, model: &TaskModel) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .filter_map(|(name, entry)| {
                let value = entry.value.concrete()?;
                let default = model.find_argument(name).and_then(|d| d.default.as_ref());
                if default == Some(value) {
                    None
                } else {
                    Some((name.clone(), value.clone()))
                }
            })
            .collect()
    }

    /// All concrete arguments, for serialization. Delayed values are
    /// skipped: they have no value to dump.
    #[must_use]
    pub fn concrete_map(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .filter_map(|(name, entry)| Some((name.clone(), entry.value.concrete()?.clone())))
            .collect()
    }

    /// Parallel assignment.
    ///
    /// Runs in three phases: snapshot, setters against a shared working
    /// view, reconciliation of the requested pairs against the result.
    /// Delayed requested values are stored as-is without running their
    /// setter.
    ///
    /// # Errors
    ///
    /// - [`ModelError::ArgumentsFrozen`] when the map no longer accepts
    ///   writes; nothing is modified.
    /// - [`ModelError::SetterFailed`] when a setter errors; rolled back.
    /// - [`ModelError::ArgumentConflict`] when a requested value does
    ///   not survive reconciliation; rolled back.
    pub fn assign(
        &mut self,
        model: &TaskModel,
        requested: Vec<(String, ArgumentValue)>,
    ) -> Result<(), ModelError> {
        if self.frozen {
            if let Some((name, _)) = requested.first() {
                return Err(ModelError::ArgumentsFrozen { name: name.clone() });
            }
            return Ok(());
        }

        let snapshot = self.entries.clone();

        for (name, value) in &requested {
            match value {
                ArgumentValue::Delayed(_) => {
                    // Stored as-is; the setter runs at freeze time, once
                    // the value is concrete.
                    self.entries.insert(
                        name.clone(),
                        ArgumentEntry {
                            value: value.clone(),
                            from_default: false,
                        },
                    );
                }
                ArgumentValue::Concrete(concrete) => {
                    let setter = model.find_argument(name).and_then(|d| d.setter.clone());
                    let mut scope = SetterScope {
                        entries: &mut self.entries,
                    };
                    match setter {
                        Some(setter) => {
                            if let Err(err) = (*setter)(&mut scope, concrete) {
                                self.entries = snapshot;
                                return Err(ModelError::SetterFailed {
                                    name: name.clone(),
                                    message: err.to_string(),
                                });
                            }
                        }
                        None => scope.set(name, concrete.clone()),
                    }
                }
            }
        }

        // Reconciliation: a requested value must be stored exactly, or
        // have been removed by a setter.
        for (name, value) in &requested {
            let Some(requested_concrete) = value.concrete() else {
                continue;
            };
            match self.entries.get(name).and_then(|e| e.value.concrete()) {
                None if !self.entries.contains_key(name) => {}
                Some(stored) if stored == requested_concrete => {}
                stored => {
                    let stored = stored.cloned().unwrap_or(Value::Null);
                    self.entries = snapshot;
                    return Err(ModelError::ArgumentConflict {
                        name: name.clone(),
                        requested: requested_concrete.clone(),
                        stored,
                    });
                }
            }
        }

        Ok(())
    }

    /// Evaluates delayed values still present and forwards the ready
    /// ones to [`assign`](Self::assign) in one call. Values that answer
    /// "not yet" stay delayed.
    ///
    /// # Errors
    ///
    /// Propagates [`assign`](Self::assign) failures.
    pub fn freeze_delayed(&mut self, model: &TaskModel) -> Result<(), ModelError> {
        let view = self.clone();
        let mut ready = Vec::new();
        for (name, entry) in &self.entries {
            if let ArgumentValue::Delayed(delayed) = &entry.value {
                if let DelayedOutcome::Ready(value) = delayed.evaluate(&view) {
                    ready.push((name.clone(), ArgumentValue::Concrete(value)));
                }
            }
        }
        if ready.is_empty() {
            return Ok(());
        }
        self.assign(model, ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delayed::delayed_value;
    use serde_json::json;

    fn decomposing_model() -> Arc<TaskModel> {
        // Assigning high_level writes 10 into both levels.
        TaskModel::builder("decomposing")
            .argument_with_setter("high_level", |scope, value| {
                scope.set("high_level", value.clone());
                scope.set("low_level", value.clone());
                Ok(())
            })
            .argument("low_level")
            .build()
            .unwrap()
    }

    #[test]
    fn plain_assignment_stores_values() {
        let model = TaskModel::builder("t").argument("x").build().unwrap();
        let mut args = TaskArguments::new();
        args.assign(&model, vec![("x".into(), json!(1).into())])
            .unwrap();
        assert_eq!(args.get("x"), Some(&json!(1)));
        assert!(args.has_argument("x"));
    }

    #[test]
    fn consistent_decomposition_succeeds() {
        let model = decomposing_model();
        let mut args = TaskArguments::new();
        args.assign(
            &model,
            vec![
                ("high_level".into(), json!(10).into()),
                ("low_level".into(), json!(10).into()),
            ],
        )
        .unwrap();
        assert_eq!(args.get("high_level"), Some(&json!(10)));
        assert_eq!(args.get("low_level"), Some(&json!(10)));
    }

    #[test]
    fn conflicting_decomposition_rolls_back() {
        let model = decomposing_model();
        let mut args = TaskArguments::new();
        let err = args
            .assign(
                &model,
                vec![
                    ("high_level".into(), json!(10).into()),
                    ("low_level".into(), json!(20).into()),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::ArgumentConflict { .. }));
        // Rollback: nothing from the failed call is visible.
        assert!(!args.is_set("high_level"));
        assert!(!args.is_set("low_level"));
    }

    #[test]
    fn delayed_initial_value_skips_setter() {
        let model = decomposing_model();
        let mut args = TaskArguments::new();
        args.assign(
            &model,
            vec![("high_level".into(), delayed_value(json!(10)).into())],
        )
        .unwrap();
        // Stored as-is: the setter did not run, low_level is untouched.
        assert!(args.is_set("high_level"));
        assert!(!args.has_argument("high_level"));
        assert!(!args.is_set("low_level"));
        assert!(!args.is_static());
    }

    #[test]
    fn assign_over_delayed_runs_setter() {
        let model = decomposing_model();
        let mut args = TaskArguments::new();
        args.assign(
            &model,
            vec![("high_level".into(), delayed_value(json!(10)).into())],
        )
        .unwrap();
        args.assign(
            &model,
            vec![
                ("high_level".into(), json!(10).into()),
                ("low_level".into(), json!(10).into()),
            ],
        )
        .unwrap();
        assert_eq!(args.get("high_level"), Some(&json!(10)));
        assert_eq!(args.get("low_level"), Some(&json!(10)));
    }

    #[test]
    fn freeze_delayed_forwards_ready_values() {
        let model = decomposing_model();
        let mut args = TaskArguments::new();
        args.assign(
            &model,
            vec![("high_level".into(), delayed_value(json!(10)).into())],
        )
        .unwrap();

        args.freeze_delayed(&model).unwrap();
        // The freeze assigned concrete 10, which ran the setter.
        assert_eq!(args.get("high_level"), Some(&json!(10)));
        assert_eq!(args.get("low_level"), Some(&json!(10)));
        assert!(args.is_static());
    }

    #[test]
    fn frozen_map_rejects_writes() {
        let model = TaskModel::builder("t").argument("x").build().unwrap();
        let mut args = TaskArguments::new();
        args.freeze();
        let err = args
            .assign(&model, vec![("x".into(), json!(1).into())])
            .unwrap_err();
        assert!(matches!(err, ModelError::ArgumentsFrozen { .. }));
    }

    #[test]
    fn fully_instanciated_requires_all_declared() {
        let model = TaskModel::builder("t")
            .argument("a")
            .argument_with_default("b", json!(5))
            .build()
            .unwrap();
        let mut args = TaskArguments::from_model(&model);
        assert!(!args.fully_instanciated(&model));
        args.assign(&model, vec![("a".into(), json!(1).into())])
            .unwrap();
        assert!(args.fully_instanciated(&model));
    }

    #[test]
    fn meaningful_excludes_defaults() {
        let model = TaskModel::builder("t")
            .argument_with_default("speed", json!(0.5))
            .argument("target")
            .build()
            .unwrap();
        let mut args = TaskArguments::from_model(&model);
        args.assign(&model, vec![("target".into(), json!("dock").into())])
            .unwrap();

        let meaningful = args.meaningful(&model);
        assert!(!meaningful.contains_key("speed"));
        assert_eq!(meaningful.get("target"), Some(&json!("dock")));

        // Overriding the default makes it meaningful.
        args.assign(&model, vec![("speed".into(), json!(0.9).into())])
            .unwrap();
        assert_eq!(args.meaningful(&model).get("speed"), Some(&json!(0.9)));
    }

    #[test]
    fn setter_failure_rolls_back() {
        let model = TaskModel::builder("t")
            .argument_with_setter("x", |_, _| Err("nope".into()))
            .build()
            .unwrap();
        let mut args = TaskArguments::new();
        let err = args
            .assign(&model, vec![("x".into(), json!(1).into())])
            .unwrap_err();
        assert!(matches!(err, ModelError::SetterFailed { .. }));
        assert!(args.is_empty());
    }
}
