//! Task model schema and inheritance.

use crate::arguments::{ArgumentSetter, TaskArguments};
use crate::builder::TaskModelBuilder;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use warden_event::{CommandSpec, EmitHandler, EventRelationKind, PollHandler};
use warden_types::ModelId;

/// The standard event set of every task: `(symbol, controllable,
/// terminal)`.
pub const STANDARD_EVENTS: [(&str, bool, bool); 8] = [
    ("start", true, false),
    ("stop", false, true),
    ("success", false, true),
    ("failed", false, true),
    ("aborted", false, true),
    ("internal_error", false, true),
    ("updated_data", false, false),
    ("poll_transition", false, false),
];

/// Built-in forward chain: `(from, to)`.
pub(crate) const BUILTIN_FORWARDS: [(&str, &str); 4] = [
    ("success", "stop"),
    ("aborted", "failed"),
    ("failed", "stop"),
    ("internal_error", "stop"),
];

/// One declared argument.
#[derive(Clone)]
pub struct ArgumentDecl {
    /// Argument name.
    pub name: String,
    /// Value used when the caller does not provide one.
    pub default: Option<Value>,
    /// Setter hook run during parallel assignment.
    pub setter: Option<ArgumentSetter>,
}

impl fmt::Debug for ArgumentDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentDecl")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("setter", &self.setter.is_some())
            .finish()
    }
}

/// One declared event.
#[derive(Debug, Clone)]
pub struct EventDecl {
    /// Event symbol, unique within the model's event namespace.
    pub symbol: String,
    /// Whether the event has a command.
    pub controllable: bool,
    /// Whether emitting the event finishes the task.
    pub terminal: bool,
    /// The command; present iff `controllable`.
    pub command: Option<CommandSpec>,
}

/// One model-level relation declaration between two event symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDecl {
    /// Relation kind; models may declare `Signal`, `Forward` and
    /// `CausalLink` edges.
    pub kind: EventRelationKind,
    /// Source event symbol.
    pub from: String,
    /// Target event symbol.
    pub to: String,
}

/// The declarative schema of a task.
///
/// Built through [`TaskModel::builder`]; submodels chain through
/// [`TaskModel::submodel`] and inherit every declaration of their
/// parents.
///
/// # Example
///
/// ```
/// use warden_model::TaskModel;
///
/// let base = TaskModel::builder("move").argument("target").build().unwrap();
/// let fly = TaskModel::submodel("fly", &base)
///     .argument("altitude")
///     .build()
///     .unwrap();
///
/// assert!(fly.fullfills(&base));
/// assert_eq!(fly.arguments().len(), 2);
/// // Standard events are inherited from the root
/// assert!(fly.find_event("start").unwrap().controllable);
/// ```
pub struct TaskModel {
    pub(crate) id: ModelId,
    pub(crate) name: String,
    pub(crate) parent: Option<Arc<TaskModel>>,
    pub(crate) is_abstract: bool,
    pub(crate) own_arguments: Vec<ArgumentDecl>,
    pub(crate) own_events: Vec<EventDecl>,
    pub(crate) own_relations: Vec<RelationDecl>,
    pub(crate) provides: Vec<String>,
    pub(crate) fullfilled: Vec<ModelId>,
    pub(crate) poll: Option<PollHandler>,
    pub(crate) own_handlers: Vec<(String, EmitHandler)>,
}

impl fmt::Debug for TaskModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskModel")
            .field("name", &self.name)
            .field("abstract", &self.is_abstract)
            .field("events", &self.own_events.len())
            .field("parent", &self.parent.as_ref().map(|p| p.name.clone()))
            .finish()
    }
}

impl TaskModel {
    /// Starts a root model. Standard events and the built-in forward
    /// chain are added at build time.
    #[must_use]
    pub fn builder(name: &str) -> TaskModelBuilder {
        TaskModelBuilder::new(name, None)
    }

    /// Starts a submodel inheriting every declaration of `parent`.
    #[must_use]
    pub fn submodel(name: &str, parent: &Arc<TaskModel>) -> TaskModelBuilder {
        TaskModelBuilder::new(name, Some(parent.clone()))
    }

    /// Stable identity of the model.
    #[must_use]
    pub fn id(&self) -> ModelId {
        self.id
    }

    /// Model name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether instances of this model may execute.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// The inherited model, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<TaskModel>> {
        self.parent.as_ref()
    }

    /// Resolved argument declarations, parents first; a redeclared name
    /// overrides the inherited declaration.
    #[must_use]
    pub fn arguments(&self) -> Vec<&ArgumentDecl> {
        let mut resolved: Vec<&ArgumentDecl> = match &self.parent {
            Some(parent) => parent.arguments(),
            None => Vec::new(),
        };
        for decl in &self.own_arguments {
            if let Some(slot) = resolved.iter_mut().find(|d| d.name == decl.name) {
                *slot = decl;
            } else {
                resolved.push(decl);
            }
        }
        resolved
    }

    /// Looks up one argument declaration, most-derived first.
    #[must_use]
    pub fn find_argument(&self, name: &str) -> Option<&ArgumentDecl> {
        self.own_arguments
            .iter()
            .find(|d| d.name == name)
            .or_else(|| self.parent.as_ref().and_then(|p| p.find_argument(name)))
    }

    /// Resolved event declarations, parents first; a redeclared symbol
    /// overrides the inherited declaration in place.
    #[must_use]
    pub fn events(&self) -> Vec<&EventDecl> {
        let mut resolved: Vec<&EventDecl> = match &self.parent {
            Some(parent) => parent.events(),
            None => Vec::new(),
        };
        for decl in &self.own_events {
            if let Some(slot) = resolved.iter_mut().find(|d| d.symbol == decl.symbol) {
                *slot = decl;
            } else {
                resolved.push(decl);
            }
        }
        resolved
    }

    /// Looks up one event declaration, most-derived first.
    #[must_use]
    pub fn find_event(&self, symbol: &str) -> Option<&EventDecl> {
        self.own_events
            .iter()
            .find(|d| d.symbol == symbol)
            .or_else(|| self.parent.as_ref().and_then(|p| p.find_event(symbol)))
    }

    /// Resolved relation declarations: inherited edges first, then own,
    /// without exact duplicates.
    #[must_use]
    pub fn relations(&self) -> Vec<&RelationDecl> {
        let mut resolved: Vec<&RelationDecl> = match &self.parent {
            Some(parent) => parent.relations(),
            None => Vec::new(),
        };
        for decl in &self.own_relations {
            if !resolved.iter().any(|d| *d == decl) {
                resolved.push(decl);
            }
        }
        resolved
    }

    /// On-emit handlers declared for `symbol`, in inheritance then
    /// declaration order.
    #[must_use]
    pub fn handlers_for(&self, symbol: &str) -> Vec<EmitHandler> {
        let mut handlers = match &self.parent {
            Some(parent) => parent.handlers_for(symbol),
            None => Vec::new(),
        };
        handlers.extend(
            self.own_handlers
                .iter()
                .filter(|(s, _)| s == symbol)
                .map(|(_, h)| h.clone()),
        );
        handlers
    }

    /// Poll blocks declared along the inheritance chain, parents first.
    #[must_use]
    pub fn poll_handlers(&self) -> Vec<PollHandler> {
        let mut handlers = match &self.parent {
            Some(parent) => parent.poll_handlers(),
            None => Vec::new(),
        };
        if let Some(poll) = &self.poll {
            handlers.push(poll.clone());
        }
        handlers
    }

    /// Whether this model can stand in for `other`: it is `other`, a
    /// submodel of it, or explicitly declares fullfillment.
    #[must_use]
    pub fn fullfills(&self, other: &TaskModel) -> bool {
        self.fullfills_id(other.id)
    }

    /// [`fullfills`](Self::fullfills) by model id.
    #[must_use]
    pub fn fullfills_id(&self, id: ModelId) -> bool {
        self.id == id
            || self.fullfilled.contains(&id)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.fullfills_id(id))
    }

    /// Whether this model provides the named service.
    #[must_use]
    pub fn provides_service(&self, service: &str) -> bool {
        self.provides.iter().any(|s| s == service)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.provides_service(service))
    }

    /// Default arguments map for a fresh instance.
    #[must_use]
    pub fn default_arguments(&self) -> TaskArguments {
        TaskArguments::from_model(self)
    }

    /// Instance-level classification of every event, derived from the
    /// declared flags and the forward closure: an event forwarding into
    /// a terminal event is terminal itself, one reaching `success` is a
    /// success event, one reaching `failed` or `aborted` a failure
    /// event.
    #[must_use]
    pub fn instance_flags(&self) -> std::collections::HashMap<String, EventInstanceFlags> {
        use std::collections::HashMap;

        let events = self.events();
        let mut forwards: HashMap<&str, Vec<&str>> = HashMap::new();
        for relation in self.relations() {
            if relation.kind == EventRelationKind::Forward {
                forwards
                    .entry(relation.from.as_str())
                    .or_default()
                    .push(relation.to.as_str());
            }
        }

        let reaches = |from: &str, predicate: &dyn Fn(&str) -> bool| -> bool {
            let mut stack = vec![from];
            let mut seen = std::collections::HashSet::new();
            while let Some(current) = stack.pop() {
                if predicate(current) {
                    return true;
                }
                if !seen.insert(current) {
                    continue;
                }
                if let Some(next) = forwards.get(current) {
                    stack.extend(next.iter().copied());
                }
            }
            false
        };

        let declared_terminal: std::collections::HashSet<&str> = events
            .iter()
            .filter(|d| d.terminal)
            .map(|d| d.symbol.as_str())
            .collect();

        events
            .iter()
            .map(|decl| {
                let symbol = decl.symbol.as_str();
                let flags = EventInstanceFlags {
                    terminal: reaches(symbol, &|s| declared_terminal.contains(s)),
                    success: reaches(symbol, &|s| s == "success"),
                    failure: reaches(symbol, &|s| {
                        s == "failed" || s == "aborted" || s == "internal_error"
                    }),
                };
                (decl.symbol.clone(), flags)
            })
            .collect()
    }
}

/// A lookup table from stable model identity to the model itself.
///
/// Serialized plan records carry [`ModelId`]s; a receiver resolves them
/// through a registry populated with the same model definitions.
///
/// # Example
///
/// ```
/// use warden_model::{ModelRegistry, TaskModel};
///
/// let goto = TaskModel::builder("goto").build().unwrap();
/// let mut registry = ModelRegistry::new();
/// registry.register(&goto);
///
/// assert!(registry.get(goto.id()).is_some());
/// ```
#[derive(Default)]
pub struct ModelRegistry {
    models: std::collections::HashMap<ModelId, Arc<TaskModel>>,
}

impl ModelRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model under its id.
    pub fn register(&mut self, model: &Arc<TaskModel>) {
        self.models.insert(model.id(), model.clone());
    }

    /// Resolves a model id.
    #[must_use]
    pub fn get(&self, id: ModelId) -> Option<&Arc<TaskModel>> {
        self.models.get(&id)
    }
}

/// Effective classification of one task event, forward closure
/// included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventInstanceFlags {
    /// Emitting the event finishes the task.
    pub terminal: bool,
    /// The event participates in the success outcome.
    pub success: bool,
    /// The event participates in the failure outcome.
    pub failure: bool,
}
