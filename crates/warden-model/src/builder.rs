//! Builder for task models.

use crate::arguments::{ArgumentSetter, SetterScope};
use crate::error::ModelError;
use crate::model::{ArgumentDecl, EventDecl, RelationDecl, TaskModel, BUILTIN_FORWARDS, STANDARD_EVENTS};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use warden_event::{
    CommandSpec, EmitHandler, Emission, EventRelationKind, EventScope, HandlerError, HandlerResult,
    PollHandler,
};
use warden_types::ModelId;

/// Builds a [`TaskModel`].
///
/// Obtained from [`TaskModel::builder`] or [`TaskModel::submodel`]. The
/// `build` step normalizes the declarations (standard events, built-in
/// forwards, default commands) and validates them.
///
/// # Example
///
/// ```
/// use warden_model::TaskModel;
///
/// let model = TaskModel::builder("patrol")
///     .argument("route")
///     .event("waypoint_reached", false, false)
///     .forward("waypoint_reached", "updated_data")
///     .terminates()
///     .build()
///     .unwrap();
///
/// // `terminates` makes the task interruptible
/// assert!(model.find_event("stop").unwrap().controllable);
/// assert!(model.find_event("failed").unwrap().controllable);
/// ```
pub struct TaskModelBuilder {
    name: String,
    parent: Option<Arc<TaskModel>>,
    is_abstract: bool,
    arguments: Vec<ArgumentDecl>,
    events: Vec<EventDecl>,
    relations: Vec<RelationDecl>,
    provides: Vec<String>,
    fullfilled: Vec<ModelId>,
    poll: Option<PollHandler>,
    handlers: Vec<(String, EmitHandler)>,
    terminates: bool,
}

impl TaskModelBuilder {
    pub(crate) fn new(name: &str, parent: Option<Arc<TaskModel>>) -> Self {
        Self {
            name: name.to_string(),
            parent,
            is_abstract: false,
            arguments: Vec::new(),
            events: Vec::new(),
            relations: Vec::new(),
            provides: Vec::new(),
            fullfilled: Vec::new(),
            poll: None,
            handlers: Vec::new(),
            terminates: false,
        }
    }

    /// Declares an argument without a default.
    #[must_use]
    pub fn argument(mut self, name: &str) -> Self {
        self.arguments.push(ArgumentDecl {
            name: name.to_string(),
            default: None,
            setter: None,
        });
        self
    }

    /// Declares an argument with a default value.
    #[must_use]
    pub fn argument_with_default(mut self, name: &str, default: Value) -> Self {
        self.arguments.push(ArgumentDecl {
            name: name.to_string(),
            default: Some(default),
            setter: None,
        });
        self
    }

    /// Declares an argument with a setter hook run during parallel
    /// assignment.
    #[must_use]
    pub fn argument_with_setter(
        mut self,
        name: &str,
        setter: impl Fn(&mut SetterScope<'_>, &Value) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.arguments.push(ArgumentDecl {
            name: name.to_string(),
            default: None,
            setter: Some(Arc::new(setter) as ArgumentSetter),
        });
        self
    }

    /// Declares an event. Controllable events without an explicit
    /// command get the emit-on-call default.
    #[must_use]
    pub fn event(mut self, symbol: &str, controllable: bool, terminal: bool) -> Self {
        self.events.push(EventDecl {
            symbol: symbol.to_string(),
            controllable,
            terminal,
            command: None,
        });
        self
    }

    /// Declares a controllable event with a command body.
    #[must_use]
    pub fn event_with_command(mut self, symbol: &str, terminal: bool, command: CommandSpec) -> Self {
        self.events.push(EventDecl {
            symbol: symbol.to_string(),
            controllable: true,
            terminal,
            command: Some(command),
        });
        self
    }

    /// Declares a signal edge: emitting `from` calls `to`'s command.
    #[must_use]
    pub fn signal(self, from: &str, to: &str) -> Self {
        self.relation(EventRelationKind::Signal, from, to)
    }

    /// Declares a forward edge: emitting `from` emits `to`.
    #[must_use]
    pub fn forward(self, from: &str, to: &str) -> Self {
        self.relation(EventRelationKind::Forward, from, to)
    }

    /// Declares a causal link between two events.
    #[must_use]
    pub fn causal_link(self, from: &str, to: &str) -> Self {
        self.relation(EventRelationKind::CausalLink, from, to)
    }

    fn relation(mut self, kind: EventRelationKind, from: &str, to: &str) -> Self {
        self.relations.push(RelationDecl {
            kind,
            from: from.to_string(),
            to: to.to_string(),
        });
        self
    }

    /// Registers an on-emit handler for `symbol` with the default
    /// replace policy.
    #[must_use]
    pub fn on(
        self,
        symbol: &str,
        f: impl Fn(&mut dyn EventScope, &Emission) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.on_handler(symbol, EmitHandler::new(f))
    }

    /// Registers a prepared on-emit handler for `symbol`.
    #[must_use]
    pub fn on_handler(mut self, symbol: &str, handler: EmitHandler) -> Self {
        self.handlers.push((symbol.to_string(), handler));
        self
    }

    /// Declares the model's poll block with the default replace policy.
    #[must_use]
    pub fn poll(
        self,
        f: impl Fn(&mut dyn EventScope, warden_types::TaskId) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.poll_handler(PollHandler::new(f))
    }

    /// Declares the model's poll block.
    #[must_use]
    pub fn poll_handler(mut self, handler: PollHandler) -> Self {
        self.poll = Some(handler);
        self
    }

    /// Marks the model abstract: instances may not execute.
    #[must_use]
    pub fn abstract_model(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Makes the task interruptible: `failed` becomes controllable and
    /// `stop` gets a command that calls it.
    #[must_use]
    pub fn terminates(mut self) -> Self {
        self.terminates = true;
        self
    }

    /// Declares a provided service name.
    #[must_use]
    pub fn provides(mut self, service: &str) -> Self {
        self.provides.push(service.to_string());
        self
    }

    /// Declares models this one explicitly fullfills.
    #[must_use]
    pub fn fullfilled_model(mut self, models: Vec<ModelId>) -> Self {
        self.fullfilled.extend(models);
        self
    }

    /// Normalizes and validates the declarations.
    ///
    /// # Errors
    ///
    /// - [`ModelError::UnknownEvent`] when a relation or handler names
    ///   an event the model does not declare.
    /// - [`ModelError::ModelViolation`] when a signal edge goes from a
    ///   terminal event to a non-terminal one.
    pub fn build(mut self) -> Result<Arc<TaskModel>, ModelError> {
        // Root models get the standard event set and built-in forward
        // chain; user declarations override in place.
        if self.parent.is_none() {
            let mut events: Vec<EventDecl> = STANDARD_EVENTS
                .iter()
                .map(|(symbol, controllable, terminal)| EventDecl {
                    symbol: (*symbol).to_string(),
                    controllable: *controllable,
                    terminal: *terminal,
                    command: None,
                })
                .collect();
            for decl in self.events.drain(..) {
                if let Some(slot) = events.iter_mut().find(|d| d.symbol == decl.symbol) {
                    *slot = decl;
                } else {
                    events.push(decl);
                }
            }
            self.events = events;

            let mut relations: Vec<RelationDecl> = BUILTIN_FORWARDS
                .iter()
                .map(|(from, to)| RelationDecl {
                    kind: EventRelationKind::Forward,
                    from: (*from).to_string(),
                    to: (*to).to_string(),
                })
                .collect();
            relations.append(&mut self.relations);
            self.relations = relations;
        }

        if self.terminates {
            override_event(
                &mut self.events,
                "failed",
                EventDecl {
                    symbol: "failed".to_string(),
                    controllable: true,
                    terminal: true,
                    command: Some(CommandSpec::EmitOnCall),
                },
            );
            override_event(
                &mut self.events,
                "stop",
                EventDecl {
                    symbol: "stop".to_string(),
                    controllable: true,
                    terminal: true,
                    command: Some(stop_by_failing()),
                },
            );
        }

        // Command present iff controllable.
        for decl in &mut self.events {
            if decl.controllable && decl.command.is_none() {
                decl.command = Some(CommandSpec::EmitOnCall);
            }
            if decl.command.is_some() {
                decl.controllable = true;
            }
        }

        let mut model = TaskModel {
            id: ModelId::named(&self.name),
            name: self.name,
            parent: self.parent,
            is_abstract: self.is_abstract,
            own_arguments: self.arguments,
            own_events: self.events,
            own_relations: self.relations,
            provides: self.provides,
            fullfilled: self.fullfilled,
            poll: self.poll,
            own_handlers: self.handlers,
        };

        let auto_forwards = validate(&model)?;
        model.own_relations.extend(auto_forwards);
        Ok(Arc::new(model))
    }
}

fn override_event(events: &mut Vec<EventDecl>, symbol: &str, decl: EventDecl) {
    if let Some(slot) = events.iter_mut().find(|d| d.symbol == symbol) {
        *slot = decl;
    } else {
        events.push(decl);
    }
}

/// The `stop` command installed by `terminates`: route the interruption
/// through `failed`, which forwards to `stop`.
fn stop_by_failing() -> CommandSpec {
    CommandSpec::custom(|scope, gen, context| {
        let task = scope
            .owner_task(gen)
            .ok_or_else(|| HandlerError::new("stop commanded outside a task"))?;
        let failed = scope
            .task_event(task, "failed")
            .ok_or_else(|| HandlerError::new("task has no failed event"))?;
        scope.call(failed, context)?;
        Ok(())
    })
}

/// Validates the resolved model and returns the forward edges needed to
/// route custom terminal events to `stop`.
fn validate(model: &TaskModel) -> Result<Vec<RelationDecl>, ModelError> {
    let events = model.events();
    let symbols: HashSet<&str> = events.iter().map(|d| d.symbol.as_str()).collect();

    for relation in model.relations() {
        for symbol in [relation.from.as_str(), relation.to.as_str()] {
            if !symbols.contains(symbol) {
                return Err(ModelError::UnknownEvent {
                    model: model.name().to_string(),
                    symbol: symbol.to_string(),
                });
            }
        }
    }
    for (symbol, _) in &model.own_handlers {
        if !symbols.contains(symbol.as_str()) {
            return Err(ModelError::UnknownEvent {
                model: model.name().to_string(),
                symbol: symbol.clone(),
            });
        }
    }

    // Forward adjacency over the resolved declarations.
    let mut forwards: HashMap<&str, Vec<&str>> = HashMap::new();
    for relation in model.relations() {
        if relation.kind == EventRelationKind::Forward {
            forwards
                .entry(relation.from.as_str())
                .or_default()
                .push(relation.to.as_str());
        }
    }

    // Effective terminal set: declared terminal, or forwarding into it.
    let mut terminal: HashSet<&str> = events
        .iter()
        .filter(|d| d.terminal)
        .map(|d| d.symbol.as_str())
        .collect();
    loop {
        let mut grew = false;
        for (from, targets) in &forwards {
            if !terminal.contains(from) && targets.iter().any(|t| terminal.contains(t)) {
                terminal.insert(from);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    for relation in model.relations() {
        if relation.kind == EventRelationKind::Signal
            && terminal.contains(relation.from.as_str())
            && !terminal.contains(relation.to.as_str())
        {
            return Err(ModelError::ModelViolation(format!(
                "signal from terminal event '{}' to non-terminal event '{}'",
                relation.from, relation.to
            )));
        }
    }

    // Custom terminal events must reach stop through forwards.
    let mut auto = Vec::new();
    for decl in &events {
        if decl.terminal && decl.symbol != "stop" && !reaches(&forwards, &decl.symbol, "stop") {
            auto.push(RelationDecl {
                kind: EventRelationKind::Forward,
                from: decl.symbol.clone(),
                to: "stop".to_string(),
            });
        }
    }
    Ok(auto)
}

fn reaches(forwards: &HashMap<&str, Vec<&str>>, from: &str, to: &str) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == to {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controllable_events_get_default_command() {
        let model = TaskModel::builder("t")
            .event("go", true, false)
            .build()
            .unwrap();
        let decl = model.find_event("go").unwrap();
        assert!(decl.controllable);
        assert!(matches!(decl.command, Some(CommandSpec::EmitOnCall)));
    }

    #[test]
    fn custom_terminal_auto_forwards_to_stop() {
        let model = TaskModel::builder("t")
            .event("docked", false, true)
            .build()
            .unwrap();
        assert!(model.relations().iter().any(|r| {
            r.kind == EventRelationKind::Forward && r.from == "docked" && r.to == "stop"
        }));
    }

    #[test]
    fn terminal_forwarding_through_chain_needs_no_auto_edge() {
        let model = TaskModel::builder("t")
            .event("docked", false, true)
            .forward("docked", "success")
            .build()
            .unwrap();
        // docked reaches stop through success; no direct edge was added.
        assert!(!model.relations().iter().any(|r| {
            r.kind == EventRelationKind::Forward && r.from == "docked" && r.to == "stop"
        }));
    }

    #[test]
    fn unknown_relation_symbol_is_rejected() {
        let err = TaskModel::builder("t")
            .forward("nope", "stop")
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownEvent { .. }));
    }

    #[test]
    fn unknown_handler_symbol_is_rejected() {
        let err = TaskModel::builder("t")
            .on("nope", |_, _| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownEvent { .. }));
    }

    #[test]
    fn signal_from_terminal_to_non_terminal_is_rejected() {
        let err = TaskModel::builder("t")
            .event("reset", true, false)
            .signal("success", "reset")
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::ModelViolation(_)));
    }

    #[test]
    fn signal_between_terminals_is_allowed() {
        let model = TaskModel::builder("t")
            .event("shutdown", true, true)
            .signal("success", "shutdown")
            .build();
        assert!(model.is_ok());
    }

    #[test]
    fn signal_into_terminal_chain_counts_as_terminal() {
        // `cleanup` forwards into success, so it is effectively
        // terminal and may be signalled from one.
        let model = TaskModel::builder("t")
            .event("cleanup", true, false)
            .forward("cleanup", "success")
            .signal("failed", "cleanup")
            .build();
        assert!(model.is_ok());
    }

    #[test]
    fn abstract_flag_is_carried() {
        let model = TaskModel::builder("t").abstract_model().build().unwrap();
        assert!(model.is_abstract());
    }
}
