//! Event vocabulary for WARDEN.
//!
//! This crate defines what an *event occurrence* is and what user code may
//! attach to event generators: the immutable [`Emission`] record, the
//! handler containers with their replace policies, the command types, and
//! the [`EventScope`] trait that handlers and commands run against.
//!
//! # Crate Architecture
//!
//! This crate is part of the **SDK layer**:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SDK Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  warden-types : id types, ErrorCode                         │
//! │  warden-event : Emission, handlers, EventScope  ◄── HERE    │
//! │  warden-model : task models, arguments                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Task models declare handlers and commands; the plan stores them on
//! event generators; the engine invokes them. All three agree on the types
//! defined here, which is what keeps the model layer independent of the
//! plan layer.
//!
//! # Handlers and the EventScope
//!
//! Handlers never touch plan objects directly. They receive a
//! `&mut dyn EventScope`, a narrow window onto the engine through which
//! they may emit, call, or fail other generators:
//!
//! ```
//! use warden_event::{EmitHandler, HandlerResult};
//!
//! let handler = EmitHandler::new(|scope, emission| -> HandlerResult {
//!     let stop = scope
//!         .task_event(emission.task().unwrap(), "stop")
//!         .expect("every task has a stop event");
//!     scope.call(stop, vec![])?;
//!     Ok(())
//! });
//! assert!(!handler.once);
//! ```
//!
//! # Relation vocabulary
//!
//! [`EventRelationKind`] and [`TaskRelationKind`] name the typed directed
//! graphs a plan maintains; [`RelationFlags`] carries their structural
//! properties (DAG-only, copy-on-replace, strong).

mod emission;
mod handlers;
mod relations;
mod scope;

pub use emission::{Emission, UnreachableReason};
pub use handlers::{
    EmitHandler, EmitHandlerFn, ExecuteHandler, FinalizationHandler, FinalizationHandlerFn,
    HandlerError, HandlerResult, PollFn, PollHandler, ReplacePolicy, UnreachableHandler,
    UnreachableHandlerFn,
};
pub use relations::{EventRelationKind, RelationFlags, TaskRelationKind};
pub use scope::{CommandFn, CommandSpec, EventScope, ScopeError};
