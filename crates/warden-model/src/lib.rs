//! Task models and the argument system for WARDEN.
//!
//! A **task model** is the declarative schema of a task: which arguments
//! it takes (with optional defaults and setter hooks), which events it
//! exposes (with controllable/terminal flags and commands), and which
//! relations hold between those events. Models form an inheritance chain;
//! a submodel adds declarations without removing its parent's.
//!
//! The **argument system** stores task arguments as concrete JSON values
//! or *delayed* values evaluated later, and implements the two-phase
//! parallel assignment protocol used at construction and at freeze time.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use warden_model::{TaskArguments, TaskModel};
//!
//! let goto = TaskModel::builder("goto")
//!     .argument("target")
//!     .argument_with_default("speed", json!(0.5))
//!     .event("arrived", false, true)
//!     .build()
//!     .unwrap();
//!
//! let mut args = TaskArguments::from_model(&goto);
//! assert!(!args.fully_instanciated(&goto));
//!
//! args.assign(&goto, vec![("target".into(), json!([12.0, 4.5]).into())])
//!     .unwrap();
//! assert!(args.fully_instanciated(&goto));
//!
//! // `speed` keeps its default, so it is not meaningful
//! assert!(!args.meaningful(&goto).contains_key("speed"));
//! ```
//!
//! # Standard events
//!
//! Every root model carries the standard event set: `start`
//! (controllable), `stop`, `success`, `failed`, `aborted`,
//! `internal_error`, `updated_data` and `poll_transition`, with the
//! built-in forward chain `success → stop`, `aborted → failed`,
//! `failed → stop`, `internal_error → stop`.

mod arguments;
mod builder;
mod delayed;
mod error;
mod model;

pub use arguments::{ArgumentEntry, ArgumentSetter, ArgumentValue, SetterScope, TaskArguments};
pub use builder::TaskModelBuilder;
pub use delayed::{delayed_fn, delayed_value, DelayedArgument, DelayedOutcome};
pub use error::ModelError;
pub use model::{
    ArgumentDecl, EventDecl, EventInstanceFlags, ModelRegistry, RelationDecl, TaskModel,
    STANDARD_EVENTS,
};
