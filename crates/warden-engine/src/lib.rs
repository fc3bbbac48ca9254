//! Execution engine for WARDEN plans.
//!
//! The engine owns an executable plan and advances it one cycle at a
//! time: it drains externally injected events, runs scheduled blocks,
//! walks the signal/forward propagation queue under the precedence
//! graph, detects and dispatches localized errors through the
//! error-handling relation, and garbage-collects activities no longer
//! reachable from the mission and permanent roots.
//!
//! # Runtime Loop
//!
//! ```text
//! loop {
//!     1. Inject external events (thread-safe queue)
//!     2. Run execute blocks, then poll blocks
//!     3. Drain propagation (signals call, forwards emit)
//!     4. Detect errors, look up repair tasks
//!     5. Collect garbage (stop, then finalize)
//!     6. Cycle bookkeeping (stats, log records)
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use warden_engine::ExecutionEngine;
//! use warden_model::TaskModel;
//! use warden_plan::Plan;
//!
//! let model = TaskModel::builder("blink").terminates().build().unwrap();
//! let mut plan = Plan::new();
//! let task = plan.add_task(&model, vec![]).unwrap();
//! plan.add_mission_task(task).unwrap();
//!
//! let mut engine = ExecutionEngine::new(plan);
//! engine.start_task(task).unwrap();
//! assert!(engine.plan().task(task).unwrap().state().running);
//!
//! let stop = engine.plan().task_event(task, "stop").unwrap();
//! engine.call_now(stop, vec![]).unwrap();
//! assert!(engine.plan().task(task).unwrap().state().finished);
//! ```

mod engine;
mod errors;
mod injector;

pub use engine::{CycleStats, ExecutionEngine};
pub use errors::{ErrorLocus, ExecutionError, ExecutionErrorKind, MultipleExecutionErrors};
pub use injector::EventInjector;
