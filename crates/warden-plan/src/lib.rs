//! Plan layer of WARDEN.
//!
//! A **plan** is the live graph a supervision controller executes: sets
//! of [tasks](Task) and free [event generators](EventGenerator), typed
//! [relation graphs](RelationGraph) between them, and the bookkeeping
//! that garbage collection and log replay need.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                          Plan                            │
//! │                                                          │
//! │  tasks ──────► Task ── events ──► EventGenerator         │
//! │                                                          │
//! │  event graphs: signal / forward / precedence / causal    │
//! │  task graphs:  dependency / error_handling / planned_by  │
//! │                                                          │
//! │  missions · permanent marks · garbage buckets            │
//! └──────────────────────────────────────────────────────────┘
//!            ▲                                  ▲
//!       Transaction                        TaskMatcher
//!   (staged overlay, commit)            (predicate queries)
//! ```
//!
//! Objects are arena-stored and relation graphs hold id-to-id edges,
//! so the cyclic task/event structure never turns into reference
//! cycles. The execution engine (a separate crate) drives emissions
//! and state transitions; this crate owns structure.
//!
//! # Example
//!
//! ```
//! use warden_model::TaskModel;
//! use warden_plan::{DependencyInfo, Plan};
//!
//! let mut plan = Plan::new();
//! let goto = TaskModel::builder("goto").terminates().build().unwrap();
//!
//! let mission = plan.add_task(&goto, vec![]).unwrap();
//! let support = plan.add_task(&goto, vec![]).unwrap();
//! plan.add_mission_task(mission).unwrap();
//! plan.add_dependency(mission, support, DependencyInfo::default())
//!     .unwrap();
//!
//! assert!(plan.is_mission(mission));
//! assert_eq!(plan.task_count(), 2);
//! ```

mod error;
mod generator;
mod graph;
mod plan;
mod query;
mod replace;
mod task;
mod transaction;

pub use error::PlanError;
pub use generator::EventGenerator;
pub use graph::RelationGraph;
pub use plan::{DependencyInfo, EdgeRef, GarbageBuckets, Plan, RelationObserver};
pub use query::{QueryScope, TaskMatcher};
pub use replace::ReplaceMode;
pub use task::{FailureReason, Task, TaskFinalizationHandler, TaskState};
pub use transaction::{Transaction, TxGen, TxTask};
