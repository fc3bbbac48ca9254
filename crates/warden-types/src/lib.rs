//! Core types for WARDEN.
//!
//! This crate provides the foundational identifier types and the unified
//! error contract for the WARDEN (Watchful Activity Runtime for Directed
//! Event Networks) plan execution kernel.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SDK Layer                            │
//! │  (SemVer stable, safe for controllers to depend on)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  warden-types : id types, ErrorCode            ◄── HERE     │
//! │  warden-model : task models, arguments                      │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Runtime Layer                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  warden-plan   : plan, relations, transactions              │
//! │  warden-engine : execution cycle, propagation, GC           │
//! │  warden-log    : cycle log stream, dump/restore, rebuild    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Identifier Design
//!
//! Two identity regimes coexist:
//!
//! - **Arena ids** ([`TaskId`], [`GenId`]): plain `u64` handles allocated by
//!   a plan, valid only inside the process that allocated them. Relation
//!   graphs store id-to-id edges, which is what lets tasks and generators
//!   form cyclic object graphs without reference cycles.
//! - **Remote ids** ([`RemoteId`], [`ModelId`]): UUID-based identities that
//!   are safe to serialize, log, and exchange with peers. A [`ModelId`] is
//!   deterministic (UUID v5) so that two processes agree on the identity of
//!   a well-known task model without coordination.
//!
//! # Example
//!
//! ```
//! use warden_types::{GenId, ModelId, RemoteId, TaskId};
//!
//! let task = TaskId::from_raw(1);
//! let gen = GenId::from_raw(7);
//! assert_eq!(task.to_string(), "task:1");
//! assert_eq!(gen.to_string(), "gen:7");
//!
//! // Well-known models have deterministic identity
//! assert_eq!(ModelId::named("goto"), ModelId::named("goto"));
//!
//! // Instances get a fresh identity
//! assert_ne!(RemoteId::new(), RemoteId::new());
//! ```

mod error;
mod id;

pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use id::{CycleIndex, GenId, ModelId, PropagationId, RemoteId, TaskId};
