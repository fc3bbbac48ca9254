//! Log stream, dump/restore and rebuild for WARDEN plans.
//!
//! Three related facilities:
//!
//! - **Cycle log**: the engine emits a sequence of [`LogEntry`]
//!   quadruples `(method, seconds, microseconds, args)` into a
//!   [`LogSink`]; [`MemoryLog`] buffers them, [`JsonLinesWriter`]
//!   persists them.
//! - **Dump/restore**: [`dump_plan`] serializes a plan's public
//!   structure ([`PlanDump`]); [`restore_plan`] reconstructs an
//!   equivalent plan from it, resolving task models through a
//!   [`ModelRegistry`](warden_model::ModelRegistry). Objects are keyed
//!   by their stable [`RemoteId`](warden_types::RemoteId), so duplicate
//!   delivery is idempotent.
//! - **Rebuild**: [`PlanRebuilder`] folds a log stream back into the
//!   public observables (tasks, emitted histories, edges, garbage
//!   sets) at every cycle boundary.

mod dump;
mod error;
mod rebuild;
mod records;

pub use dump::{dump_plan, restore_plan, EdgeDump, GeneratorDump, PlanDump, TaskDump};
pub use error::LogError;
pub use rebuild::{PlanRebuilder, RebuiltGenerator, RebuiltTask};
pub use records::{JsonLinesWriter, LogEntry, LogMethod, LogSink, MemoryLog};
