//! Log layer errors.

use thiserror::Error;
use warden_types::ErrorCode;

/// Errors raised by log replay and plan restore.
#[derive(Debug, Error)]
pub enum LogError {
    /// A record references an id the rebuilder does not know (or that
    /// was deregistered by a `finalized_*` record).
    #[error("record '{method}' references unknown id {id}")]
    UnknownId {
        /// The record method.
        method: String,
        /// The unresolved raw id.
        id: u64,
    },

    /// A record's argument list does not match its method.
    #[error("malformed '{method}' record: {reason}")]
    MalformedRecord {
        /// The record method.
        method: String,
        /// What was wrong.
        reason: String,
    },

    /// A dump references a task model absent from the registry.
    #[error("model '{0}' is not registered")]
    UnknownModel(String),

    /// A structural error surfaced while rebuilding the plan.
    #[error(transparent)]
    Plan(#[from] warden_plan::PlanError),

    /// Serialization failure while writing a sink.
    #[error("log i/o: {0}")]
    Io(String),
}

impl ErrorCode for LogError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownId { .. } => "LOG_UNKNOWN_ID",
            Self::MalformedRecord { .. } => "LOG_MALFORMED_RECORD",
            Self::UnknownModel(_) => "LOG_UNKNOWN_MODEL",
            Self::Plan(inner) => inner.code(),
            Self::Io(_) => "LOG_IO",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
