//! Model layer errors.
//!
//! All variants implement [`ErrorCode`] with the `MODEL_` prefix.
//!
//! | Error | Code | Recoverable |
//! |-------|------|-------------|
//! | [`ModelError::ArgumentConflict`] | `MODEL_ARGUMENT_CONFLICT` | Yes |
//! | [`ModelError::ArgumentsFrozen`] | `MODEL_ARGUMENTS_FROZEN` | No |
//! | [`ModelError::ModelViolation`] | `MODEL_VIOLATION` | No |
//! | [`ModelError::UnknownEvent`] | `MODEL_UNKNOWN_EVENT` | No |
//! | [`ModelError::SetterFailed`] | `MODEL_SETTER_FAILED` | No |

use serde_json::Value;
use thiserror::Error;
use warden_types::ErrorCode;

/// Errors raised by model declaration and argument assignment.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Parallel assignment could not reconcile a requested value with
    /// what the setters stored. The arguments map was rolled back.
    #[error("argument '{name}': requested {requested} but setters stored {stored}")]
    ArgumentConflict {
        /// The conflicting argument name.
        name: String,
        /// The value the caller requested.
        requested: Value,
        /// The value present after all setters ran.
        stored: Value,
    },

    /// The arguments map is frozen (the task has started).
    #[error("arguments are frozen, cannot assign '{name}'")]
    ArgumentsFrozen {
        /// The argument the caller tried to write.
        name: String,
    },

    /// A declaration breaks a structural rule of the task model.
    #[error("model violation: {0}")]
    ModelViolation(String),

    /// A relation or handler declaration references an event the model
    /// does not declare.
    #[error("model '{model}' has no event '{symbol}'")]
    UnknownEvent {
        /// The model name.
        model: String,
        /// The missing event symbol.
        symbol: String,
    },

    /// An argument setter returned an error; the assignment was rolled
    /// back.
    #[error("setter for argument '{name}' failed: {message}")]
    SetterFailed {
        /// The argument whose setter failed.
        name: String,
        /// The setter's error message.
        message: String,
    },
}

impl ErrorCode for ModelError {
    fn code(&self) -> &'static str {
        match self {
            Self::ArgumentConflict { .. } => "MODEL_ARGUMENT_CONFLICT",
            Self::ArgumentsFrozen { .. } => "MODEL_ARGUMENTS_FROZEN",
            Self::ModelViolation(_) => "MODEL_VIOLATION",
            Self::UnknownEvent { .. } => "MODEL_UNKNOWN_EVENT",
            Self::SetterFailed { .. } => "MODEL_SETTER_FAILED",
        }
    }

    fn is_recoverable(&self) -> bool {
        // A conflict can be retried with consistent values; everything
        // else needs a model or call-site fix.
        matches!(self, Self::ArgumentConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_types::assert_error_codes;

    fn all_variants() -> Vec<ModelError> {
        vec![
            ModelError::ArgumentConflict {
                name: "x".into(),
                requested: json!(1),
                stored: json!(2),
            },
            ModelError::ArgumentsFrozen { name: "x".into() },
            ModelError::ModelViolation("x".into()),
            ModelError::UnknownEvent {
                model: "m".into(),
                symbol: "e".into(),
            },
            ModelError::SetterFailed {
                name: "x".into(),
                message: "m".into(),
            },
        ]
    }

    #[test]
    fn all_error_codes_valid() {
        assert_error_codes(&all_variants(), "MODEL_");
    }

    #[test]
    fn only_conflicts_are_recoverable() {
        for err in all_variants() {
            assert_eq!(
                err.is_recoverable(),
                matches!(err, ModelError::ArgumentConflict { .. })
            );
        }
    }

    #[test]
    fn conflict_message_names_both_values() {
        let err = ModelError::ArgumentConflict {
            name: "low_level".into(),
            requested: json!(20),
            stored: json!(10),
        };
        let msg = err.to_string();
        assert!(msg.contains("low_level"));
        assert!(msg.contains("20"));
        assert!(msg.contains("10"));
    }
}
