//! Unified error interface for WARDEN.
//!
//! Every public error enum in the workspace implements [`ErrorCode`] so
//! that controllers, the engine's exception notifications, and the log
//! stream all speak one error vocabulary.
//!
//! # Code Convention
//!
//! - UPPER_SNAKE_CASE, prefixed by the owning crate: `MODEL_`, `PLAN_`,
//!   `ENGINE_`, `LOG_`.
//! - Stable once published; changing a code is a breaking change.
//!
//! # Recoverability
//!
//! An error is **recoverable** when the caller can do something about it
//! and retry: assign the missing arguments, pick a different edge, repair
//! the failed task. Structural violations (a cycle in a DAG relation, a
//! malformed model) are not.
//!
//! # Example
//!
//! ```
//! use warden_types::ErrorCode;
//!
//! #[derive(Debug)]
//! enum GraspError {
//!     GripperBusy,
//!     NoSuchObject,
//! }
//!
//! impl ErrorCode for GraspError {
//!     fn code(&self) -> &'static str {
//!         match self {
//!             Self::GripperBusy => "GRASP_GRIPPER_BUSY",
//!             Self::NoSuchObject => "GRASP_NO_SUCH_OBJECT",
//!         }
//!     }
//!
//!     fn is_recoverable(&self) -> bool {
//!         matches!(self, Self::GripperBusy)
//!     }
//! }
//!
//! assert!(GraspError::GripperBusy.is_recoverable());
//! ```

/// Unified error code interface.
///
/// Implemented by every error enum in the workspace. Enables uniform
/// formatting of exception notifications and lets the log rebuilder carry
/// errors across the wire as plain codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    ///
    /// UPPER_SNAKE_CASE, crate-prefixed, stable across versions.
    fn code(&self) -> &'static str;

    /// Returns whether the caller can take corrective action and retry.
    fn is_recoverable(&self) -> bool;
}

/// Asserts that an error code follows workspace conventions.
///
/// Checks that the code is non-empty, carries the expected prefix, and is
/// UPPER_SNAKE_CASE. Intended for unit tests over error enums.
///
/// # Panics
///
/// Panics with a descriptive message if any check fails.
///
/// # Example
///
/// ```
/// use warden_types::{assert_error_code, ErrorCode};
///
/// #[derive(Debug)]
/// struct Timeout;
///
/// impl ErrorCode for Timeout {
///     fn code(&self) -> &'static str { "ENGINE_TIMEOUT" }
///     fn is_recoverable(&self) -> bool { true }
/// }
///
/// assert_error_code(&Timeout, "ENGINE_");
/// ```
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "error code '{code}' must start with prefix '{expected_prefix}'"
    );
    assert!(
        is_upper_snake_case(code),
        "error code '{code}' must be UPPER_SNAKE_CASE"
    );
}

/// Asserts conventions for every variant of an error enum at once.
///
/// # Example
///
/// ```
/// use warden_types::{assert_error_codes, ErrorCode};
///
/// #[derive(Debug)]
/// enum E { A, B }
///
/// impl ErrorCode for E {
///     fn code(&self) -> &'static str {
///         match self { E::A => "PLAN_A", E::B => "PLAN_B" }
///     }
///     fn is_recoverable(&self) -> bool { false }
/// }
///
/// assert_error_codes(&[E::A, E::B], "PLAN_");
/// ```
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('_')
        && !s.ends_with('_')
        && !s.contains("__")
        && s.chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
