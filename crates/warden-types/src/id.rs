//! Identifier types for WARDEN.
//!
//! Arena ids ([`TaskId`], [`GenId`]) are process-local handles into a plan's
//! object arenas. Remote ids ([`RemoteId`], [`ModelId`]) are UUID-based and
//! safe to serialize across process boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::{uuid, Uuid};

/// WARDEN namespace UUID for deterministic UUID v5 generation.
///
/// Used as the namespace when deriving [`ModelId`]s from model names, so
/// that well-known models have the same identity in every process.
const WARDEN_NAMESPACE: Uuid = uuid!("7c2f7cf1-48a3-4c85-9d1e-55e3a1c3b9d4");

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw arena index.
            ///
            /// Arena ids are normally allocated by a plan; this constructor
            /// exists for log replay and tests.
            #[must_use]
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw arena index.
            #[must_use]
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Identifier of a task inside a plan.
    ///
    /// Allocated monotonically by the owning plan. Never reused within a
    /// plan's lifetime, which is what makes the id table of the log
    /// rebuilder sound.
    ///
    /// # Example
    ///
    /// ```
    /// use warden_types::TaskId;
    ///
    /// let id = TaskId::from_raw(42);
    /// assert_eq!(id.as_u64(), 42);
    /// assert_eq!(id.to_string(), "task:42");
    /// ```
    TaskId,
    "task"
);

arena_id!(
    /// Identifier of an event generator inside a plan.
    ///
    /// Covers both free event generators and task-bound event generators;
    /// the owning plan records which is which.
    ///
    /// # Example
    ///
    /// ```
    /// use warden_types::GenId;
    ///
    /// let id = GenId::from_raw(3);
    /// assert_eq!(id.to_string(), "gen:3");
    /// ```
    GenId,
    "gen"
);

arena_id!(
    /// Monotonic identifier of one emission.
    ///
    /// Every emission recorded by the engine carries a fresh propagation
    /// id; comparing two ids orders the emissions they belong to.
    PropagationId,
    "prop"
);

/// Index of one execution cycle.
///
/// Starts at zero and increments once per call to the engine's cycle
/// processing. Log records reference the cycle they were produced in.
///
/// # Example
///
/// ```
/// use warden_types::CycleIndex;
///
/// let c = CycleIndex::ZERO;
/// assert_eq!(c.next().as_u64(), 1);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CycleIndex(u64);

impl CycleIndex {
    /// The first cycle.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw cycle counter.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw cycle counter.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following cycle index.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CycleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle:{}", self.0)
    }
}

/// Stable cross-process identity of a plan object.
///
/// Every task and event generator carries a `RemoteId` from creation. The
/// id survives dump/restore and log replay: a receiver reconstructs objects
/// keyed by it, and duplicate delivery of the same id must be idempotent.
///
/// # Example
///
/// ```
/// use warden_types::RemoteId;
///
/// let a = RemoteId::new();
/// let b = RemoteId::new();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteId(Uuid);

impl RemoteId {
    /// Creates a fresh identity (UUID v4).
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a task model.
///
/// # UUID Strategy
///
/// - **Named models**: UUID v5 derived from the model name, so the same
///   name always produces the same id across processes and machines.
/// - **Anonymous models**: UUID v4, unique per instance.
///
/// # Example
///
/// ```
/// use warden_types::ModelId;
///
/// let a = ModelId::named("goto");
/// let b = ModelId::named("goto");
/// let c = ModelId::named("grasp");
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId(Uuid);

impl ModelId {
    /// Deterministic id for a named model (UUID v5).
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self(Uuid::new_v5(&WARDEN_NAMESPACE, name.as_bytes()))
    }

    /// Fresh id for an anonymous model (UUID v4).
    #[must_use]
    pub fn anonymous() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_ids_roundtrip_raw() {
        assert_eq!(TaskId::from_raw(9).as_u64(), 9);
        assert_eq!(GenId::from_raw(0).as_u64(), 0);
        assert_eq!(PropagationId::from_raw(1234).as_u64(), 1234);
    }

    #[test]
    fn arena_ids_display() {
        assert_eq!(TaskId::from_raw(1).to_string(), "task:1");
        assert_eq!(GenId::from_raw(2).to_string(), "gen:2");
        assert_eq!(PropagationId::from_raw(3).to_string(), "prop:3");
    }

    #[test]
    fn arena_ids_order() {
        assert!(TaskId::from_raw(1) < TaskId::from_raw(2));
        assert!(PropagationId::from_raw(10) > PropagationId::from_raw(9));
    }

    #[test]
    fn cycle_index_advances() {
        let c = CycleIndex::ZERO;
        assert_eq!(c.as_u64(), 0);
        assert_eq!(c.next(), CycleIndex::from_raw(1));
        assert_eq!(c.next().next().as_u64(), 2);
    }

    #[test]
    fn remote_ids_are_unique() {
        assert_ne!(RemoteId::new(), RemoteId::new());
    }

    #[test]
    fn named_model_ids_are_deterministic() {
        assert_eq!(ModelId::named("goto"), ModelId::named("goto"));
        assert_ne!(ModelId::named("goto"), ModelId::named("grasp"));
        assert_ne!(ModelId::anonymous(), ModelId::anonymous());
    }

    #[test]
    fn ids_serialize() {
        let id = TaskId::from_raw(5);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<TaskId>(&json).unwrap(), id);

        let rid = RemoteId::new();
        let json = serde_json::to_string(&rid).unwrap();
        assert_eq!(serde_json::from_str::<RemoteId>(&json).unwrap(), rid);
    }
}
