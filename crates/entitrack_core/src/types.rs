//! Core type definitions for entitrack.

use entitrack_storage::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Arena slot of a tracked entry within one session.
///
/// Entry IDs are monotonically increasing per session and never reused, so
/// ordering by ID is ordering by tracking time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Creates a new entry ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry:{}", self.0)
    }
}

/// Unique identifier of a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primary key value of an entity, one part per key field.
///
/// Composite keys keep the descriptor's key-field order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey(Vec<Value>);

impl EntityKey {
    /// Creates a key from its parts.
    #[must_use]
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    /// Returns the key parts.
    #[must_use]
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// Returns true if any part is NULL.
    #[must_use]
    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

impl From<Value> for EntityKey {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        Self(vec![Value::Integer(value)])
    }
}

impl From<i32> for EntityKey {
    fn from(value: i32) -> Self {
        Self(vec![Value::from(value)])
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self(vec![Value::from(value)])
    }
}

impl From<Vec<Value>> for EntityKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}
