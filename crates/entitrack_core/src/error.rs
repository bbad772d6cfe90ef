//! Error types for entitrack core.

use crate::state::EntityState;
use crate::types::{EntityKey, EntryId};
use entitrack_storage::StatementKind;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in change tracking and saving.
///
/// Callers are expected to branch on the variant. The four engine failure
/// kinds are [`CoreError::IdentityConflict`], [`CoreError::GraphCycleDetected`],
/// [`CoreError::ConcurrencyConflict`] and [`CoreError::DetachedNavigationAccess`];
/// driver failures arrive as [`CoreError::Storage`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage driver error, propagated verbatim.
    #[error("storage error: {0}")]
    Storage(#[from] entitrack_storage::StorageError),

    /// Two instances claim the same key with divergent field values.
    #[error("identity conflict: {type_name}{key} is already tracked with different values")]
    IdentityConflict {
        /// Entity type.
        type_name: String,
        /// The contested key.
        key: EntityKey,
    },

    /// The insert or delete dependency graph contains a cycle.
    #[error("dependency cycle detected among {}", .entities.join(", "))]
    GraphCycleDetected {
        /// Entities that take part in the cycle.
        entities: Vec<String>,
    },

    /// An update or delete matched zero rows.
    #[error("concurrency conflict: {kind} of {type_name}{key} affected no rows")]
    ConcurrencyConflict {
        /// Entity type.
        type_name: String,
        /// Original key of the entity.
        key: EntityKey,
        /// The statement that matched nothing.
        kind: StatementKind,
    },

    /// A navigation was loaded on an entity the session does not track.
    #[error("navigation {navigation} of {type_name} accessed on a detached entity")]
    DetachedNavigationAccess {
        /// Entity type.
        type_name: String,
        /// Navigation name.
        navigation: String,
    },

    /// Entity type was never registered.
    #[error("unknown entity type: {name}")]
    UnknownEntityType {
        /// Name that was looked up.
        name: String,
    },

    /// Field is not a scalar of the entity type.
    #[error("unknown field {field} on {type_name}")]
    UnknownField {
        /// Entity type.
        type_name: String,
        /// Field name.
        field: String,
    },

    /// Navigation is not declared on the entity type.
    #[error("unknown navigation {navigation} on {type_name}")]
    UnknownNavigation {
        /// Entity type.
        type_name: String,
        /// Navigation name.
        navigation: String,
    },

    /// Entity model is inconsistent.
    #[error("invalid model: {message}")]
    InvalidModel {
        /// Description of the problem.
        message: String,
    },

    /// Value does not fit the field's declared type.
    #[error("invalid value for {type_name}.{field}: {message}")]
    InvalidValue {
        /// Entity type.
        type_name: String,
        /// Field name.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// Handle does not refer to an entry tracked by this session.
    #[error("entry {entry} is not tracked by this session")]
    EntryNotTracked {
        /// The stale or foreign handle.
        entry: EntryId,
    },

    /// State machine rejected the event.
    #[error("invalid state transition: {event} from {from}")]
    InvalidStateTransition {
        /// Current state.
        from: EntityState,
        /// Event that was applied.
        event: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Save was cancelled through its cancel handle.
    #[error("save cancelled")]
    Cancelled,
}

impl CoreError {
    /// Creates an invalid model error.
    pub fn invalid_model(message: impl Into<String>) -> Self {
        Self::InvalidModel {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an unknown entity type error.
    pub fn unknown_type(name: impl Into<String>) -> Self {
        Self::UnknownEntityType { name: name.into() }
    }

    /// Creates an unknown field error.
    pub fn unknown_field(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            type_name: type_name.into(),
            field: field.into(),
        }
    }

    /// Creates an unknown navigation error.
    pub fn unknown_navigation(type_name: impl Into<String>, navigation: impl Into<String>) -> Self {
        Self::UnknownNavigation {
            type_name: type_name.into(),
            navigation: navigation.into(),
        }
    }

    /// Returns true for optimistic-concurrency conflicts.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, CoreError::ConcurrencyConflict { .. })
    }

    /// Returns true if the caller can recover by reloading and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::ConcurrencyConflict { .. } | CoreError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitrack_storage::StorageError;

    #[test]
    fn retryable_errors() {
        let conflict = CoreError::ConcurrencyConflict {
            type_name: "Student".into(),
            key: EntityKey::from(1),
            kind: StatementKind::Update,
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_concurrency_conflict());
        assert!(CoreError::Cancelled.is_retryable());
        assert!(!CoreError::invalid_operation("nope").is_retryable());
    }

    #[test]
    fn error_display() {
        let err = CoreError::GraphCycleDetected {
            entities: vec!["A(1)".into(), "B(2)".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected among A(1), B(2)");

        let err = CoreError::ConcurrencyConflict {
            type_name: "Student".into(),
            key: EntityKey::from(1),
            kind: StatementKind::Delete,
        };
        assert_eq!(err.to_string(), "concurrency conflict: DELETE of Student(1) affected no rows");
    }

    #[test]
    fn storage_errors_convert() {
        let err: CoreError = StorageError::driver("disk full").into();
        assert!(matches!(err, CoreError::Storage(_)));
    }
}
