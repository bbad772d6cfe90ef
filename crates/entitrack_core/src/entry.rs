//! Tracked entries: the session's record of one entity instance.

use crate::state::EntityState;
use crate::types::{EntityKey, EntryId};
use entitrack_storage::{Row, Value};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// One entity instance tracked by a session.
///
/// Relationships between tracked entries are stored as [`EntryId`]s into
/// the session's arena, never as owning pointers, so cyclic graphs need no
/// special handling.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub(crate) id: EntryId,
    pub(crate) type_name: String,
    pub(crate) key: EntityKey,
    pub(crate) current: Row,
    pub(crate) original: Row,
    pub(crate) state: EntityState,
    pub(crate) token: Option<Value>,
    pub(crate) references: BTreeMap<String, Option<EntryId>>,
    pub(crate) collections: BTreeMap<String, Vec<EntryId>>,
    pub(crate) loaded: BTreeSet<String>,
    /// False when the snapshot is a copy of the caller's values rather than
    /// what storage holds (a disconnected entity forced to Modified).
    pub(crate) original_known: bool,
}

impl TrackedEntry {
    pub(crate) fn new(
        id: EntryId,
        type_name: &str,
        key: EntityKey,
        values: Row,
        state: EntityState,
    ) -> Self {
        Self {
            id,
            type_name: type_name.to_string(),
            key,
            original: values.clone(),
            current: values,
            state,
            token: None,
            references: BTreeMap::new(),
            collections: BTreeMap::new(),
            loaded: BTreeSet::new(),
            original_known: true,
        }
    }

    /// Arena slot of this entry.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Entity type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Key the entry is indexed under.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Current field values.
    pub fn current(&self) -> &Row {
        &self.current
    }

    /// Snapshot field values.
    pub fn original(&self) -> &Row {
        &self.original
    }

    /// Lifecycle state.
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Concurrency token captured at load time or after the last write.
    pub fn token(&self) -> Option<&Value> {
        self.token.as_ref()
    }

    /// Returns true if the navigation has been loaded or populated.
    pub fn is_loaded(&self, navigation: &str) -> bool {
        self.loaded.contains(navigation)
    }

    /// Summary for [`crate::Session::entries`].
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            type_name: self.type_name.clone(),
            key: self.key.clone(),
            state: self.state,
        }
    }
}

/// Type, key and state of a tracked entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    /// Entity type name.
    pub type_name: String,
    /// Current key.
    pub key: EntityKey,
    /// Lifecycle state.
    pub state: EntityState,
}

/// Original and current value of one scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldValues {
    /// Field name.
    pub field: String,
    /// Snapshot value.
    pub original: Value,
    /// Current value.
    pub current: Value,
}

impl FieldValues {
    /// Returns true if the current value differs from the snapshot.
    pub fn is_modified(&self) -> bool {
        self.original != self.current
    }
}
