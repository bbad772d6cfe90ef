//! Snapshot capture and field-level diffing.

use crate::descriptor::EntityDescriptor;
use crate::entry::TrackedEntry;
use crate::state::EntityState;
use crate::types::{EntityKey, EntryId};
use entitrack_storage::{Row, Value};
use serde::Serialize;

/// One field whose current value differs from its snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    /// Field name.
    pub field: String,
    /// Snapshot value.
    pub old: Value,
    /// Current value.
    pub new: Value,
}

/// Field-level delta of one entry, recomputed for every save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    /// Entry the delta belongs to.
    #[serde(skip)]
    pub entry: EntryId,
    /// Entity type name.
    pub type_name: String,
    /// Key at the time the delta was computed.
    pub key: EntityKey,
    /// Entry state.
    pub state: EntityState,
    /// Writable fields that differ, in field order. Never contains the
    /// concurrency token.
    pub changes: Vec<FieldChange>,
    /// Token value captured at load time, used as a write predicate.
    pub original_token: Option<Value>,
}

impl ChangeSet {
    /// Returns true if no writable field differs.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the change for a field, if it differs.
    pub fn change(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.field == field)
    }
}

/// Resets the entry's snapshot to its current values.
pub fn capture_snapshot(descriptor: &EntityDescriptor, entry: &mut TrackedEntry) {
    entry.original = entry.current.clone();
    entry.original_known = true;
    entry.token = descriptor
        .token_field()
        .and_then(|field| entry.current.get(field).cloned());
}

/// Compares current values against the snapshot, field by field.
///
/// Key fields are compared like any other field; the token is skipped.
pub fn compute_change_set(descriptor: &EntityDescriptor, entry: &TrackedEntry) -> ChangeSet {
    ChangeSet {
        entry: entry.id,
        type_name: entry.type_name.clone(),
        key: entry.key.clone(),
        state: entry.state,
        changes: diff(descriptor, &entry.original, &entry.current),
        original_token: entry.token.clone(),
    }
}

/// Returns true if any non-token field differs from the snapshot.
pub fn has_changes(descriptor: &EntityDescriptor, entry: &TrackedEntry) -> bool {
    descriptor
        .scalars()
        .iter()
        .filter(|f| !descriptor.is_token_field(&f.name))
        .any(|f| entry.original.get(&f.name) != entry.current.get(&f.name))
}

fn diff(descriptor: &EntityDescriptor, original: &Row, current: &Row) -> Vec<FieldChange> {
    descriptor
        .scalars()
        .iter()
        .filter(|f| !descriptor.is_token_field(&f.name))
        .filter_map(|f| {
            let old = original.get(&f.name).cloned().unwrap_or(Value::Null);
            let new = current.get(&f.name).cloned().unwrap_or(Value::Null);
            (old != new).then(|| FieldChange {
                field: f.name.clone(),
                old,
                new,
            })
        })
        .collect()
}
