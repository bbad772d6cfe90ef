//! Optimistic concurrency: write predicates and zero-row detection.

use crate::descriptor::EntityDescriptor;
use crate::entry::TrackedEntry;
use crate::error::{CoreError, CoreResult};
use entitrack_storage::{Predicate, StatementKind, Value, WriteOutcome};
use tracing::warn;

/// Builds the predicate guarding an update or delete of `entry`.
///
/// The predicate always pins the original key. Types with a concurrency
/// token add the token value captured at load time. Types without one add
/// every original writable value when `snapshot_predicates` is set and the
/// snapshot reflects what storage held.
pub fn write_predicate(
    descriptor: &EntityDescriptor,
    entry: &TrackedEntry,
    snapshot_predicates: bool,
) -> Predicate {
    let mut predicate = Predicate::from_pairs(
        descriptor
            .key_fields()
            .iter()
            .cloned()
            .zip(entry.key.parts().iter().cloned()),
    );

    if let Some(token) = descriptor.token_field() {
        predicate.push(token, entry.token.clone().unwrap_or(Value::Null));
    } else if snapshot_predicates && entry.original_known {
        for field in descriptor.writable_fields() {
            let original = entry.original.get(&field.name).cloned().unwrap_or(Value::Null);
            predicate.push(field.name.clone(), original);
        }
    }
    predicate
}

/// Fails with [`CoreError::ConcurrencyConflict`] when an update or delete
/// matched no rows.
///
/// A missing row and a stale token look the same from here; the caller
/// reloads to find out which.
///
/// # Errors
///
/// Returns [`CoreError::ConcurrencyConflict`] on a zero-row update or delete.
pub fn check_outcome(
    kind: StatementKind,
    entry: &TrackedEntry,
    outcome: &WriteOutcome,
) -> CoreResult<()> {
    if kind == StatementKind::Insert || outcome.rows_affected > 0 {
        return Ok(());
    }
    warn!(
        entity = %entry.type_name,
        key = %entry.key,
        statement = %kind,
        "concurrency conflict"
    );
    Err(CoreError::ConcurrencyConflict {
        type_name: entry.type_name.clone(),
        key: entry.key.clone(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldType;
    use crate::snapshot::capture_snapshot;
    use crate::state::EntityState;
    use crate::types::EntryId;
    use entitrack_storage::Row;

    fn course() -> EntityDescriptor {
        EntityDescriptor::new("Course")
            .key_field("CourseId", FieldType::Integer)
            .field("CourseName", FieldType::Text)
    }

    fn student() -> EntityDescriptor {
        EntityDescriptor::new("Student")
            .key_field("StudentID", FieldType::Integer)
            .field("StudentName", FieldType::Text)
            .concurrency_token("RowVersion")
    }

    fn entry(descriptor: &EntityDescriptor, values: &[(&str, Value)]) -> TrackedEntry {
        let row: Row = values.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect();
        let key = descriptor.key_of(&row);
        let mut entry =
            TrackedEntry::new(EntryId::new(1), descriptor.name(), key, row, EntityState::Unchanged);
        capture_snapshot(descriptor, &mut entry);
        entry
    }

    #[test]
    fn token_predicate_uses_captured_token() {
        let descriptor = student();
        let mut entry = entry(
            &descriptor,
            &[
                ("StudentID", Value::Integer(1)),
                ("StudentName", Value::from("Bill")),
                ("RowVersion", Value::Integer(4)),
            ],
        );
        entry.current.insert("StudentName".into(), Value::from("Steve"));

        let predicate = write_predicate(&descriptor, &entry, true);
        assert_eq!(predicate.get("StudentID"), Some(&Value::Integer(1)));
        assert_eq!(predicate.get("RowVersion"), Some(&Value::Integer(4)));
        assert_eq!(predicate.get("StudentName"), None);
    }

    #[test]
    fn snapshot_predicate_without_token() {
        let descriptor = course();
        let mut entry = entry(
            &descriptor,
            &[("CourseId", Value::Integer(3)), ("CourseName", Value::from("Math"))],
        );
        entry.current.insert("CourseName".into(), Value::from("Physics"));

        let guarded = write_predicate(&descriptor, &entry, true);
        assert_eq!(guarded.to_string(), "CourseId = 3 AND CourseName = 'Math'");

        let key_only = write_predicate(&descriptor, &entry, false);
        assert_eq!(key_only.to_string(), "CourseId = 3");

        entry.original_known = false;
        assert_eq!(write_predicate(&descriptor, &entry, true).to_string(), "CourseId = 3");
    }

    #[test]
    fn zero_rows_is_a_conflict() {
        let descriptor = course();
        let entry = entry(
            &descriptor,
            &[("CourseId", Value::Integer(3)), ("CourseName", Value::from("Math"))],
        );

        assert!(check_outcome(StatementKind::Update, &entry, &WriteOutcome::rows(1)).is_ok());
        assert!(check_outcome(StatementKind::Insert, &entry, &WriteOutcome::rows(0)).is_ok());
        let err = check_outcome(StatementKind::Delete, &entry, &WriteOutcome::rows(0)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConcurrencyConflict { kind: StatementKind::Delete, .. }
        ));
    }
}
