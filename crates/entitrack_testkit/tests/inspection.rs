//! Entry listing, field values and change detection as seen by callers.

use entitrack_testkit::prelude::*;
use serde_json::json;

#[test]
fn entries_serialize_type_key_and_state() {
    let school = SchoolDb::new();
    let grade = school.seed_standard("Grade 1");

    let mut session = school.session();
    session.find("Standard", grade).unwrap();
    session
        .add(Entity::new("Course").with("CourseName", "Math"))
        .unwrap();

    let entries = session.entries().unwrap();
    let value = serde_json::to_value(&entries).unwrap();
    assert_eq!(
        value,
        json!([
            { "type_name": "Standard", "key": [{ "Integer": grade }], "state": "Unchanged" },
            { "type_name": "Course", "key": ["Null"], "state": "Added" },
        ])
    );
}

#[test]
fn entry_values_report_original_and_current() {
    let school = SchoolDb::new();
    let grade = school.seed_standard("Grade 1");

    let mut session = school.session();
    let standard = session.find("Standard", grade).unwrap().unwrap();
    session.set(standard, "StandardName", "First Grade").unwrap();

    let values = session.entry_values(standard).unwrap();
    let name = values.iter().find(|v| v.field == "StandardName").unwrap();
    assert!(name.is_modified());
    assert_eq!(name.original, Value::from("Grade 1"));
    assert_eq!(name.current, Value::from("First Grade"));
    assert!(!values.iter().find(|v| v.field == "Description").unwrap().is_modified());

    let changes = session.change_set(standard).unwrap();
    assert_eq!(changes.state, EntityState::Modified);
    assert_eq!(changes.changes.len(), 1);
}

#[test]
fn reverted_edit_stays_modified_and_writes_all_fields() {
    let school = SchoolDb::new();
    let grade = school.seed_standard("Grade 1");

    let (mut session, log) = school.recording_session(SessionConfig::default());
    let standard = session.find("Standard", grade).unwrap().unwrap();
    assert!(!session.has_changes().unwrap());

    session.set(standard, "StandardName", "First Grade").unwrap();
    session.set(standard, "StandardName", "Grade 1").unwrap();
    assert_eq!(session.state(standard), EntityState::Modified);
    assert!(session.has_changes().unwrap());
    assert!(session.change_set(standard).unwrap().is_empty());

    assert_eq!(session.save_changes().unwrap().updated, 1);
    match &log.writes()[0] {
        DriverEvent::Execute { kind, values, .. } => {
            assert_eq!(*kind, StatementKind::Update);
            assert_eq!(values.len(), 2);
            assert!(values.contains_key("StandardName"));
            assert!(values.contains_key("Description"));
        }
        other => panic!("expected a write, got {other:?}"),
    }
    assert_eq!(session.state(standard), EntityState::Unchanged);
}

#[test]
fn update_writes_only_changed_fields_with_token_predicate() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let (mut session, log) = school.recording_session(SessionConfig::default());
    let student = session.find("Student", bill).unwrap().unwrap();
    let token = session.get(student, "RowVersion").unwrap();
    session.set(student, "StudentName", "William").unwrap();
    session.save_changes().unwrap();

    match &log.writes()[0] {
        DriverEvent::Execute { values, predicate, .. } => {
            assert_eq!(values, &row(&[("StudentName", Value::from("William"))]));
            assert_eq!(predicate.get("StudentID"), Some(&Value::Integer(bill)));
            assert_eq!(predicate.get("RowVersion"), Some(&token));
            assert_eq!(predicate.terms().len(), 2);
        }
        other => panic!("expected a write, got {other:?}"),
    }
    assert_ne!(session.get(student, "RowVersion").unwrap(), token);
}

#[test]
fn invalid_writes_are_rejected() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut session = school.session();
    let student = session.find("Student", bill).unwrap().unwrap();

    assert!(matches!(
        session.set(student, "Nickname", "Billy"),
        Err(CoreError::UnknownField { .. })
    ));
    assert!(matches!(
        session.set(student, "StudentName", 7),
        Err(CoreError::InvalidValue { .. })
    ));
    assert!(matches!(
        session.set(student, "StudentID", 99),
        Err(CoreError::InvalidOperation { .. })
    ));
    assert!(matches!(
        session.set(student, "RowVersion", 99),
        Err(CoreError::InvalidOperation { .. })
    ));
    assert_eq!(session.state(student), EntityState::Unchanged);

    session.remove(student).unwrap();
    assert!(matches!(
        session.set(student, "StudentName", "Billy"),
        Err(CoreError::InvalidOperation { .. })
    ));
}

#[test]
fn keyless_entity_cannot_be_attached_unchanged() {
    let school = SchoolDb::new();
    let mut session = school.session();

    let result = session.attach(
        Entity::new("Standard").with("StandardName", "Grade 1"),
        EntityState::Unchanged,
    );
    assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    assert!(matches!(
        session.attach(Entity::new("Standard"), EntityState::Detached),
        Err(CoreError::InvalidOperation { .. })
    ));
}

#[test]
fn clear_evicts_everything() {
    let school = SchoolDb::new();
    let grade = school.seed_standard("Grade 1");

    let mut session = school.session();
    let standard = session.find("Standard", grade).unwrap().unwrap();
    session
        .add(Entity::new("Standard").with("StandardName", "Grade 2"))
        .unwrap();

    session.clear();
    assert!(session.entries().unwrap().is_empty());
    assert_eq!(session.state(standard), EntityState::Detached);
    assert!(!session.has_changes().unwrap());
}
