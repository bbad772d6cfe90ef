//! Optimistic concurrency between sessions sharing one store.

use entitrack_testkit::prelude::*;

#[test]
fn stale_token_conflicts_then_reload_and_retry_succeeds() {
    init_tracing();
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut a = school.session();
    let mut b = school.session();
    let in_a = a.find("Student", bill).unwrap().unwrap();
    let in_b = b.find("Student", bill).unwrap().unwrap();

    a.set(in_a, "StudentName", "William").unwrap();
    a.save_changes().unwrap();

    b.set(in_b, "StudentName", "Billy").unwrap();
    let err = b.save_changes().unwrap_err();
    match &err {
        CoreError::ConcurrencyConflict { type_name, kind, .. } => {
            assert_eq!(type_name, "Student");
            assert_eq!(*kind, StatementKind::Update);
        }
        other => panic!("expected a conflict, got {other}"),
    }
    assert!(err.is_retryable());

    // The losing session keeps its pending edit.
    assert_eq!(b.state(in_b), EntityState::Modified);
    assert_eq!(b.get(in_b, "StudentName").unwrap(), Value::from("Billy"));
    assert_eq!(
        school.stored("Student", bill).unwrap().get("StudentName"),
        Some(&Value::from("William"))
    );

    assert!(b.reload(in_b).unwrap());
    assert_eq!(b.state(in_b), EntityState::Unchanged);
    assert_eq!(b.get(in_b, "StudentName").unwrap(), Value::from("William"));

    b.set(in_b, "StudentName", "Billy").unwrap();
    b.save_changes().unwrap();
    assert_eq!(
        school.stored("Student", bill).unwrap().get("StudentName"),
        Some(&Value::from("Billy"))
    );
}

#[test]
fn external_write_bumps_token() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut session = school.session();
    let student = session.find("Student", bill).unwrap().unwrap();
    let before = session.get(student, "RowVersion").unwrap();

    school
        .store
        .update_where(
            "Student",
            &Predicate::new().and_eq("StudentID", bill),
            &row(&[("StandardId", Value::Null)]),
        )
        .unwrap();

    session.set(student, "StudentName", "William").unwrap();
    assert!(session.save_changes().unwrap_err().is_concurrency_conflict());

    session.reload(student).unwrap();
    assert_ne!(session.get(student, "RowVersion").unwrap(), before);
}

#[test]
fn snapshot_values_guard_types_without_token() {
    let school = SchoolDb::new();
    let grade = school.seed_standard("Grade 1");

    let mut a = school.session();
    let mut b = school.session();
    let in_a = a.find("Standard", grade).unwrap().unwrap();
    let in_b = b.find("Standard", grade).unwrap().unwrap();

    a.set(in_a, "StandardName", "First Grade").unwrap();
    a.save_changes().unwrap();

    b.set(in_b, "Description", "Ages 6-7").unwrap();
    assert!(matches!(
        b.save_changes(),
        Err(CoreError::ConcurrencyConflict {
            kind: StatementKind::Update,
            ..
        })
    ));
}

#[test]
fn without_snapshot_predicates_last_write_wins() {
    let school = SchoolDb::new();
    let grade = school.seed_standard("Grade 1");

    let mut a = school.session();
    let mut b = school.session_with(SessionConfig::new().snapshot_predicates(false));
    let in_a = a.find("Standard", grade).unwrap().unwrap();
    let in_b = b.find("Standard", grade).unwrap().unwrap();

    a.set(in_a, "StandardName", "First Grade").unwrap();
    a.save_changes().unwrap();

    b.set(in_b, "Description", "Ages 6-7").unwrap();
    assert_eq!(b.save_changes().unwrap().updated, 1);

    let stored = school.stored("Standard", grade).unwrap();
    assert_eq!(stored.get("StandardName"), Some(&Value::from("First Grade")));
    assert_eq!(stored.get("Description"), Some(&Value::from("Ages 6-7")));
}

#[test]
fn deleting_an_already_deleted_row_conflicts() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut a = school.session();
    let mut b = school.session();
    let in_a = a.find("Student", bill).unwrap().unwrap();
    let in_b = b.find("Student", bill).unwrap().unwrap();

    a.remove(in_a).unwrap();
    a.save_changes().unwrap();

    b.remove(in_b).unwrap();
    assert!(matches!(
        b.save_changes(),
        Err(CoreError::ConcurrencyConflict {
            kind: StatementKind::Delete,
            ..
        })
    ));
    assert_eq!(b.state(in_b), EntityState::Deleted);

    assert!(!b.reload(in_b).unwrap());
    assert_eq!(b.state(in_b), EntityState::Detached);
}

#[test]
fn conflict_aborts_the_whole_batch() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut a = school.session();
    let mut b = school.session();
    let in_a = a.find("Student", bill).unwrap().unwrap();
    let in_b = b.find("Student", bill).unwrap().unwrap();

    a.set(in_a, "StudentName", "William").unwrap();
    a.save_changes().unwrap();

    let course = b
        .add(Entity::new("Course").with("CourseName", "Math"))
        .unwrap();
    b.set(in_b, "StudentName", "Billy").unwrap();
    assert!(b.save_changes().is_err());

    assert_eq!(school.count("Course"), 0);
    assert_eq!(b.state(course), EntityState::Added);
}
