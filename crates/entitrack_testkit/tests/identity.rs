//! Identity resolution across find, query and attach.

use entitrack_testkit::prelude::*;

#[test]
fn find_twice_returns_same_handle() {
    init_tracing();
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let (mut session, log) = school.recording_session(SessionConfig::default());
    let first = session.find("Student", bill).unwrap().unwrap();
    let second = session.find("Student", bill).unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(log.query_count(), 1);
    assert_eq!(session.state(first), EntityState::Unchanged);
}

#[test]
fn find_missing_or_unset_key_returns_none() {
    let school = SchoolDb::new();
    let mut session = school.session();

    assert!(session.find("Student", 42).unwrap().is_none());
    assert!(session.find("Student", 0).unwrap().is_none());
    assert!(session.find("Student", Value::Null).unwrap().is_none());
}

#[test]
fn query_routes_rows_through_identity_map() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);
    school.seed_student("Steve", None);

    let mut session = school.session();
    let tracked = session.find("Student", bill).unwrap().unwrap();
    session.set(tracked, "StudentName", "William").unwrap();

    let all = session.query("Student", &Predicate::new()).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&tracked));

    // The stored row does not overwrite pending edits.
    assert_eq!(
        session.get(tracked, "StudentName").unwrap(),
        Value::from("William")
    );
    assert_eq!(session.state(tracked), EntityState::Modified);
}

#[test]
fn query_by_field_value() {
    let school = SchoolDb::new();
    let grade = school.seed_standard("Grade 1");
    school.seed_student("Bill", Some(grade));
    school.seed_student("Steve", Some(grade));
    school.seed_student("Ram", None);

    let mut session = school.session();
    let enrolled = session
        .query("Student", &Predicate::new().and_eq("StandardId", grade))
        .unwrap();
    assert_eq!(enrolled.len(), 2);
}

#[test]
fn attaching_divergent_values_over_dirty_entry_conflicts() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut session = school.session();
    let tracked = session.find("Student", bill).unwrap().unwrap();
    session.set(tracked, "StudentName", "William").unwrap();

    let copy = Entity::new("Student")
        .with("StudentID", bill)
        .with("StudentName", "Billy");
    let result = session.attach(copy, EntityState::Unchanged);
    assert!(matches!(result, Err(CoreError::IdentityConflict { .. })));
    assert_eq!(
        session.get(tracked, "StudentName").unwrap(),
        Value::from("William")
    );
}

#[test]
fn attaching_over_clean_entry_resolves_to_it() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut session = school.session();
    let tracked = session.find("Student", bill).unwrap().unwrap();

    let copy = Entity::new("Student")
        .with("StudentID", bill)
        .with("StudentName", "Someone else");
    let attached = session.attach(copy, EntityState::Unchanged).unwrap();

    assert_eq!(attached, tracked);
    assert_eq!(session.get(tracked, "StudentName").unwrap(), Value::from("Bill"));
    assert_eq!(session.state(tracked), EntityState::Unchanged);
}

#[test]
fn detach_then_find_tracks_a_fresh_entry() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut session = school.session();
    let first = session.find("Student", bill).unwrap().unwrap();
    session.detach(first).unwrap();
    assert_eq!(session.state(first), EntityState::Detached);

    let second = session.find("Student", bill).unwrap().unwrap();
    assert_ne!(first, second);
    assert!(matches!(
        session.get(first, "StudentName"),
        Err(CoreError::EntryNotTracked { .. })
    ));
}

#[test]
fn handles_do_not_cross_sessions() {
    let school = SchoolDb::new();
    let bill = school.seed_student("Bill", None);

    let mut a = school.session();
    let b = school.session();
    let handle = a.find("Student", bill).unwrap().unwrap();

    assert_eq!(b.state(handle), EntityState::Detached);
    assert!(b.get(handle, "StudentName").is_err());
}
