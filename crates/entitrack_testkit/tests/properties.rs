//! Property tests: whatever the session tracks after a save is what the
//! store holds, and a second save has nothing to do.

use entitrack_testkit::prelude::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn saved_graphs_match_store(graphs in prop::collection::vec(student_graph_strategy(3), 1..4)) {
        let school = SchoolDb::new();
        let (mut session, log) = school.recording_session(SessionConfig::default());

        let mut expected_courses = 0;
        for graph in &graphs {
            expected_courses += graph.collection("Courses").len();
            session.add(graph.clone()).unwrap();
        }

        let result = session.save_changes().unwrap();
        prop_assert_eq!(result.inserted, graphs.len() + expected_courses);
        prop_assert_eq!(school.count("Student"), graphs.len());
        prop_assert_eq!(school.count("Course"), expected_courses);

        for entry in session.entries().unwrap() {
            prop_assert_eq!(entry.state, EntityState::Unchanged);
            let key = entry.key.parts()[0].as_integer().unwrap();
            let stored = school.stored(&entry.type_name, key).unwrap();
            let tracked = session.find(&entry.type_name, key).unwrap().unwrap();
            for (field, value) in &stored {
                prop_assert_eq!(&session.get(tracked, field).unwrap(), value);
            }
        }

        log.clear();
        prop_assert_eq!(session.save_changes().unwrap(), SaveResult::default());
        prop_assert!(log.events().is_empty());
    }

    #[test]
    fn edits_reach_the_store(edits in student_edits_strategy(3, 8)) {
        let school = SchoolDb::new();
        let keys: Vec<i64> = ["Bill", "Steve", "Ram"]
            .iter()
            .map(|name| school.seed_student(name, None))
            .collect();

        let mut session = school.session();
        let handles: Vec<EntityRef> = keys
            .iter()
            .map(|key| session.find("Student", *key).unwrap().unwrap())
            .collect();
        let mut expected: Vec<Option<String>> =
            vec![Some("Bill".into()), Some("Steve".into()), Some("Ram".into())];

        for edit in &edits {
            match edit {
                StudentEdit::Rename(i, name) => {
                    if expected[*i].is_some() {
                        session.set(handles[*i], "StudentName", name.as_str()).unwrap();
                        expected[*i] = Some(name.clone());
                    }
                }
                StudentEdit::RenameAndRevert(i, name) => {
                    if let Some(current) = expected[*i].clone() {
                        session.set(handles[*i], "StudentName", name.as_str()).unwrap();
                        session.set(handles[*i], "StudentName", current).unwrap();
                    }
                }
                StudentEdit::Remove(i) => {
                    if expected[*i].is_some() {
                        session.remove(handles[*i]).unwrap();
                        expected[*i] = None;
                    }
                }
            }
        }

        session.save_changes().unwrap();

        for (i, key) in keys.iter().enumerate() {
            let stored = school
                .stored("Student", *key)
                .and_then(|r| r.get("StudentName").and_then(|v| v.as_text().map(String::from)));
            prop_assert_eq!(&stored, &expected[i]);
            let state = session.state(handles[i]);
            if expected[i].is_some() {
                prop_assert_eq!(state, EntityState::Unchanged);
            } else {
                prop_assert_eq!(state, EntityState::Detached);
            }
        }
        prop_assert!(!session.has_changes().unwrap());
    }
}
