//! Property-based test generators using proptest.
//!
//! Provides strategies for school entities and for edits applied to them.

use entitrack_core::Entity;
use proptest::prelude::*;

/// Strategy for generating person and course names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{1,11}").expect("Invalid regex")
}

/// Strategy for generating optional locations and cities.
pub fn optional_text_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of(name_strategy())
}

/// Strategy for a new course, unkeyed.
pub fn course_strategy() -> impl Strategy<Value = Entity> {
    (name_strategy(), optional_text_strategy()).prop_map(|(name, location)| {
        let course = Entity::new("Course").with("CourseName", name);
        match location {
            Some(location) => course.with("Location", location),
            None => course,
        }
    })
}

/// Strategy for a new student with up to `max_courses` courses, unkeyed.
pub fn student_graph_strategy(max_courses: usize) -> impl Strategy<Value = Entity> {
    (
        name_strategy(),
        prop::collection::vec(course_strategy(), 0..=max_courses),
    )
        .prop_map(|(name, courses)| {
            Entity::new("Student")
                .with("StudentName", name)
                .with_collection("Courses", courses)
        })
}

/// An edit applied to the n-th tracked student of a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentEdit {
    /// Rename the student.
    Rename(usize, String),
    /// Rename the student and then restore the original name.
    RenameAndRevert(usize, String),
    /// Mark the student for deletion.
    Remove(usize),
}

/// Strategy for a sequence of edits over `students` students.
pub fn student_edits_strategy(
    students: usize,
    max_edits: usize,
) -> impl Strategy<Value = Vec<StudentEdit>> {
    let edit = prop_oneof![
        3 => (0..students, name_strategy()).prop_map(|(i, n)| StudentEdit::Rename(i, n)),
        1 => (0..students, name_strategy()).prop_map(|(i, n)| StudentEdit::RenameAndRevert(i, n)),
        1 => (0..students).prop_map(StudentEdit::Remove),
    ];
    prop::collection::vec(edit, 0..=max_edits)
}
