//! Test fixtures and store helpers.
//!
//! Provides a small school model and an in-memory store already holding its
//! tables, plus helpers to seed rows the way another process would.

use crate::recording::{RecordingDriver, StatementLog};
use entitrack_core::{
    DescriptorRegistry, EntityDescriptor, FieldType, Navigation, Session, SessionConfig,
};
use entitrack_storage::{InMemoryDriver, InMemoryStore, Row, Value};
use std::sync::Arc;

/// Builds a row from column/value pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(column, value)| ((*column).to_string(), value.clone()))
        .collect()
}

/// Descriptors of the school model.
///
/// - `Standard` has many `Students` and `Teachers`
/// - `Student` belongs to a `Standard`, owns one `Address` and many
///   `Courses`, and carries a `RowVersion` concurrency token
/// - `StudentAddress` shares its key with its `Student`
/// - `Course` belongs to a `Student` and a `Teacher`, both optional
/// - `Teacher` belongs to a `Standard` and has many `Courses`
pub fn school_descriptors() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor::new("Standard")
            .key_field("StandardId", FieldType::Integer)
            .generated_key()
            .field("StandardName", FieldType::Text)
            .nullable_field("Description", FieldType::Text)
            .navigation(Navigation::collection("Students", "Student", ["StandardId"]))
            .navigation(Navigation::collection("Teachers", "Teacher", ["StandardId"])),
        EntityDescriptor::new("Student")
            .key_field("StudentID", FieldType::Integer)
            .generated_key()
            .field("StudentName", FieldType::Text)
            .nullable_field("StandardId", FieldType::Integer)
            .concurrency_token("RowVersion")
            .navigation(Navigation::reference("Standard", "Standard", ["StandardId"]))
            .navigation(Navigation::dependent("Address", "StudentAddress", ["StudentID"]))
            .navigation(Navigation::collection("Courses", "Course", ["StudentId"])),
        EntityDescriptor::new("StudentAddress")
            .key_field("StudentID", FieldType::Integer)
            .field("Address1", FieldType::Text)
            .nullable_field("City", FieldType::Text)
            .navigation(Navigation::reference("Student", "Student", ["StudentID"])),
        EntityDescriptor::new("Course")
            .key_field("CourseId", FieldType::Integer)
            .generated_key()
            .field("CourseName", FieldType::Text)
            .nullable_field("Location", FieldType::Text)
            .nullable_field("StudentId", FieldType::Integer)
            .nullable_field("TeacherId", FieldType::Integer)
            .navigation(Navigation::reference("Student", "Student", ["StudentId"]))
            .navigation(Navigation::reference("Teacher", "Teacher", ["TeacherId"])),
        EntityDescriptor::new("Teacher")
            .key_field("TeacherId", FieldType::Integer)
            .generated_key()
            .field("TeacherName", FieldType::Text)
            .nullable_field("StandardId", FieldType::Integer)
            .navigation(Navigation::reference("Standard", "Standard", ["StandardId"]))
            .navigation(Navigation::collection("Courses", "Course", ["TeacherId"])),
    ]
}

/// Registry holding the school model.
pub fn school_registry() -> Arc<DescriptorRegistry> {
    registry_of(school_descriptors())
}

/// Registry holding the given descriptors.
pub fn registry_of(descriptors: Vec<EntityDescriptor>) -> Arc<DescriptorRegistry> {
    let mut registry = DescriptorRegistry::new();
    for descriptor in descriptors {
        registry
            .register(descriptor)
            .expect("Failed to register descriptor");
    }
    registry.validate().expect("Invalid test model");
    Arc::new(registry)
}

/// Creates a table for every registered descriptor.
pub fn create_tables(store: &InMemoryStore, registry: &DescriptorRegistry) {
    for descriptor in registry.iter() {
        store.create_table(&descriptor.table_meta());
    }
}

/// An in-memory store with the tables of a registry.
///
/// Sessions opened from it share committed rows, so two sessions act like
/// two clients of one database.
#[derive(Debug, Clone)]
pub struct SchoolDb {
    /// The shared store.
    pub store: InMemoryStore,
    /// The model.
    pub registry: Arc<DescriptorRegistry>,
}

impl SchoolDb {
    /// Creates a store with the school model.
    pub fn new() -> Self {
        Self::with_registry(school_registry())
    }

    /// Creates a store with an arbitrary model.
    pub fn with_registry(registry: Arc<DescriptorRegistry>) -> Self {
        let store = InMemoryStore::new();
        create_tables(&store, &registry);
        Self { store, registry }
    }

    /// Opens a session with the default configuration.
    pub fn session(&self) -> Session<InMemoryDriver> {
        self.session_with(SessionConfig::default())
    }

    /// Opens a session with `config`.
    pub fn session_with(&self, config: SessionConfig) -> Session<InMemoryDriver> {
        Session::new(self.store.connect(), Arc::clone(&self.registry), config)
            .expect("Failed to open session")
    }

    /// Opens a session whose driver records every call.
    pub fn recording_session(
        &self,
        config: SessionConfig,
    ) -> (Session<RecordingDriver<InMemoryDriver>>, StatementLog) {
        let driver = RecordingDriver::new(self.store.connect());
        let log = driver.log();
        let session = Session::new(driver, Arc::clone(&self.registry), config)
            .expect("Failed to open session");
        (session, log)
    }

    /// Inserts a row directly and returns its generated key.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) -> i64 {
        let stored = self
            .store
            .seed(table, row(values))
            .expect("Failed to seed row");
        let key_column = self
            .registry
            .get(table)
            .expect("Unknown table")
            .key_fields()[0]
            .clone();
        stored
            .get(&key_column)
            .and_then(Value::as_integer)
            .expect("Seeded row has no integer key")
    }

    /// Seeds a standard.
    pub fn seed_standard(&self, name: &str) -> i64 {
        self.seed("Standard", &[("StandardName", Value::from(name))])
    }

    /// Seeds a student, optionally enrolled in a standard.
    pub fn seed_student(&self, name: &str, standard: Option<i64>) -> i64 {
        self.seed(
            "Student",
            &[
                ("StudentName", Value::from(name)),
                ("StandardId", standard.map_or(Value::Null, Value::Integer)),
            ],
        )
    }

    /// Seeds the address of a student.
    pub fn seed_address(&self, student: i64, address: &str) -> i64 {
        self.seed(
            "StudentAddress",
            &[
                ("StudentID", Value::Integer(student)),
                ("Address1", Value::from(address)),
            ],
        )
    }

    /// Seeds a course, optionally taken by a student.
    pub fn seed_course(&self, name: &str, student: Option<i64>) -> i64 {
        self.seed(
            "Course",
            &[
                ("CourseName", Value::from(name)),
                ("StudentId", student.map_or(Value::Null, Value::Integer)),
            ],
        )
    }

    /// Seeds a teacher, optionally assigned to a standard.
    pub fn seed_teacher(&self, name: &str, standard: Option<i64>) -> i64 {
        self.seed(
            "Teacher",
            &[
                ("TeacherName", Value::from(name)),
                ("StandardId", standard.map_or(Value::Null, Value::Integer)),
            ],
        )
    }

    /// Committed row of `table` with integer key `key`.
    pub fn stored(&self, table: &str, key: i64) -> Option<Row> {
        let key_column = self
            .registry
            .get(table)
            .expect("Unknown table")
            .key_fields()[0]
            .clone();
        self.store
            .rows(table)
            .into_iter()
            .find(|r| r.get(&key_column) == Some(&Value::Integer(key)))
    }

    /// Number of committed rows in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.store.row_count(table)
    }
}

impl Default for SchoolDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn school_model_is_valid() {
        let registry = school_registry();
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn seeding_generates_keys() {
        let school = SchoolDb::new();
        let first = school.seed_standard("Grade 1");
        let second = school.seed_standard("Grade 2");
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let student = school.seed_student("Bill", Some(first));
        let stored = school.stored("Student", student).unwrap();
        assert_eq!(stored.get("StandardId"), Some(&Value::Integer(first)));
        assert!(stored.get("RowVersion").and_then(Value::as_integer).is_some());
    }

    #[test]
    fn address_key_comes_from_student() {
        let school = SchoolDb::new();
        let student = school.seed_student("Bill", None);
        assert_eq!(school.seed_address(student, "1 Main St"), student);
        assert_eq!(school.count("StudentAddress"), 1);
    }
}
