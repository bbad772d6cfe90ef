//! Detached entity values handed to and returned from a session.

use entitrack_storage::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An entity instance outside any session: a type name, scalar values and,
/// optionally, nested related entities.
///
/// A session copies what it needs out of an `Entity` when it starts
/// tracking it; later edits to the caller's value are not observed.
///
/// # Example
///
/// ```
/// use entitrack_core::Entity;
///
/// let student = Entity::new("Student")
///     .with("StudentName", "Bill")
///     .with_reference("Standard", Entity::new("Standard").with("StandardName", "Grade 1"));
/// assert_eq!(student.get("StudentName").and_then(|v| v.as_text()), Some("Bill"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity type name.
    pub type_name: String,
    /// Scalar field values.
    pub values: Row,
    /// Single-valued navigations.
    pub references: BTreeMap<String, Entity>,
    /// Collection navigations.
    pub collections: BTreeMap<String, Vec<Entity>>,
}

impl Entity {
    /// Creates an empty entity of the given type.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    /// Creates an entity from stored values.
    pub fn from_row(type_name: impl Into<String>, values: Row) -> Self {
        Self {
            type_name: type_name.into(),
            values,
            ..Self::default()
        }
    }

    /// Sets a scalar field.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Sets a single-valued navigation.
    #[must_use]
    pub fn with_reference(mut self, navigation: impl Into<String>, entity: Entity) -> Self {
        self.references.insert(navigation.into(), entity);
        self
    }

    /// Sets a collection navigation.
    #[must_use]
    pub fn with_collection(mut self, navigation: impl Into<String>, entities: Vec<Entity>) -> Self {
        self.collections.insert(navigation.into(), entities);
        self
    }

    /// Sets a scalar field in place.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    /// Returns a scalar field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Returns a single-valued navigation.
    pub fn reference(&self, navigation: &str) -> Option<&Entity> {
        self.references.get(navigation)
    }

    /// Returns a collection navigation, empty if unset.
    pub fn collection(&self, navigation: &str) -> &[Entity] {
        self.collections
            .get(navigation)
            .map_or(&[], Vec::as_slice)
    }
}
