//! Entity descriptors: static metadata about keys, fields and relationships.

use crate::error::{CoreError, CoreResult};
use crate::types::EntityKey;
use entitrack_storage::{Row, TableMeta, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Declared type of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 text.
    Text,
    /// Byte string.
    Bytes,
}

impl FieldType {
    /// Returns true if a non-null value has this type.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldType::Bool, Value::Bool(_))
                | (FieldType::Integer, Value::Integer(_))
                | (FieldType::Text, Value::Text(_))
                | (FieldType::Bytes, Value::Bytes(_))
        )
    }
}

/// A scalar (column-backed) field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarField {
    /// Field name, also the column name.
    pub name: String,
    /// Declared type.
    pub ty: FieldType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

/// Whether a navigation yields one entity or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// At most one related entity.
    Single,
    /// Any number of related entities.
    Collection,
}

/// Which end of a navigation stores the foreign-key fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForeignKeySide {
    /// The declaring entity holds the foreign key (it is the dependent).
    Source,
    /// The related entity holds the foreign key (it is the dependent).
    Target,
}

/// A relationship field linking one entity to another entity or collection.
///
/// Foreign-key fields live on the dependent end and map, in order, onto the
/// principal's key fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// Navigation name.
    pub name: String,
    /// Related entity type.
    pub target: String,
    /// One or many.
    pub cardinality: Cardinality,
    /// Where the foreign key lives.
    pub side: ForeignKeySide,
    /// Foreign-key fields on the dependent end.
    pub foreign_key: Vec<String>,
}

impl Navigation {
    /// Many-to-one: this entity holds `foreign_key` referencing `target`.
    pub fn reference<I, S>(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::Single,
            side: ForeignKeySide::Source,
            foreign_key: foreign_key.into_iter().map(Into::into).collect(),
        }
    }

    /// One-to-many: each `target` holds `foreign_key` referencing this entity.
    pub fn collection<I, S>(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::Collection,
            side: ForeignKeySide::Target,
            foreign_key: foreign_key.into_iter().map(Into::into).collect(),
        }
    }

    /// One-to-one from the principal: the single `target` holds
    /// `foreign_key` referencing this entity.
    pub fn dependent<I, S>(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::Single,
            side: ForeignKeySide::Target,
            foreign_key: foreign_key.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the related entities are owned dependents of the
    /// declaring entity.
    pub fn is_owned(&self) -> bool {
        self.side == ForeignKeySide::Target
    }
}

/// Static metadata for one entity type. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    name: String,
    table: String,
    key: Vec<String>,
    key_generated: bool,
    scalars: Vec<ScalarField>,
    navigations: Vec<Navigation>,
    concurrency_token: Option<String>,
}

impl EntityDescriptor {
    /// Starts a descriptor for `name`, stored in a table of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            key: Vec::new(),
            key_generated: false,
            scalars: Vec::new(),
            navigations: Vec::new(),
            concurrency_token: None,
        }
    }

    /// Sets the table name.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Adds a key field. Call repeatedly for composite keys.
    #[must_use]
    pub fn key_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        self.key.push(name.clone());
        self.scalars.push(ScalarField {
            name,
            ty,
            nullable: false,
        });
        self
    }

    /// Marks the (single, integer) key as generated by the store.
    #[must_use]
    pub fn generated_key(mut self) -> Self {
        self.key_generated = true;
        self
    }

    /// Adds a non-nullable scalar field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.scalars.push(ScalarField {
            name: name.into(),
            ty,
            nullable: false,
        });
        self
    }

    /// Adds a nullable scalar field.
    #[must_use]
    pub fn nullable_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.scalars.push(ScalarField {
            name: name.into(),
            ty,
            nullable: true,
        });
        self
    }

    /// Adds a navigation.
    #[must_use]
    pub fn navigation(mut self, navigation: Navigation) -> Self {
        self.navigations.push(navigation);
        self
    }

    /// Declares a store-maintained concurrency token field.
    #[must_use]
    pub fn concurrency_token(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.scalars.push(ScalarField {
            name: name.clone(),
            ty: FieldType::Integer,
            nullable: true,
        });
        self.concurrency_token = Some(name);
        self
    }

    /// Entity type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Ordered key field names.
    pub fn key_fields(&self) -> &[String] {
        &self.key
    }

    /// Whether the store generates the key.
    pub fn is_key_generated(&self) -> bool {
        self.key_generated
    }

    /// All scalar fields, keys and token included.
    pub fn scalars(&self) -> &[ScalarField] {
        &self.scalars
    }

    /// All navigations.
    pub fn navigations(&self) -> &[Navigation] {
        &self.navigations
    }

    /// Concurrency token field, if any.
    pub fn token_field(&self) -> Option<&str> {
        self.concurrency_token.as_deref()
    }

    /// Looks up a scalar field.
    pub fn scalar(&self, name: &str) -> Option<&ScalarField> {
        self.scalars.iter().find(|f| f.name == name)
    }

    /// Looks up a navigation, failing with [`CoreError::UnknownNavigation`].
    pub fn navigation_named(&self, name: &str) -> CoreResult<&Navigation> {
        self.navigations
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| CoreError::unknown_navigation(&self.name, name))
    }

    /// Returns true if `name` is a key field.
    pub fn is_key_field(&self, name: &str) -> bool {
        self.key.iter().any(|k| k == name)
    }

    /// Returns true if `name` is the concurrency token.
    pub fn is_token_field(&self, name: &str) -> bool {
        self.concurrency_token.as_deref() == Some(name)
    }

    /// Fields an update may write: scalars that are neither key nor token.
    pub fn writable_fields(&self) -> impl Iterator<Item = &ScalarField> {
        self.scalars
            .iter()
            .filter(|f| !self.is_key_field(&f.name) && !self.is_token_field(&f.name))
    }

    /// Extracts the key from a row. Missing key fields read as NULL.
    pub fn key_of(&self, values: &Row) -> EntityKey {
        EntityKey::new(
            self.key
                .iter()
                .map(|k| values.get(k).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Returns true if `key` identifies a persisted row.
    ///
    /// A part is unset when it is NULL, or when the key is store-generated
    /// and the part is an integer `<= 0`.
    pub fn key_is_set(&self, key: &EntityKey) -> bool {
        key.parts().len() == self.key.len()
            && key.parts().iter().all(|part| match part {
                Value::Null => false,
                Value::Integer(n) if self.key_generated => *n > 0,
                _ => true,
            })
    }

    /// Checks a value against a field's declaration.
    pub fn check_value(&self, field: &str, value: &Value) -> CoreResult<()> {
        let scalar = self
            .scalar(field)
            .ok_or_else(|| CoreError::unknown_field(&self.name, field))?;
        if value.is_null() || scalar.ty.accepts(value) {
            return Ok(());
        }
        Err(CoreError::InvalidValue {
            type_name: self.name.clone(),
            field: field.to_string(),
            message: format!("expected {:?}, got {}", scalar.ty, value.type_name()),
        })
    }

    /// Fills every declared scalar missing from `values` with NULL and
    /// rejects unknown or mistyped fields.
    pub fn normalize(&self, values: &Row) -> CoreResult<Row> {
        let mut row = Row::new();
        for (field, value) in values {
            self.check_value(field, value)?;
        }
        for scalar in &self.scalars {
            let value = values.get(&scalar.name).cloned().unwrap_or(Value::Null);
            row.insert(scalar.name.clone(), value);
        }
        Ok(row)
    }

    /// Storage metadata for this type.
    pub fn table_meta(&self) -> TableMeta {
        let mut meta = TableMeta::new(&self.table, self.key.clone());
        if self.key_generated {
            if let Some(key) = self.key.first() {
                meta = meta.with_generated_key(key.clone());
            }
        }
        for scalar in &self.scalars {
            meta = meta.with_column(scalar.name.clone());
        }
        if let Some(token) = &self.concurrency_token {
            meta = meta.with_token(token.clone());
        }
        meta
    }

    fn validate_local(&self) -> CoreResult<()> {
        if self.key.is_empty() {
            return Err(CoreError::invalid_model(format!("{} has no key fields", self.name)));
        }
        if self.key_generated {
            let single_integer = self.key.len() == 1
                && self.scalar(&self.key[0]).map(|f| f.ty) == Some(FieldType::Integer);
            if !single_integer {
                return Err(CoreError::invalid_model(format!(
                    "{}: generated keys must be a single integer field",
                    self.name
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for scalar in &self.scalars {
            if !seen.insert(scalar.name.as_str()) {
                return Err(CoreError::invalid_model(format!(
                    "{}: duplicate field {}",
                    self.name, scalar.name
                )));
            }
        }
        for navigation in &self.navigations {
            if self.scalar(&navigation.name).is_some() || !seen.insert(navigation.name.as_str()) {
                return Err(CoreError::invalid_model(format!(
                    "{}: navigation {} collides with another member",
                    self.name, navigation.name
                )));
            }
            if navigation.foreign_key.is_empty() {
                return Err(CoreError::invalid_model(format!(
                    "{}.{}: navigation has no foreign key",
                    self.name, navigation.name
                )));
            }
        }
        Ok(())
    }
}

/// Registry of entity descriptors, shared read-only by sessions.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    descriptors: HashMap<String, Arc<EntityDescriptor>>,
}

impl DescriptorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor.
    ///
    /// # Errors
    ///
    /// Fails if the type is already registered or the descriptor is
    /// internally inconsistent.
    pub fn register(&mut self, descriptor: EntityDescriptor) -> CoreResult<()> {
        descriptor.validate_local()?;
        if self.descriptors.contains_key(descriptor.name()) {
            return Err(CoreError::invalid_model(format!(
                "{} is already registered",
                descriptor.name()
            )));
        }
        self.descriptors
            .insert(descriptor.name().to_string(), Arc::new(descriptor));
        Ok(())
    }

    /// Looks up a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownEntityType`] if the type is not registered.
    pub fn get(&self, name: &str) -> CoreResult<&Arc<EntityDescriptor>> {
        self.descriptors
            .get(name)
            .ok_or_else(|| CoreError::unknown_type(name))
    }

    /// Iterates over all descriptors in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.descriptors.values()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Cross-checks relationships: navigation targets exist and foreign keys
    /// line up with the principal's key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidModel`] describing the first problem found.
    pub fn validate(&self) -> CoreResult<()> {
        for descriptor in self.descriptors.values() {
            for navigation in descriptor.navigations() {
                let target = self.descriptors.get(&navigation.target).ok_or_else(|| {
                    CoreError::invalid_model(format!(
                        "{}.{} targets unregistered type {}",
                        descriptor.name(),
                        navigation.name,
                        navigation.target
                    ))
                })?;
                let (dependent, principal) = match navigation.side {
                    ForeignKeySide::Source => (descriptor.as_ref(), target.as_ref()),
                    ForeignKeySide::Target => (target.as_ref(), descriptor.as_ref()),
                };
                if navigation.foreign_key.len() != principal.key_fields().len() {
                    return Err(CoreError::invalid_model(format!(
                        "{}.{}: foreign key has {} fields, {} key has {}",
                        descriptor.name(),
                        navigation.name,
                        navigation.foreign_key.len(),
                        principal.name(),
                        principal.key_fields().len()
                    )));
                }
                for field in &navigation.foreign_key {
                    if dependent.scalar(field).is_none() {
                        return Err(CoreError::invalid_model(format!(
                            "{}.{}: foreign key field {} missing on {}",
                            descriptor.name(),
                            navigation.name,
                            field,
                            dependent.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> EntityDescriptor {
        EntityDescriptor::new("Standard")
            .key_field("StandardId", FieldType::Integer)
            .generated_key()
            .field("StandardName", FieldType::Text)
            .navigation(Navigation::collection("Students", "Student", ["StandardId"]))
    }

    fn student() -> EntityDescriptor {
        EntityDescriptor::new("Student")
            .key_field("StudentID", FieldType::Integer)
            .generated_key()
            .field("StudentName", FieldType::Text)
            .nullable_field("StandardId", FieldType::Integer)
            .concurrency_token("RowVersion")
            .navigation(Navigation::reference("Standard", "Standard", ["StandardId"]))
    }

    #[test]
    fn register_and_validate() {
        let mut registry = DescriptorRegistry::new();
        registry.register(standard()).unwrap();
        registry.register(student()).unwrap();
        registry.validate().unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = DescriptorRegistry::new();
        registry.register(standard()).unwrap();
        assert!(matches!(
            registry.register(standard()),
            Err(CoreError::InvalidModel { .. })
        ));
    }

    #[test]
    fn missing_target_fails_validation() {
        let mut registry = DescriptorRegistry::new();
        registry.register(student()).unwrap();
        assert!(registry.validate().is_err());
    }

    #[test]
    fn missing_foreign_key_field_fails_validation() {
        let mut registry = DescriptorRegistry::new();
        registry.register(standard()).unwrap();
        registry
            .register(
                EntityDescriptor::new("Student")
                    .key_field("StudentID", FieldType::Integer)
                    .navigation(Navigation::reference("Standard", "Standard", ["Nope"])),
            )
            .unwrap();
        assert!(registry.validate().is_err());
    }

    #[test]
    fn descriptor_without_key_rejected() {
        let mut registry = DescriptorRegistry::new();
        let result = registry.register(EntityDescriptor::new("Orphan").field("x", FieldType::Text));
        assert!(result.is_err());
    }

    #[test]
    fn generated_key_sentinels() {
        let student = student();
        assert!(!student.key_is_set(&EntityKey::from(0)));
        assert!(!student.key_is_set(&EntityKey::from(Value::Null)));
        assert!(student.key_is_set(&EntityKey::from(10)));

        let composite = EntityDescriptor::new("Enrollment")
            .key_field("StudentID", FieldType::Integer)
            .key_field("CourseId", FieldType::Integer);
        assert!(composite.key_is_set(&EntityKey::new(vec![Value::Integer(0), Value::Integer(1)])));
        assert!(!composite.key_is_set(&EntityKey::new(vec![Value::Integer(1), Value::Null])));
    }

    #[test]
    fn writable_fields_exclude_key_and_token() {
        let student = student();
        let names: Vec<_> = student.writable_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["StudentName", "StandardId"]);
    }

    #[test]
    fn normalize_fills_nulls_and_checks_types() {
        let student = student();
        let mut values = Row::new();
        values.insert("StudentName".into(), Value::from("Bill"));
        let row = student.normalize(&values).unwrap();
        assert_eq!(row.get("StandardId"), Some(&Value::Null));
        assert_eq!(row.len(), 4);

        values.insert("StudentName".into(), Value::Integer(5));
        assert!(matches!(
            student.normalize(&values),
            Err(CoreError::InvalidValue { .. })
        ));

        let mut unknown = Row::new();
        unknown.insert("Nickname".into(), Value::from("B"));
        assert!(matches!(
            student.normalize(&unknown),
            Err(CoreError::UnknownField { .. })
        ));
    }

    #[test]
    fn table_meta_mirrors_descriptor() {
        let meta = student().table_meta();
        assert_eq!(meta.name, "Student");
        assert_eq!(meta.generated_key.as_deref(), Some("StudentID"));
        assert_eq!(meta.token_column.as_deref(), Some("RowVersion"));
        assert!(meta.columns.contains(&"StandardId".to_string()));
    }
}
