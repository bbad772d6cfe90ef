//! Lazy and explicit loading of navigations.
//!
//! Related rows are fetched by foreign key and routed through the identity
//! map, so a row that is already tracked resolves to the existing entry and
//! its in-memory values win.

use crate::descriptor::{
    Cardinality, DescriptorRegistry, EntityDescriptor, ForeignKeySide, Navigation,
};
use crate::error::CoreResult;
use crate::identity::IdentityMap;
use crate::state::EntityState;
use crate::types::{EntityKey, EntryId};
use entitrack_storage::{Predicate, Row, StorageDriver, Value};
use std::sync::Arc;
use tracing::trace;

/// Loads `navigation` of entry `id` and marks it loaded.
///
/// Returns the related entries: zero or one for a reference, any number for
/// a collection. Entries linked in memory before the load are kept.
///
/// # Errors
///
/// Returns an error if the navigation is unknown or the driver query fails.
pub fn load_navigation<D: StorageDriver + ?Sized>(
    registry: &DescriptorRegistry,
    map: &mut IdentityMap,
    driver: &mut D,
    id: EntryId,
    navigation: &str,
) -> CoreResult<Vec<EntryId>> {
    let entry = map.get(id)?;
    let owner = Arc::clone(registry.get(&entry.type_name)?);
    let navigation = owner.navigation_named(navigation)?.clone();
    let target = Arc::clone(registry.get(&navigation.target)?);
    let owner_key = entry.key.clone();
    let current = entry.current.clone();
    let linked = linked(entry, &navigation);

    trace!(
        entity = %entry.type_name,
        key = %owner_key,
        navigation = %navigation.name,
        "loading navigation"
    );

    let related = match navigation.side {
        ForeignKeySide::Source => {
            let fk = foreign_key_value(&current, &navigation.foreign_key);
            if !target.key_is_set(&fk) {
                Vec::new()
            } else if let Some(principal) = map.try_get(target.name(), &fk) {
                vec![principal]
            } else {
                let predicate = key_predicate(&target, &fk);
                fetch(map, driver, &target, &predicate)?
            }
        }
        ForeignKeySide::Target => {
            let mut related = linked;
            if owner.key_is_set(&owner_key) {
                let predicate = Predicate::from_pairs(
                    navigation
                        .foreign_key
                        .iter()
                        .cloned()
                        .zip(owner_key.parts().iter().cloned()),
                );
                let mut candidates = fetch(map, driver, &target, &predicate)?;
                candidates.extend(
                    map.iter()
                        .filter(|e| e.type_name == target.name())
                        .map(|e| e.id),
                );
                for candidate in candidates {
                    let Ok(child) = map.get(candidate) else { continue };
                    let matches =
                        foreign_key_value(&child.current, &navigation.foreign_key) == owner_key;
                    if matches
                        && child.state != EntityState::Deleted
                        && !related.contains(&candidate)
                    {
                        related.push(candidate);
                    }
                }
            }
            related
        }
    };

    let entry = map.get_mut(id)?;
    match navigation.cardinality {
        Cardinality::Single => {
            entry
                .references
                .insert(navigation.name.clone(), related.first().copied());
        }
        Cardinality::Collection => {
            entry
                .collections
                .insert(navigation.name.clone(), related.clone());
        }
    }
    entry.loaded.insert(navigation.name.clone());

    if let Some(inverse) = inverse_of(registry, &owner, &navigation)? {
        for &other in &related {
            link_one_way(map, other, &inverse, id)?;
        }
    }
    Ok(related)
}

/// Links `related` into `owner`'s navigation and fixes up the inverse
/// navigation on `related`, if one is declared.
pub fn link(
    registry: &DescriptorRegistry,
    map: &mut IdentityMap,
    owner: EntryId,
    navigation: &Navigation,
    related: EntryId,
) -> CoreResult<()> {
    link_one_way(map, owner, navigation, related)?;
    let owner_type = Arc::clone(registry.get(&map.get(owner)?.type_name)?);
    if let Some(inverse) = inverse_of(registry, &owner_type, navigation)? {
        link_one_way(map, related, &inverse, owner)?;
    }
    Ok(())
}

/// Removes `related` from `owner`'s navigation and the inverse.
pub fn unlink(
    registry: &DescriptorRegistry,
    map: &mut IdentityMap,
    owner: EntryId,
    navigation: &Navigation,
    related: EntryId,
) -> CoreResult<()> {
    unlink_one_way(map, owner, navigation, related)?;
    let owner_type = Arc::clone(registry.get(&map.get(owner)?.type_name)?);
    if let Some(inverse) = inverse_of(registry, &owner_type, navigation)? {
        if map.contains(related) {
            unlink_one_way(map, related, &inverse, owner)?;
        }
    }
    Ok(())
}

fn link_one_way(
    map: &mut IdentityMap,
    owner: EntryId,
    navigation: &Navigation,
    related: EntryId,
) -> CoreResult<()> {
    let entry = map.get_mut(owner)?;
    match navigation.cardinality {
        Cardinality::Single => {
            entry
                .references
                .insert(navigation.name.clone(), Some(related));
            // A single reference is fully known once set.
            entry.loaded.insert(navigation.name.clone());
        }
        Cardinality::Collection => {
            let members = entry.collections.entry(navigation.name.clone()).or_default();
            if !members.contains(&related) {
                members.push(related);
            }
        }
    }
    Ok(())
}

fn unlink_one_way(
    map: &mut IdentityMap,
    owner: EntryId,
    navigation: &Navigation,
    related: EntryId,
) -> CoreResult<()> {
    let entry = map.get_mut(owner)?;
    match navigation.cardinality {
        Cardinality::Single => {
            if entry.references.get(&navigation.name) == Some(&Some(related)) {
                entry.references.insert(navigation.name.clone(), None);
            }
        }
        Cardinality::Collection => {
            if let Some(members) = entry.collections.get_mut(&navigation.name) {
                members.retain(|m| *m != related);
            }
        }
    }
    Ok(())
}

/// The navigation on the other end of the same relationship, if declared.
pub fn inverse_of(
    registry: &DescriptorRegistry,
    owner: &EntityDescriptor,
    navigation: &Navigation,
) -> CoreResult<Option<Navigation>> {
    let target = registry.get(&navigation.target)?;
    Ok(target
        .navigations()
        .iter()
        .find(|n| {
            n.target == owner.name()
                && n.side != navigation.side
                && n.foreign_key == navigation.foreign_key
        })
        .cloned())
}

/// Reads foreign-key fields out of a row as a key.
pub fn foreign_key_value(values: &Row, foreign_key: &[String]) -> EntityKey {
    EntityKey::new(
        foreign_key
            .iter()
            .map(|f| values.get(f).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

/// Predicate selecting the row with `key`.
pub fn key_predicate(descriptor: &EntityDescriptor, key: &EntityKey) -> Predicate {
    Predicate::from_pairs(
        descriptor
            .key_fields()
            .iter()
            .cloned()
            .zip(key.parts().iter().cloned()),
    )
}

/// Queries `descriptor`'s table and tracks every row.
pub fn fetch<D: StorageDriver + ?Sized>(
    map: &mut IdentityMap,
    driver: &mut D,
    descriptor: &EntityDescriptor,
    predicate: &Predicate,
) -> CoreResult<Vec<EntryId>> {
    let rows = driver.query(&descriptor.table_meta(), predicate)?;
    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        let row = descriptor.normalize(&row)?;
        ids.push(map.track_loaded(descriptor, row).id());
    }
    Ok(ids)
}

fn linked(entry: &crate::entry::TrackedEntry, navigation: &Navigation) -> Vec<EntryId> {
    match navigation.cardinality {
        Cardinality::Single => entry
            .references
            .get(&navigation.name)
            .copied()
            .flatten()
            .into_iter()
            .collect(),
        Cardinality::Collection => entry
            .collections
            .get(&navigation.name)
            .cloned()
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldType;
    use entitrack_storage::InMemoryStore;

    fn registry() -> DescriptorRegistry {
        let mut registry = DescriptorRegistry::new();
        registry
            .register(
                EntityDescriptor::new("Standard")
                    .key_field("StandardId", FieldType::Integer)
                    .generated_key()
                    .field("StandardName", FieldType::Text)
                    .navigation(Navigation::collection("Students", "Student", ["StandardId"])),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::new("Student")
                    .key_field("StudentID", FieldType::Integer)
                    .generated_key()
                    .field("StudentName", FieldType::Text)
                    .nullable_field("StandardId", FieldType::Integer)
                    .navigation(Navigation::reference("Standard", "Standard", ["StandardId"])),
            )
            .unwrap();
        registry.validate().unwrap();
        registry
    }

    fn seeded() -> (DescriptorRegistry, InMemoryStore) {
        let registry = registry();
        let store = InMemoryStore::new();
        for descriptor in registry.iter() {
            store.create_table(&descriptor.table_meta());
        }
        let mut standard = Row::new();
        standard.insert("StandardName".into(), Value::from("Grade 1"));
        store.seed("Standard", standard).unwrap();
        for name in ["Bill", "Steve"] {
            let mut student = Row::new();
            student.insert("StudentName".into(), Value::from(name));
            student.insert("StandardId".into(), Value::Integer(1));
            store.seed("Student", student).unwrap();
        }
        (registry, store)
    }

    #[test]
    fn load_collection_tracks_children_and_fixes_inverse() {
        let (registry, store) = seeded();
        let mut driver = store.connect();
        let mut map = IdentityMap::new();
        let standard = registry.get("Standard").unwrap();
        let parent = fetch(&mut map, &mut driver, standard, &Predicate::new())
            .unwrap()[0];

        let children =
            load_navigation(&registry, &mut map, &mut driver, parent, "Students").unwrap();
        assert_eq!(children.len(), 2);
        assert!(map.get(parent).unwrap().is_loaded("Students"));
        for child in &children {
            let entry = map.get(*child).unwrap();
            assert_eq!(entry.references["Standard"], Some(parent));
            assert!(entry.is_loaded("Standard"));
        }

        // A second load reuses the tracked children.
        let again = load_navigation(&registry, &mut map, &mut driver, parent, "Students").unwrap();
        assert_eq!(again, children);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn load_reference_reuses_tracked_principal() {
        let (registry, store) = seeded();
        let mut driver = store.connect();
        let mut map = IdentityMap::new();
        let student = registry.get("Student").unwrap();
        let students = fetch(&mut map, &mut driver, student, &Predicate::new()).unwrap();

        let first =
            load_navigation(&registry, &mut map, &mut driver, students[0], "Standard").unwrap();
        let second =
            load_navigation(&registry, &mut map, &mut driver, students[1], "Standard").unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn null_foreign_key_loads_nothing() {
        let (registry, store) = seeded();
        let mut driver = store.connect();
        let mut map = IdentityMap::new();
        let descriptor = registry.get("Student").unwrap();
        let mut row = Row::new();
        row.insert("StudentName".into(), Value::from("Orphan"));
        let row = descriptor.normalize(&row).unwrap();
        let id = map
            .get_or_track(descriptor, row, EntityState::Added)
            .unwrap()
            .id();

        assert!(load_navigation(&registry, &mut map, &mut driver, id, "Standard")
            .unwrap()
            .is_empty());
        assert!(map.get(id).unwrap().is_loaded("Standard"));
    }
}
