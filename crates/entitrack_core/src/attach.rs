//! Graph attach and state cascades.
//!
//! Attaching a disconnected graph walks the caller's [`Entity`] tree,
//! derives a state for every entity that is not yet tracked, and links the
//! resulting entries. Traversal stops at entities the session already
//! tracks.

use crate::descriptor::{EntityDescriptor, ForeignKeySide};
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::identity::Tracked;
use crate::loader;
use crate::session::{EntityRef, Session};
use crate::snapshot::capture_snapshot;
use crate::state::{check_key, EntityState};
use crate::types::EntryId;
use entitrack_storage::{Row, StorageDriver, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

impl<D: StorageDriver> Session<D> {
    pub(crate) fn attach_graph(
        &mut self,
        mut entity: Entity,
        state: EntityState,
    ) -> CoreResult<EntityRef> {
        self.fix_foreign_keys(&mut entity)?;

        let descriptor = self.descriptor(&entity.type_name)?;
        let values = descriptor.normalize(&entity.values)?;
        check_key(state, descriptor.key_is_set(&descriptor.key_of(&values)))?;

        let tracked = self.track(&descriptor, values, state, None)?;
        let root = tracked.id();
        match tracked {
            Tracked::Existing(_) => {
                let current = self.map.get(root)?.state;
                if state != EntityState::Added && state != current {
                    self.set_state(self.handle(root), state)?;
                }
            }
            Tracked::New(_) => {
                if state == EntityState::Modified {
                    // The caller's values are all we know; the stored row
                    // may differ in any field.
                    self.map.get_mut(root)?.original_known = false;
                }
                self.attach_children(root, &entity, state)?;
            }
        }
        Ok(self.handle(root))
    }

    /// Copies keys across the relationships of a detached graph so foreign
    /// keys agree with the keys of the entities nested under them.
    fn fix_foreign_keys(&self, entity: &mut Entity) -> CoreResult<()> {
        let descriptor = self.descriptor(&entity.type_name)?;
        for name in entity.references.keys().chain(entity.collections.keys()) {
            descriptor.navigation_named(name)?;
        }

        for navigation in descriptor.navigations() {
            match navigation.side {
                ForeignKeySide::Source => {
                    let Some(principal) = entity.references.get_mut(&navigation.name) else {
                        continue;
                    };
                    self.fix_foreign_keys(principal)?;
                    let target = self.descriptor(&principal.type_name)?;
                    let key = target.key_of(&principal.values);
                    if target.key_is_set(&key) {
                        for (field, part) in navigation.foreign_key.iter().zip(key.parts()) {
                            entity.values.insert(field.clone(), part.clone());
                        }
                    }
                }
                ForeignKeySide::Target => {
                    let key = descriptor.key_of(&entity.values);
                    let key_set = descriptor.key_is_set(&key);
                    let single = entity.references.get_mut(&navigation.name).into_iter();
                    let many = entity
                        .collections
                        .get_mut(&navigation.name)
                        .into_iter()
                        .flatten();
                    for child in single.chain(many) {
                        if key_set {
                            for (field, part) in navigation.foreign_key.iter().zip(key.parts()) {
                                if child.values.get(field).map_or(true, Value::is_null) {
                                    child.values.insert(field.clone(), part.clone());
                                }
                            }
                        }
                        self.fix_foreign_keys(child)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn attach_children(
        &mut self,
        owner: EntryId,
        entity: &Entity,
        root_state: EntityState,
    ) -> CoreResult<()> {
        let descriptor = self.descriptor(&entity.type_name)?;
        for navigation in descriptor.navigations() {
            let single = entity.references.get(&navigation.name).into_iter();
            let many = entity.collections.get(&navigation.name).into_iter().flatten();
            let mut present = false;

            for child in single.chain(many) {
                present = true;
                if child.type_name != navigation.target {
                    return Err(CoreError::invalid_operation(format!(
                        "{}.{} expects {}, got {}",
                        descriptor.name(),
                        navigation.name,
                        navigation.target,
                        child.type_name
                    )));
                }
                let child_descriptor = self.descriptor(&child.type_name)?;
                let values = child_descriptor.normalize(&child.values)?;
                let (state, stored) =
                    self.derive_child_state(&child_descriptor, &values, root_state)?;
                let tracked = self.track(&child_descriptor, values, state, stored)?;

                trace!(
                    entity = %child.type_name,
                    state = %state,
                    new = tracked.is_new(),
                    "attached related entity"
                );

                loader::link(&self.registry, &mut self.map, owner, navigation, tracked.id())?;
                if tracked.is_new() {
                    self.attach_children(tracked.id(), child, root_state)?;
                }
            }

            if present {
                self.map.get_mut(owner)?.loaded.insert(navigation.name.clone());
            }
        }
        Ok(())
    }

    /// State for a related entity reached from a root attached in
    /// `root_state`, plus the stored row to snapshot when it was compared.
    fn derive_child_state(
        &mut self,
        descriptor: &EntityDescriptor,
        values: &Row,
        root_state: EntityState,
    ) -> CoreResult<(EntityState, Option<Row>)> {
        let key = descriptor.key_of(values);
        let key_set = descriptor.key_is_set(&key);
        let derived = match root_state {
            EntityState::Added | EntityState::Detached => (EntityState::Added, None),
            EntityState::Unchanged | EntityState::Deleted => {
                if key_set {
                    (EntityState::Unchanged, None)
                } else {
                    (EntityState::Added, None)
                }
            }
            EntityState::Modified => {
                if !key_set {
                    (EntityState::Added, None)
                } else if self.map.try_get(descriptor.name(), &key).is_some() {
                    (EntityState::Unchanged, None)
                } else {
                    let predicate = loader::key_predicate(descriptor, &key);
                    let rows = self.driver.query(&descriptor.table_meta(), &predicate)?;
                    match rows.into_iter().next() {
                        None => (EntityState::Added, None),
                        Some(row) => {
                            let stored = descriptor.normalize(&row)?;
                            let differs = descriptor
                                .scalars()
                                .iter()
                                .filter(|f| !descriptor.is_token_field(&f.name))
                                .any(|f| stored.get(&f.name) != values.get(&f.name));
                            if differs {
                                (EntityState::Modified, Some(stored))
                            } else {
                                (EntityState::Unchanged, Some(stored))
                            }
                        }
                    }
                }
            }
        };
        Ok(derived)
    }

    /// Tracks one entity, snapshotting new entries from `stored` when given
    /// and from the entity's own values otherwise.
    fn track(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        values: Row,
        state: EntityState,
        stored: Option<Row>,
    ) -> CoreResult<Tracked> {
        let tracked = self.map.get_or_track(descriptor, values, state)?;
        if let Tracked::New(id) = tracked {
            let entry = self.map.get_mut(id)?;
            capture_snapshot(descriptor, entry);
            if let Some(stored) = stored {
                // A client that carried no token is guarded by the stored one.
                if let Some(token) = descriptor.token_field() {
                    if entry.token.as_ref().map_or(true, Value::is_null) {
                        entry.token = stored.get(token).cloned();
                        if let Some(value) = entry.token.clone() {
                            entry.current.insert(token.to_string(), value);
                        }
                    }
                }
                entry.original = stored;
            }
            entry.state = state;
        }
        Ok(tracked)
    }

    /// Marks owned dependents of `entry` for deletion; never-saved
    /// dependents are evicted.
    pub(crate) fn cascade_delete(&mut self, entry: EntryId) -> CoreResult<()> {
        let mut visited = BTreeSet::new();
        self.cascade_delete_from(entry, &mut visited)
    }

    fn cascade_delete_from(
        &mut self,
        entry: EntryId,
        visited: &mut BTreeSet<EntryId>,
    ) -> CoreResult<()> {
        if !visited.insert(entry) {
            return Ok(());
        }
        for child in self.owned_dependents(entry)? {
            if visited.contains(&child) || !self.map.contains(child) {
                continue;
            }
            self.cascade_delete_from(child, visited)?;
            let state = self.map.get(child)?.state;
            match state {
                EntityState::Added => self.evict(child),
                EntityState::Unchanged | EntityState::Modified => {
                    self.map.get_mut(child)?.state = EntityState::Deleted;
                }
                EntityState::Deleted | EntityState::Detached => {}
            }
        }
        Ok(())
    }

    /// Runs change detection over owned dependents of `entry`, recursively,
    /// stopping at Added and Deleted entries.
    pub(crate) fn cascade_modified(&mut self, entry: EntryId) -> CoreResult<()> {
        let mut visited = BTreeSet::new();
        let mut pending = vec![entry];
        while let Some(next) = pending.pop() {
            if !visited.insert(next) {
                continue;
            }
            for child in self.owned_dependents(next)? {
                self.detect_entry(child)?;
                let state = self.map.get(child)?.state;
                if matches!(state, EntityState::Unchanged | EntityState::Modified) {
                    pending.push(child);
                }
            }
        }
        Ok(())
    }

    /// Tracked entries on the dependent end of `entry`'s owned
    /// relationships: linked ones plus those whose foreign key matches.
    fn owned_dependents(&self, entry: EntryId) -> CoreResult<Vec<EntryId>> {
        let tracked = self.map.get(entry)?;
        let descriptor = self.descriptor(&tracked.type_name)?;
        let key_set = descriptor.key_is_set(&tracked.key);
        let mut dependents = Vec::new();

        for navigation in descriptor.navigations().iter().filter(|n| n.is_owned()) {
            let linked = tracked
                .references
                .get(&navigation.name)
                .copied()
                .flatten()
                .into_iter()
                .chain(
                    tracked
                        .collections
                        .get(&navigation.name)
                        .into_iter()
                        .flatten()
                        .copied(),
                );
            for child in linked {
                if !dependents.contains(&child) {
                    dependents.push(child);
                }
            }
            if key_set {
                for other in self.map.iter() {
                    if other.id != entry
                        && other.type_name == navigation.target
                        && loader::foreign_key_value(&other.current, &navigation.foreign_key)
                            == tracked.key
                        && !dependents.contains(&other.id)
                    {
                        dependents.push(other.id);
                    }
                }
            }
        }
        Ok(dependents)
    }
}
