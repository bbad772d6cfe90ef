//! The session: caller-facing unit of work over one storage driver.

use crate::config::SessionConfig;
use crate::descriptor::{Cardinality, DescriptorRegistry, EntityDescriptor, ForeignKeySide};
use crate::entity::Entity;
use crate::entry::{EntrySummary, FieldValues};
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityMap;
use crate::loader;
use crate::plan::WorkPlan;
use crate::save::{self, CancelHandle, SaveContext, SaveResult};
use crate::snapshot::{capture_snapshot, compute_change_set, has_changes, ChangeSet};
use crate::state::{check_key, next_state, EntityState, StateEvent, Transition};
use crate::types::{EntityKey, EntryId, SessionId};
use entitrack_storage::{Predicate, StorageDriver, TransactionHandle, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, debug_span, warn};

/// Evicted entries remembered for naming the type in stale-handle errors.
const EVICTION_HISTORY: usize = 1024;

/// Handle to an entity tracked by a session.
///
/// Handles are cheap to copy and only meaningful to the session that issued
/// them. Once the entity is evicted (detached, or deleted and saved) the
/// handle reports [`EntityState::Detached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    session: SessionId,
    entry: EntryId,
}

impl EntityRef {
    /// The entry slot this handle points at.
    #[must_use]
    pub const fn entry(&self) -> EntryId {
        self.entry
    }

    /// The session that issued this handle.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }
}

/// A unit of work: tracks entities, detects changes and saves them through a
/// storage driver.
///
/// A session is single-threaded. Run several sessions, each with its own
/// driver connection, to work concurrently against one store.
///
/// # Example
///
/// ```
/// use entitrack_core::{
///     DescriptorRegistry, Entity, EntityDescriptor, EntityState, FieldType, Session,
/// };
/// use entitrack_storage::InMemoryStore;
/// use std::sync::Arc;
///
/// let mut registry = DescriptorRegistry::new();
/// registry
///     .register(
///         EntityDescriptor::new("Standard")
///             .key_field("StandardId", FieldType::Integer)
///             .generated_key()
///             .field("StandardName", FieldType::Text),
///     )
///     .unwrap();
/// let registry = Arc::new(registry);
///
/// let store = InMemoryStore::new();
/// for descriptor in registry.iter() {
///     store.create_table(&descriptor.table_meta());
/// }
///
/// let mut session = Session::with_defaults(store.connect(), registry).unwrap();
/// let standard = session.add(Entity::new("Standard").with("StandardName", "Grade 1")).unwrap();
/// session.save_changes().unwrap();
///
/// assert_eq!(session.state(standard), EntityState::Unchanged);
/// assert_eq!(session.key(standard).unwrap().parts()[0].as_integer(), Some(1));
/// ```
pub struct Session<D: StorageDriver> {
    pub(crate) id: SessionId,
    pub(crate) config: SessionConfig,
    pub(crate) registry: Arc<DescriptorRegistry>,
    pub(crate) driver: D,
    pub(crate) map: IdentityMap,
    pub(crate) cancel: CancelHandle,
    pub(crate) ambient: Option<TransactionHandle>,
    /// Type names of recently evicted entries, for error reporting on stale
    /// handles. Holds at most [`EVICTION_HISTORY`] entries, oldest dropped first.
    pub(crate) evicted: BTreeMap<EntryId, String>,
}

impl<D: StorageDriver> Session<D> {
    /// Creates a session.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidModel`] if the registry's relationships
    /// are inconsistent.
    pub fn new(
        driver: D,
        registry: Arc<DescriptorRegistry>,
        config: SessionConfig,
    ) -> CoreResult<Self> {
        registry.validate()?;
        let id = SessionId::new();
        debug!(session = %id, types = registry.len(), "session opened");
        Ok(Self {
            id,
            config,
            registry,
            driver,
            map: IdentityMap::new(),
            cancel: CancelHandle::new(),
            ambient: None,
            evicted: BTreeMap::new(),
        })
    }

    /// Creates a session with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`Session::new`].
    pub fn with_defaults(driver: D, registry: Arc<DescriptorRegistry>) -> CoreResult<Self> {
        Self::new(driver, registry, SessionConfig::default())
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Descriptor registry.
    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    /// The storage driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The storage driver, mutably. Writes issued directly bypass tracking.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Handle for cancelling saves on this session from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub(crate) fn handle(&self, entry: EntryId) -> EntityRef {
        EntityRef {
            session: self.id,
            entry,
        }
    }

    /// Resolves a handle to a live entry of this session.
    pub(crate) fn resolve(&self, handle: EntityRef) -> CoreResult<EntryId> {
        if handle.session != self.id || !self.map.contains(handle.entry) {
            return Err(CoreError::EntryNotTracked {
                entry: handle.entry,
            });
        }
        Ok(handle.entry)
    }

    pub(crate) fn descriptor(&self, type_name: &str) -> CoreResult<Arc<EntityDescriptor>> {
        self.registry.get(type_name).map(Arc::clone)
    }

    pub(crate) fn descriptor_of(&self, entry: EntryId) -> CoreResult<Arc<EntityDescriptor>> {
        let type_name = &self.map.get(entry)?.type_name;
        self.descriptor(type_name)
    }

    pub(crate) fn evict(&mut self, entry: EntryId) {
        if let Some(removed) = self.map.remove(entry) {
            self.remember_eviction(entry, removed.type_name);
        }
    }

    fn remember_eviction(&mut self, entry: EntryId, type_name: String) {
        self.evicted.insert(entry, type_name);
        while self.evicted.len() > EVICTION_HISTORY {
            self.evicted.pop_first();
        }
    }

    /// Applies a state-machine event to an entry.
    pub(crate) fn transition(
        &mut self,
        entry: EntryId,
        event: StateEvent,
    ) -> CoreResult<Transition> {
        let descriptor = self.descriptor_of(entry)?;
        let current = self.map.get(entry)?;
        let transition = next_state(current.state, event)?;
        match transition {
            Transition::Evict => self.evict(entry),
            Transition::To(state) => {
                check_key(state, descriptor.key_is_set(&current.key))?;
                let tracked = self.map.get_mut(entry)?;
                tracked.state = state;
                if state == EntityState::Unchanged {
                    capture_snapshot(&descriptor, tracked);
                }
            }
        }
        Ok(transition)
    }

    // Tracking ----------------------------------------------------------

    /// Tracks a new entity graph in the Added state.
    ///
    /// Nested entities not yet tracked are added too. An entity whose key
    /// is already tracked resolves to the existing entry.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown types or fields, mistyped values, or an
    /// identity conflict with a dirty tracked entry.
    pub fn add(&mut self, entity: Entity) -> CoreResult<EntityRef> {
        self.attach_graph(entity, EntityState::Added)
    }

    /// Tracks an existing (disconnected) entity graph in `state`.
    ///
    /// - `Unchanged` / `Deleted`: keyed children become Unchanged and
    ///   unkeyed children Added
    /// - `Modified`: unkeyed children become Added; keyed children are
    ///   compared with their stored row and become Modified, Unchanged or
    ///   Added accordingly
    /// - `Added`: same as [`Session::add`]
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for `Detached` or when a
    /// keyless entity is attached in a state that requires a key.
    pub fn attach(&mut self, entity: Entity, state: EntityState) -> CoreResult<EntityRef> {
        if state == EntityState::Detached {
            return Err(CoreError::invalid_operation("cannot attach an entity as Detached"));
        }
        self.attach_graph(entity, state)
    }

    /// Marks an entity for deletion, cascading to owned dependents that are
    /// tracked. An entity that was never saved is simply evicted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotTracked`] for stale handles.
    pub fn remove(&mut self, handle: EntityRef) -> CoreResult<()> {
        let entry = self.resolve(handle)?;
        self.cascade_delete(entry)?;
        self.transition(entry, StateEvent::Remove)?;
        Ok(())
    }

    /// Stops tracking an entity without touching storage.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotTracked`] for stale handles.
    pub fn detach(&mut self, handle: EntityRef) -> CoreResult<()> {
        let entry = self.resolve(handle)?;
        self.transition(entry, StateEvent::Detach)?;
        Ok(())
    }

    /// Sets an entity's state directly, re-deriving the states of its
    /// tracked owned dependents.
    ///
    /// # Errors
    ///
    /// Returns an error for stale handles or when the key invariant would
    /// be violated.
    pub fn set_state(&mut self, handle: EntityRef, state: EntityState) -> CoreResult<()> {
        let entry = self.resolve(handle)?;
        match state {
            EntityState::Deleted => self.cascade_delete(entry)?,
            EntityState::Modified => self.cascade_modified(entry)?,
            _ => {}
        }
        self.transition(entry, StateEvent::Force(state))?;
        Ok(())
    }

    /// Current state of an entity; `Detached` once it has been evicted.
    pub fn state(&self, handle: EntityRef) -> EntityState {
        self.resolve(handle)
            .and_then(|entry| self.map.get(entry))
            .map_or(EntityState::Detached, |e| e.state)
    }

    /// Evicts every tracked entity.
    pub fn clear(&mut self) {
        let ids: Vec<EntryId> = self.map.iter().map(|e| e.id).collect();
        for id in ids {
            self.evict(id);
        }
    }

    // Lookup ------------------------------------------------------------

    /// Finds an entity by key, checking the identity map before storage.
    ///
    /// Calling `find` twice for the same key returns the same handle.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown types or driver failures.
    pub fn find(
        &mut self,
        type_name: &str,
        key: impl Into<EntityKey>,
    ) -> CoreResult<Option<EntityRef>> {
        let descriptor = self.descriptor(type_name)?;
        let key = key.into();
        if !descriptor.key_is_set(&key) {
            return Ok(None);
        }
        if let Some(entry) = self.map.try_get(type_name, &key) {
            return Ok(Some(self.handle(entry)));
        }
        let predicate = loader::key_predicate(&descriptor, &key);
        let found = loader::fetch(&mut self.map, &mut self.driver, &descriptor, &predicate)?;
        Ok(found.first().map(|entry| self.handle(*entry)))
    }

    /// Runs an equality query and tracks every row returned.
    ///
    /// Rows for entities already tracked resolve to the tracked entry, whose
    /// in-memory values are kept.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown types or driver failures.
    pub fn query(&mut self, type_name: &str, predicate: &Predicate) -> CoreResult<Vec<EntityRef>> {
        let descriptor = self.descriptor(type_name)?;
        let found = loader::fetch(&mut self.map, &mut self.driver, &descriptor, predicate)?;
        Ok(found.into_iter().map(|entry| self.handle(entry)).collect())
    }

    /// Re-reads an entity from storage, discarding local changes.
    ///
    /// Returns `false` and evicts the entity if its row no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error for stale handles, Added entities, or driver
    /// failures.
    pub fn reload(&mut self, handle: EntityRef) -> CoreResult<bool> {
        let entry = self.resolve(handle)?;
        let descriptor = self.descriptor_of(entry)?;
        let tracked = self.map.get(entry)?;
        if tracked.state == EntityState::Added {
            return Err(CoreError::invalid_operation(
                "cannot reload an entity that was never saved",
            ));
        }
        let predicate = loader::key_predicate(&descriptor, &tracked.key);
        let rows = self.driver.query(&descriptor.table_meta(), &predicate)?;
        let Some(row) = rows.into_iter().next() else {
            debug!(entity = %descriptor.name(), "reloaded row no longer exists");
            self.evict(entry);
            return Ok(false);
        };
        let row = descriptor.normalize(&row)?;
        let tracked = self.map.get_mut(entry)?;
        tracked.current = row;
        tracked.state = EntityState::Unchanged;
        capture_snapshot(&descriptor, tracked);
        Ok(true)
    }

    // Values ------------------------------------------------------------

    /// Reads a scalar field.
    ///
    /// # Errors
    ///
    /// Returns an error for stale handles or unknown fields.
    pub fn get(&self, handle: EntityRef, field: &str) -> CoreResult<Value> {
        let entry = self.resolve(handle)?;
        let tracked = self.map.get(entry)?;
        let descriptor = self.descriptor(&tracked.type_name)?;
        if descriptor.scalar(field).is_none() {
            return Err(CoreError::unknown_field(descriptor.name(), field));
        }
        Ok(tracked.current.get(field).cloned().unwrap_or(Value::Null))
    }

    /// Writes a scalar field.
    ///
    /// Key fields may only change while the entity is Added; the
    /// concurrency token is maintained by the store and cannot be set.
    /// Changing a foreign key clears a reference that no longer matches it.
    ///
    /// # Errors
    ///
    /// Returns an error for stale handles, unknown fields, mistyped values,
    /// Deleted entities, or the restrictions above.
    pub fn set(
        &mut self,
        handle: EntityRef,
        field: &str,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        let entry = self.resolve(handle)?;
        let descriptor = self.descriptor_of(entry)?;
        let value = value.into();
        descriptor.check_value(field, &value)?;

        let tracked = self.map.get(entry)?;
        if tracked.state == EntityState::Deleted {
            return Err(CoreError::invalid_operation(format!(
                "cannot modify {} of a deleted {}",
                field,
                descriptor.name()
            )));
        }
        if descriptor.is_token_field(field) {
            return Err(CoreError::invalid_operation(format!(
                "{}.{} is a concurrency token maintained by the store",
                descriptor.name(),
                field
            )));
        }
        let is_key = descriptor.is_key_field(field);
        if is_key && tracked.state != EntityState::Added {
            return Err(CoreError::invalid_operation(format!(
                "key field {}.{} cannot change once the entity is persisted",
                descriptor.name(),
                field
            )));
        }

        let tracked = self.map.get_mut(entry)?;
        tracked.current.insert(field.to_string(), value);
        if is_key {
            let key = descriptor.key_of(&tracked.current);
            self.map.rekey(&descriptor, entry, key)?;
        }

        self.clear_stale_references(entry, &descriptor, field)?;
        self.detect_entry(entry)
    }

    fn clear_stale_references(
        &mut self,
        entry: EntryId,
        descriptor: &EntityDescriptor,
        field: &str,
    ) -> CoreResult<()> {
        for navigation in descriptor.navigations() {
            if navigation.side != ForeignKeySide::Source
                || !navigation.foreign_key.iter().any(|f| f == field)
            {
                continue;
            }
            let tracked = self.map.get(entry)?;
            let Some(Some(principal)) = tracked.references.get(&navigation.name).copied() else {
                continue;
            };
            let fk = loader::foreign_key_value(&tracked.current, &navigation.foreign_key);
            let still_matches = self
                .map
                .get(principal)
                .map(|p| p.key == fk)
                .unwrap_or(false);
            if !still_matches {
                loader::unlink(&self.registry, &mut self.map, entry, navigation, principal)?;
                self.map.get_mut(entry)?.loaded.remove(&navigation.name);
            }
        }
        Ok(())
    }

    /// Key of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotTracked`] for stale handles.
    pub fn key(&self, handle: EntityRef) -> CoreResult<EntityKey> {
        let entry = self.resolve(handle)?;
        Ok(self.map.get(entry)?.key.clone())
    }

    /// Copies an entity's current scalar values out of the session.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotTracked`] for stale handles.
    pub fn entity(&self, handle: EntityRef) -> CoreResult<Entity> {
        let entry = self.resolve(handle)?;
        let tracked = self.map.get(entry)?;
        Ok(Entity::from_row(tracked.type_name.clone(), tracked.current.clone()))
    }

    /// Original and current value of every scalar field.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotTracked`] for stale handles.
    pub fn entry_values(&self, handle: EntityRef) -> CoreResult<Vec<FieldValues>> {
        let entry = self.resolve(handle)?;
        let tracked = self.map.get(entry)?;
        let descriptor = self.descriptor(&tracked.type_name)?;
        Ok(descriptor
            .scalars()
            .iter()
            .map(|f| FieldValues {
                field: f.name.clone(),
                original: tracked.original.get(&f.name).cloned().unwrap_or(Value::Null),
                current: tracked.current.get(&f.name).cloned().unwrap_or(Value::Null),
            })
            .collect())
    }

    // Navigations -------------------------------------------------------

    /// Reads a single-valued navigation, loading it first when lazy loading
    /// is enabled and it has not been loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DetachedNavigationAccess`] for evicted entities.
    pub fn reference(
        &mut self,
        handle: EntityRef,
        navigation: &str,
    ) -> CoreResult<Option<EntityRef>> {
        let entry = self.navigable(handle, navigation)?;
        let descriptor = self.descriptor_of(entry)?;
        if descriptor.navigation_named(navigation)?.cardinality != Cardinality::Single {
            return Err(CoreError::invalid_operation(format!(
                "{}.{} is a collection",
                descriptor.name(),
                navigation
            )));
        }
        if self.config.lazy_loading && !self.map.get(entry)?.is_loaded(navigation) {
            self.load_entry_navigation(entry, navigation)?;
        }
        let target = self
            .map
            .get(entry)?
            .references
            .get(navigation)
            .copied()
            .flatten();
        Ok(target.map(|t| self.handle(t)))
    }

    /// Reads a collection navigation, loading it first when lazy loading is
    /// enabled and it has not been loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DetachedNavigationAccess`] for evicted entities.
    pub fn collection(
        &mut self,
        handle: EntityRef,
        navigation: &str,
    ) -> CoreResult<Vec<EntityRef>> {
        let entry = self.navigable(handle, navigation)?;
        let descriptor = self.descriptor_of(entry)?;
        if descriptor.navigation_named(navigation)?.cardinality != Cardinality::Collection {
            return Err(CoreError::invalid_operation(format!(
                "{}.{} is a single reference",
                descriptor.name(),
                navigation
            )));
        }
        if self.config.lazy_loading && !self.map.get(entry)?.is_loaded(navigation) {
            self.load_entry_navigation(entry, navigation)?;
        }
        let members = self
            .map
            .get(entry)?
            .collections
            .get(navigation)
            .cloned()
            .unwrap_or_default();
        Ok(members.into_iter().map(|m| self.handle(m)).collect())
    }

    /// Explicitly loads a single-valued navigation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DetachedNavigationAccess`] for evicted entities.
    pub fn load_reference(
        &mut self,
        handle: EntityRef,
        navigation: &str,
    ) -> CoreResult<Option<EntityRef>> {
        let entry = self.navigable(handle, navigation)?;
        let loaded = self.load_entry_navigation(entry, navigation)?;
        Ok(loaded.first().map(|e| self.handle(*e)))
    }

    /// Explicitly loads a collection navigation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DetachedNavigationAccess`] for evicted entities.
    pub fn load_collection(
        &mut self,
        handle: EntityRef,
        navigation: &str,
    ) -> CoreResult<Vec<EntityRef>> {
        let entry = self.navigable(handle, navigation)?;
        let loaded = self.load_entry_navigation(entry, navigation)?;
        Ok(loaded.into_iter().map(|e| self.handle(e)).collect())
    }

    /// Returns true if the navigation has been loaded or populated.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DetachedNavigationAccess`] for evicted entities.
    pub fn is_loaded(&self, handle: EntityRef, navigation: &str) -> CoreResult<bool> {
        let entry = self.navigable(handle, navigation)?;
        Ok(self.map.get(entry)?.is_loaded(navigation))
    }

    /// Points a single-valued navigation at `target`, or clears it.
    ///
    /// For a reference the foreign key on this entity is set from the
    /// target's key; for a dependent the target's foreign key is set from
    /// this entity's key.
    ///
    /// # Errors
    ///
    /// Returns an error for stale handles, unknown navigations, or a target
    /// of the wrong type.
    pub fn set_reference(
        &mut self,
        handle: EntityRef,
        navigation: &str,
        target: Option<EntityRef>,
    ) -> CoreResult<()> {
        let entry = self.resolve(handle)?;
        let descriptor = self.descriptor_of(entry)?;
        let nav = descriptor.navigation_named(navigation)?.clone();
        if nav.cardinality != Cardinality::Single {
            return Err(CoreError::invalid_operation(format!(
                "{}.{} is a collection",
                descriptor.name(),
                navigation
            )));
        }

        let previous = self.map.get(entry)?.references.get(navigation).copied().flatten();
        if let Some(previous) = previous {
            loader::unlink(&self.registry, &mut self.map, entry, &nav, previous)?;
            if nav.side == ForeignKeySide::Target {
                self.write_foreign_key(previous, &nav.foreign_key, None)?;
            }
        }

        match target {
            None => {
                if nav.side == ForeignKeySide::Source {
                    self.write_foreign_key(entry, &nav.foreign_key, None)?;
                }
                let tracked = self.map.get_mut(entry)?;
                tracked.references.insert(navigation.to_string(), None);
                tracked.loaded.insert(navigation.to_string());
            }
            Some(target) => {
                let target = self.resolve(target)?;
                self.expect_type(target, &nav.target)?;
                match nav.side {
                    ForeignKeySide::Source => {
                        self.write_foreign_key(entry, &nav.foreign_key, Some(target))?;
                    }
                    ForeignKeySide::Target => {
                        self.write_foreign_key(target, &nav.foreign_key, Some(entry))?;
                    }
                }
                loader::link(&self.registry, &mut self.map, entry, &nav, target)?;
            }
        }
        Ok(())
    }

    /// Adds `child` to a collection navigation, setting its foreign key.
    ///
    /// # Errors
    ///
    /// Returns an error for stale handles, unknown navigations, or a child
    /// of the wrong type.
    pub fn add_to_collection(
        &mut self,
        handle: EntityRef,
        navigation: &str,
        child: EntityRef,
    ) -> CoreResult<()> {
        let entry = self.resolve(handle)?;
        let child = self.resolve(child)?;
        let descriptor = self.descriptor_of(entry)?;
        let nav = descriptor.navigation_named(navigation)?.clone();
        if nav.cardinality != Cardinality::Collection {
            return Err(CoreError::invalid_operation(format!(
                "{}.{} is a single reference",
                descriptor.name(),
                navigation
            )));
        }
        self.expect_type(child, &nav.target)?;
        self.write_foreign_key(child, &nav.foreign_key, Some(entry))?;
        loader::link(&self.registry, &mut self.map, entry, &nav, child)
    }

    /// Removes `child` from a collection navigation and nulls its foreign
    /// key.
    ///
    /// # Errors
    ///
    /// Returns an error for stale handles or unknown navigations.
    pub fn remove_from_collection(
        &mut self,
        handle: EntityRef,
        navigation: &str,
        child: EntityRef,
    ) -> CoreResult<()> {
        let entry = self.resolve(handle)?;
        let child = self.resolve(child)?;
        let descriptor = self.descriptor_of(entry)?;
        let nav = descriptor.navigation_named(navigation)?.clone();
        loader::unlink(&self.registry, &mut self.map, entry, &nav, child)?;
        self.write_foreign_key(child, &nav.foreign_key, None)
    }

    fn expect_type(&self, entry: EntryId, type_name: &str) -> CoreResult<()> {
        let actual = &self.map.get(entry)?.type_name;
        if actual != type_name {
            return Err(CoreError::invalid_operation(format!(
                "expected a {type_name}, got a {actual}"
            )));
        }
        Ok(())
    }

    /// Writes foreign-key fields from the principal's key, or NULLs them.
    ///
    /// A principal whose key is still unset gets it from the store during
    /// the save, so the dependent is queued for an update to receive it.
    fn write_foreign_key(
        &mut self,
        entry: EntryId,
        foreign_key: &[String],
        principal: Option<EntryId>,
    ) -> CoreResult<()> {
        let (key, pending) = match principal {
            Some(principal) => {
                let key = self.map.get(principal)?.key.clone();
                let pending = !self.descriptor_of(principal)?.key_is_set(&key);
                (Some(key), pending)
            }
            None => (None, false),
        };
        let descriptor = self.descriptor_of(entry)?;
        let tracked = self.map.get_mut(entry)?;
        if tracked.state == EntityState::Deleted {
            return Ok(());
        }
        let mut rekey = false;
        let mut written = false;
        for (i, field) in foreign_key.iter().enumerate() {
            let value = key
                .as_ref()
                .and_then(|k| k.parts().get(i).cloned())
                .unwrap_or(Value::Null);
            if descriptor.is_key_field(field) {
                if tracked.state != EntityState::Added {
                    continue;
                }
                rekey = true;
            }
            tracked.current.insert(field.clone(), value);
            written = true;
        }
        if rekey {
            let key = descriptor.key_of(&tracked.current);
            self.map.rekey(&descriptor, entry, key)?;
        }
        self.detect_entry(entry)?;
        if pending && written && self.map.get(entry)?.state == EntityState::Unchanged {
            self.transition(entry, StateEvent::Force(EntityState::Modified))?;
        }
        Ok(())
    }

    fn navigable(&self, handle: EntityRef, navigation: &str) -> CoreResult<EntryId> {
        if handle.session == self.id && !self.map.contains(handle.entry) {
            let type_name = self
                .evicted
                .get(&handle.entry)
                .cloned()
                .unwrap_or_default();
            return Err(CoreError::DetachedNavigationAccess {
                type_name,
                navigation: navigation.to_string(),
            });
        }
        self.resolve(handle)
    }

    fn load_entry_navigation(
        &mut self,
        entry: EntryId,
        navigation: &str,
    ) -> CoreResult<Vec<EntryId>> {
        loader::load_navigation(&self.registry, &mut self.map, &mut self.driver, entry, navigation)
    }

    // Change detection and saving ---------------------------------------

    /// Promotes Unchanged entries whose values differ from their snapshot
    /// to Modified.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry's type is no longer registered.
    pub fn detect_changes(&mut self) -> CoreResult<()> {
        let ids: Vec<EntryId> = self
            .map
            .iter()
            .filter(|e| e.state == EntityState::Unchanged)
            .map(|e| e.id)
            .collect();
        for id in ids {
            self.detect_entry(id)?;
        }
        Ok(())
    }

    pub(crate) fn detect_entry(&mut self, entry: EntryId) -> CoreResult<()> {
        let tracked = self.map.get(entry)?;
        if tracked.state != EntityState::Unchanged {
            return Ok(());
        }
        let descriptor = self.descriptor(&tracked.type_name)?;
        if has_changes(&descriptor, tracked) {
            self.transition(entry, StateEvent::DetectChange)?;
        }
        Ok(())
    }

    /// Returns true if a save would write anything.
    ///
    /// # Errors
    ///
    /// Returns an error if change detection fails.
    pub fn has_changes(&mut self) -> CoreResult<bool> {
        if self.config.auto_detect_changes {
            self.detect_changes()?;
        }
        Ok(!self.map.dirty_ids().is_empty())
    }

    /// Type, key and state of every tracked entity, in tracking order.
    ///
    /// # Errors
    ///
    /// Returns an error if change detection fails.
    pub fn entries(&mut self) -> CoreResult<Vec<EntrySummary>> {
        if self.config.auto_detect_changes {
            self.detect_changes()?;
        }
        Ok(self.map.iter().map(|e| e.summary()).collect())
    }

    /// Field-level delta of one entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotTracked`] for stale handles.
    pub fn change_set(&self, handle: EntityRef) -> CoreResult<ChangeSet> {
        let entry = self.resolve(handle)?;
        let tracked = self.map.get(entry)?;
        let descriptor = self.descriptor(&tracked.type_name)?;
        Ok(compute_change_set(&descriptor, tracked))
    }

    /// Writes every Added, Modified and Deleted entity in one transaction.
    ///
    /// On success every written entity is Unchanged (deleted ones are
    /// evicted), with generated keys and refreshed tokens applied. On any
    /// failure nothing is committed and no tracked entity changes.
    ///
    /// # Errors
    ///
    /// - [`CoreError::GraphCycleDetected`] before any statement runs
    /// - [`CoreError::ConcurrencyConflict`] when an update or delete matches
    ///   no rows
    /// - [`CoreError::Cancelled`] when the cancel handle fired
    /// - [`CoreError::Storage`] for driver failures
    pub fn save_changes(&mut self) -> CoreResult<SaveResult> {
        let span = debug_span!("save_changes", session = %self.id);
        let _enter = span.enter();

        if self.config.auto_detect_changes {
            self.detect_changes()?;
        }
        let dirty = self.map.dirty_ids();
        if dirty.is_empty() {
            self.cancel.check()?;
            debug!("nothing to save");
            return Ok(SaveResult::default());
        }

        let plan = WorkPlan::build(&self.registry, &self.map, &dirty)?;
        self.cancel.check()?;

        let context = SaveContext {
            registry: &self.registry,
            map: &self.map,
            driver: &mut self.driver,
            config: &self.config,
            cancel: &self.cancel,
            ambient: self.ambient,
        };
        let (staged, result) = context.execute(&plan).inspect_err(|err| {
            if !err.is_concurrency_conflict() {
                warn!(error = %err, "save failed");
            }
        })?;

        for item in &staged {
            if item.kind == entitrack_storage::StatementKind::Delete {
                if let Ok(entry) = self.map.get(item.entry) {
                    let type_name = entry.type_name.clone();
                    self.remember_eviction(item.entry, type_name);
                }
            }
        }
        save::apply(&self.registry, &mut self.map, staged)?;

        debug!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            rows = result.rows_affected,
            "save committed"
        );
        Ok(result)
    }

    /// Runs `f` inside a caller-scoped transaction.
    ///
    /// Saves inside `f` join the transaction instead of opening their own.
    /// The transaction commits if `f` returns `Ok` and rolls back if it
    /// returns `Err`. Entities saved inside a rolled-back transaction keep
    /// the state the save gave them; reload them to resynchronize.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, or a driver error from begin or commit.
    pub fn transaction<F, T>(&mut self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Self) -> CoreResult<T>,
    {
        if let Some(active) = self.ambient {
            return Err(CoreError::invalid_operation(format!(
                "transaction {active} is already active on this session"
            )));
        }
        let handle = self.driver.begin_transaction()?;
        self.ambient = Some(handle);
        let result = f(self);
        self.ambient = None;

        match result {
            Ok(value) => {
                self.driver.commit(handle)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.driver.rollback(handle) {
                    warn!(txn = %handle, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl<D: StorageDriver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tracked", &self.map.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
