//! Identity map: one tracked entry per (entity type, key).

use crate::descriptor::EntityDescriptor;
use crate::entry::TrackedEntry;
use crate::error::{CoreError, CoreResult};
use crate::state::EntityState;
use crate::types::{EntityKey, EntryId};
use entitrack_storage::Row;
use std::collections::{BTreeMap, HashMap};

/// Result of [`IdentityMap::get_or_track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracked {
    /// An entry with the same type and key was already tracked; the caller's
    /// values were discarded.
    Existing(EntryId),
    /// A new entry was created.
    New(EntryId),
}

impl Tracked {
    /// The entry, whichever way it was obtained.
    pub fn id(self) -> EntryId {
        match self {
            Tracked::Existing(id) | Tracked::New(id) => id,
        }
    }

    /// Returns true if a new entry was created.
    pub fn is_new(self) -> bool {
        matches!(self, Tracked::New(_))
    }
}

/// Arena of tracked entries plus the (type, key) index over them.
///
/// # Invariants
///
/// - No two entries of the same type share an equal set key
/// - Every indexed key points at a live entry whose key equals it
/// - Entries with an unset key are in the arena but not in the index
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: BTreeMap<EntryId, TrackedEntry>,
    index: HashMap<(String, EntityKey), EntryId>,
    next_id: u64,
}

impl IdentityMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `values`' key, or tracks a new one in `state`.
    ///
    /// `values` must already be normalized against `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdentityConflict`] if an entry with the same key
    /// is already dirty and `values` disagree with its current values.
    pub fn get_or_track(
        &mut self,
        descriptor: &EntityDescriptor,
        values: Row,
        state: EntityState,
    ) -> CoreResult<Tracked> {
        let key = descriptor.key_of(&values);
        if descriptor.key_is_set(&key) {
            if let Some(id) = self.try_get(descriptor.name(), &key) {
                let existing = self.get(id)?;
                if existing.state.is_dirty() && conflicts(&existing.current, &values, descriptor) {
                    return Err(CoreError::IdentityConflict {
                        type_name: descriptor.name().to_string(),
                        key,
                    });
                }
                return Ok(Tracked::Existing(id));
            }
        }
        Ok(Tracked::New(self.insert(descriptor, key, values, state)))
    }

    /// Routes a stored row through the map. An already-tracked entry wins
    /// over the row and is returned unchanged.
    pub fn track_loaded(&mut self, descriptor: &EntityDescriptor, values: Row) -> Tracked {
        let key = descriptor.key_of(&values);
        if let Some(id) = self.try_get(descriptor.name(), &key) {
            return Tracked::Existing(id);
        }
        let token = descriptor
            .token_field()
            .and_then(|field| values.get(field).cloned());
        let id = self.insert(descriptor, key, values, EntityState::Unchanged);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.token = token;
        }
        Tracked::New(id)
    }

    fn insert(
        &mut self,
        descriptor: &EntityDescriptor,
        key: EntityKey,
        values: Row,
        state: EntityState,
    ) -> EntryId {
        self.next_id += 1;
        let id = EntryId::new(self.next_id);
        if descriptor.key_is_set(&key) {
            self.index
                .insert((descriptor.name().to_string(), key.clone()), id);
        }
        self.entries
            .insert(id, TrackedEntry::new(id, descriptor.name(), key, values, state));
        id
    }

    /// Looks up an entry by type and key.
    pub fn try_get(&self, type_name: &str, key: &EntityKey) -> Option<EntryId> {
        self.index
            .get(&(type_name.to_string(), key.clone()))
            .copied()
    }

    /// Returns true if the entry is tracked.
    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns an entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotTracked`] if the entry was evicted.
    pub fn get(&self, id: EntryId) -> CoreResult<&TrackedEntry> {
        self.entries
            .get(&id)
            .ok_or(CoreError::EntryNotTracked { entry: id })
    }

    /// Returns an entry mutably.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotTracked`] if the entry was evicted.
    pub fn get_mut(&mut self, id: EntryId) -> CoreResult<&mut TrackedEntry> {
        self.entries
            .get_mut(&id)
            .ok_or(CoreError::EntryNotTracked { entry: id })
    }

    /// Evicts an entry, unlinking it from every navigation that points at it.
    pub fn remove(&mut self, id: EntryId) -> Option<TrackedEntry> {
        let entry = self.entries.remove(&id)?;
        let slot = (entry.type_name.clone(), entry.key.clone());
        if self.index.get(&slot) == Some(&id) {
            self.index.remove(&slot);
        }
        for other in self.entries.values_mut() {
            for target in other.references.values_mut() {
                if *target == Some(id) {
                    *target = None;
                }
            }
            for members in other.collections.values_mut() {
                members.retain(|m| *m != id);
            }
        }
        Some(entry)
    }

    /// Moves an entry to a new key, e.g. after the store generated one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdentityConflict`] if another entry already holds
    /// `key`, or [`CoreError::EntryNotTracked`] if the entry is gone.
    pub fn rekey(
        &mut self,
        descriptor: &EntityDescriptor,
        id: EntryId,
        key: EntityKey,
    ) -> CoreResult<()> {
        if let Some(holder) = self.try_get(descriptor.name(), &key) {
            if holder != id {
                return Err(CoreError::IdentityConflict {
                    type_name: descriptor.name().to_string(),
                    key,
                });
            }
            return Ok(());
        }
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(CoreError::EntryNotTracked { entry: id })?;
        let old = (entry.type_name.clone(), std::mem::replace(&mut entry.key, key.clone()));
        if self.index.get(&old) == Some(&id) {
            self.index.remove(&old);
        }
        if descriptor.key_is_set(&key) {
            self.index.insert((descriptor.name().to_string(), key), id);
        }
        Ok(())
    }

    /// Iterates over entries in tracking order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedEntry> {
        self.entries.values()
    }

    /// Entries a save has work to do for, in tracking order.
    pub fn dirty_ids(&self) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| e.state.is_dirty())
            .map(|e| e.id)
            .collect()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

fn conflicts(current: &Row, incoming: &Row, descriptor: &EntityDescriptor) -> bool {
    incoming.iter().any(|(field, value)| {
        !descriptor.is_token_field(field) && current.get(field).is_some_and(|c| c != value)
    })
}
