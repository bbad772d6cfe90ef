//! Work plan construction: dependency-ordered write operations.
//!
//! Inserts run first, principals before dependents. Updates follow in
//! tracking order. Deletes run last, dependents before principals, so no
//! statement ever leaves a dangling foreign key behind it.

use crate::descriptor::{DescriptorRegistry, EntityDescriptor, ForeignKeySide};
use crate::entry::TrackedEntry;
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityMap;
use crate::snapshot::{compute_change_set, ChangeSet};
use crate::state::EntityState;
use crate::types::{EntityKey, EntryId};
use entitrack_storage::{Row, StatementKind, Value};
use std::collections::{BTreeMap, BTreeSet};

/// One statement to execute for one entry.
#[derive(Debug, Clone)]
pub struct WriteOp {
    /// Statement kind.
    pub kind: StatementKind,
    /// Entry being written.
    pub entry: EntryId,
    /// Delta computed for the entry.
    pub change_set: ChangeSet,
}

/// Ordered write operations for one save.
#[derive(Debug, Clone, Default)]
pub struct WorkPlan {
    ops: Vec<WriteOp>,
}

impl WorkPlan {
    /// Builds the plan for the given dirty entries.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::GraphCycleDetected`] if the inserts or the
    /// deletes reference each other in a cycle, and
    /// [`CoreError::UnknownEntityType`] for entries of unregistered types.
    pub fn build(
        registry: &DescriptorRegistry,
        map: &IdentityMap,
        dirty: &[EntryId],
    ) -> CoreResult<Self> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for &id in dirty {
            let entry = map.get(id)?;
            match entry.state {
                EntityState::Added => inserts.push(id),
                EntityState::Modified => updates.push(id),
                EntityState::Deleted => deletes.push(id),
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }

        let inserts = order(registry, map, &inserts, Values::Current)?;
        let mut deletes = order(registry, map, &deletes, Values::Original)?;
        deletes.reverse();

        let mut ops = Vec::with_capacity(inserts.len() + updates.len() + deletes.len());
        for (kind, ids) in [
            (StatementKind::Insert, inserts),
            (StatementKind::Update, updates),
            (StatementKind::Delete, deletes),
        ] {
            for id in ids {
                let entry = map.get(id)?;
                let descriptor = registry.get(&entry.type_name)?;
                ops.push(WriteOp {
                    kind,
                    entry: id,
                    change_set: compute_change_set(descriptor, entry),
                });
            }
        }
        Ok(Self { ops })
    }

    /// Operations in execution order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Values {
    Current,
    Original,
}

impl Values {
    fn of(self, entry: &TrackedEntry) -> &Row {
        match self {
            Values::Current => &entry.current,
            Values::Original => &entry.original,
        }
    }
}

/// Topologically sorts `ids` so principals precede dependents (Kahn's
/// algorithm, ties broken by tracking order).
fn order(
    registry: &DescriptorRegistry,
    map: &IdentityMap,
    ids: &[EntryId],
    values: Values,
) -> CoreResult<Vec<EntryId>> {
    let members: BTreeSet<EntryId> = ids.iter().copied().collect();
    let mut dependents: BTreeMap<EntryId, BTreeSet<EntryId>> = BTreeMap::new();
    let mut in_degree: BTreeMap<EntryId, usize> = members.iter().map(|id| (*id, 0)).collect();

    for &id in ids {
        for (principal, dependent) in edges(registry, map, id, values)? {
            if members.contains(&principal)
                && members.contains(&dependent)
                && dependents.entry(principal).or_default().insert(dependent)
            {
                *in_degree.entry(dependent).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<EntryId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = Vec::with_capacity(ids.len());

    while let Some(id) = ready.pop_first() {
        sorted.push(id);
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if sorted.len() < ids.len() {
        let placed: BTreeSet<EntryId> = sorted.iter().copied().collect();
        let mut entities = Vec::new();
        for id in members.difference(&placed) {
            let entry = map.get(*id)?;
            entities.push(describe(entry));
        }
        return Err(CoreError::GraphCycleDetected { entities });
    }
    Ok(sorted)
}

/// Every (principal, dependent) pair `id` takes part in, from navigation
/// links and from foreign-key values that match tracked keys.
fn edges(
    registry: &DescriptorRegistry,
    map: &IdentityMap,
    id: EntryId,
    values: Values,
) -> CoreResult<Vec<(EntryId, EntryId)>> {
    let entry = map.get(id)?;
    let descriptor = registry.get(&entry.type_name)?;
    let row = values.of(entry);
    let mut pairs = Vec::new();

    for navigation in descriptor.navigations() {
        match navigation.side {
            ForeignKeySide::Source => {
                if let Some(Some(principal)) = entry.references.get(&navigation.name) {
                    pairs.push((*principal, id));
                }
                let target = registry.get(&navigation.target)?;
                if let Some(principal) = lookup(map, target, &navigation.foreign_key, row) {
                    pairs.push((principal, id));
                }
            }
            ForeignKeySide::Target => {
                if let Some(Some(child)) = entry.references.get(&navigation.name) {
                    pairs.push((id, *child));
                }
                for child in entry.collections.get(&navigation.name).into_iter().flatten() {
                    pairs.push((id, *child));
                }
            }
        }
    }

    // Relationships declared only on the principal's side still constrain
    // this entry through its foreign-key values.
    for principal_type in registry.iter() {
        for navigation in principal_type.navigations() {
            if navigation.side == ForeignKeySide::Target && navigation.target == entry.type_name {
                if let Some(principal) = lookup(map, principal_type, &navigation.foreign_key, row) {
                    pairs.push((principal, id));
                }
            }
        }
    }
    Ok(pairs)
}

fn lookup(
    map: &IdentityMap,
    principal: &EntityDescriptor,
    foreign_key: &[String],
    row: &Row,
) -> Option<EntryId> {
    let key = EntityKey::new(
        foreign_key
            .iter()
            .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
            .collect(),
    );
    if !principal.key_is_set(&key) {
        return None;
    }
    map.try_get(principal.name(), &key)
}

pub(crate) fn describe(entry: &TrackedEntry) -> String {
    format!("{}{}", entry.type_name, entry.key)
}
