//! Save orchestration: executing a work plan inside one transaction.
//!
//! Execution never touches tracked entries. Every statement writes from a
//! staged copy of the entry's values, and the staged results are applied to
//! the identity map only after the transaction commits. A failed or
//! cancelled save therefore leaves the session exactly as it found it.

use crate::config::SessionConfig;
use crate::conflict::{check_outcome, write_predicate};
use crate::descriptor::{DescriptorRegistry, EntityDescriptor, ForeignKeySide};
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityMap;
use crate::plan::{WorkPlan, WriteOp};
use crate::snapshot::capture_snapshot;
use crate::state::{next_state, StateEvent, Transition};
use crate::types::EntryId;
use entitrack_storage::{Predicate, Row, StatementKind, StorageDriver, TransactionHandle, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a successful save did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveResult {
    /// Total rows affected across all statements.
    pub rows_affected: u64,
    /// Number of insert statements.
    pub inserted: usize,
    /// Number of update statements.
    pub updated: usize,
    /// Number of delete statements.
    pub deleted: usize,
}

impl SaveResult {
    /// Total number of statements executed.
    #[must_use]
    pub const fn statements(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Cancels an in-flight or upcoming save from any thread.
///
/// The flag is consumed by the save that observes it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Creates a handle in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true if cancellation was requested and not yet observed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clears the flag, failing with [`CoreError::Cancelled`] if it was set.
    pub(crate) fn check(&self) -> CoreResult<()> {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Transaction guard: rolls back on drop unless committed.
///
/// Inside a caller-scoped transaction the guard borrows the ambient handle
/// and neither commits nor rolls back; the caller's scope decides.
pub(crate) struct TransactionScope<'a, D: StorageDriver + ?Sized> {
    driver: &'a mut D,
    handle: TransactionHandle,
    owned: bool,
    finished: bool,
}

impl<'a, D: StorageDriver + ?Sized> TransactionScope<'a, D> {
    pub(crate) fn begin(driver: &'a mut D, ambient: Option<TransactionHandle>) -> CoreResult<Self> {
        let (handle, owned) = match ambient {
            Some(handle) => (handle, false),
            None => (driver.begin_transaction()?, true),
        };
        Ok(Self {
            driver,
            handle,
            owned,
            finished: false,
        })
    }

    pub(crate) fn driver(&mut self) -> &mut D {
        &mut *self.driver
    }

    pub(crate) fn commit(mut self) -> CoreResult<()> {
        self.finished = true;
        if !self.owned {
            return Ok(());
        }
        if let Err(err) = self.driver.commit(self.handle) {
            if let Err(rollback) = self.driver.rollback(self.handle) {
                warn!(txn = %self.handle, error = %rollback, "rollback after failed commit failed");
            }
            return Err(err.into());
        }
        Ok(())
    }
}

impl<D: StorageDriver + ?Sized> Drop for TransactionScope<'_, D> {
    fn drop(&mut self) {
        if self.owned && !self.finished {
            debug!(txn = %self.handle, "rolling back save");
            if let Err(err) = self.driver.rollback(self.handle) {
                warn!(txn = %self.handle, error = %err, "rollback failed");
            }
        }
    }
}

/// Result of one executed statement, applied after commit.
#[derive(Debug)]
pub(crate) struct Staged {
    pub(crate) entry: EntryId,
    pub(crate) kind: StatementKind,
    pub(crate) values: Row,
}

/// Everything a save borrows from its session.
pub(crate) struct SaveContext<'a, D: StorageDriver + ?Sized> {
    pub(crate) registry: &'a DescriptorRegistry,
    pub(crate) map: &'a IdentityMap,
    pub(crate) driver: &'a mut D,
    pub(crate) config: &'a SessionConfig,
    pub(crate) cancel: &'a CancelHandle,
    pub(crate) ambient: Option<TransactionHandle>,
}

impl<D: StorageDriver + ?Sized> SaveContext<'_, D> {
    /// Executes `plan` in one transaction and returns the staged results.
    ///
    /// # Errors
    ///
    /// Returns the first storage failure, concurrency conflict or
    /// cancellation; the transaction is rolled back and nothing is staged.
    pub(crate) fn execute(self, plan: &WorkPlan) -> CoreResult<(Vec<Staged>, SaveResult)> {
        let SaveContext {
            registry,
            map,
            driver,
            config,
            cancel,
            ambient,
        } = self;

        let mut rows: BTreeMap<EntryId, Row> = BTreeMap::new();
        for op in plan.ops() {
            rows.insert(op.entry, map.get(op.entry)?.current.clone());
        }

        let mut scope = TransactionScope::begin(driver, ambient)?;
        let mut staged = Vec::with_capacity(plan.len());
        let mut result = SaveResult::default();

        for op in plan.ops() {
            cancel.check()?;

            let entry = map.get(op.entry)?;
            let descriptor = registry.get(&entry.type_name)?;
            let meta = descriptor.table_meta();
            let current = rows.get(&op.entry).cloned().unwrap_or_default();

            let (values, predicate) = match op.kind {
                StatementKind::Insert => (insert_values(descriptor, &current), Predicate::new()),
                StatementKind::Update => (
                    update_values(descriptor, &entry.original, &current),
                    write_predicate(descriptor, entry, config.snapshot_predicates),
                ),
                StatementKind::Delete => (
                    Row::new(),
                    write_predicate(descriptor, entry, config.snapshot_predicates),
                ),
            };

            if config.trace_statements {
                debug!(
                    statement = %op.kind,
                    table = %meta.name,
                    predicate = %predicate,
                    columns = values.len(),
                    "executing statement"
                );
            }

            let outcome = scope.driver().execute(op.kind, &meta, &values, &predicate)?;
            check_outcome(op.kind, entry, &outcome)?;
            result.rows_affected += outcome.rows_affected;

            let mut written = current;
            if let (Some(key), Some(generated)) = (
                descriptor.key_fields().first(),
                outcome.generated_key.clone(),
            ) {
                written.insert(key.clone(), generated);
            }
            if let (Some(token), Some(value)) = (descriptor.token_field(), outcome.token.clone()) {
                written.insert(token.to_string(), value);
            }

            match op.kind {
                StatementKind::Insert => {
                    result.inserted += 1;
                    propagate_key(registry, map, op, descriptor, &written, &mut rows)?;
                }
                StatementKind::Update => result.updated += 1,
                StatementKind::Delete => result.deleted += 1,
            }

            rows.insert(op.entry, written.clone());
            staged.push(Staged {
                entry: op.entry,
                kind: op.kind,
                values: written,
            });
        }

        cancel.check()?;
        scope.commit()?;
        Ok((staged, result))
    }
}

/// Applies committed results to the identity map.
pub(crate) fn apply(
    registry: &DescriptorRegistry,
    map: &mut IdentityMap,
    staged: Vec<Staged>,
) -> CoreResult<()> {
    for Staged { entry: id, kind, values } in staged {
        let Ok(entry) = map.get(id) else { continue };
        let descriptor = Arc::clone(registry.get(&entry.type_name)?);
        match next_state(entry.state, StateEvent::AcceptChanges)? {
            Transition::Evict => {
                map.remove(id);
            }
            Transition::To(state) => {
                if kind == StatementKind::Insert {
                    let key = descriptor.key_of(&values);
                    map.rekey(&descriptor, id, key)?;
                }
                let entry = map.get_mut(id)?;
                entry.current = values;
                entry.state = state;
                capture_snapshot(&descriptor, entry);
            }
        }
    }
    Ok(())
}

/// Full row for an insert. Unset generated keys are left for the store.
fn insert_values(descriptor: &EntityDescriptor, current: &Row) -> Row {
    let mut values = current.clone();
    if let Some(token) = descriptor.token_field() {
        values.remove(token);
    }
    if descriptor.is_key_generated() && !descriptor.key_is_set(&descriptor.key_of(current)) {
        for key in descriptor.key_fields() {
            values.remove(key);
        }
    }
    values
}

/// Changed writable fields, or every writable field when nothing differs.
fn update_values(descriptor: &EntityDescriptor, original: &Row, current: &Row) -> Row {
    let changed: Row = descriptor
        .writable_fields()
        .filter(|f| original.get(&f.name) != current.get(&f.name))
        .map(|f| (f.name.clone(), current.get(&f.name).cloned().unwrap_or(Value::Null)))
        .collect();
    if !changed.is_empty() {
        return changed;
    }
    descriptor
        .writable_fields()
        .map(|f| (f.name.clone(), current.get(&f.name).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Copies an inserted principal's key into the staged foreign keys of every
/// dependent linked to it.
fn propagate_key(
    registry: &DescriptorRegistry,
    map: &IdentityMap,
    op: &WriteOp,
    descriptor: &EntityDescriptor,
    written: &Row,
    rows: &mut BTreeMap<EntryId, Row>,
) -> CoreResult<()> {
    let key = descriptor.key_of(written);
    let principal = map.get(op.entry)?;
    let mut targets: Vec<(EntryId, Vec<String>)> = Vec::new();

    for navigation in descriptor.navigations() {
        if navigation.side != ForeignKeySide::Target {
            continue;
        }
        if let Some(Some(child)) = principal.references.get(&navigation.name) {
            targets.push((*child, navigation.foreign_key.clone()));
        }
        for child in principal.collections.get(&navigation.name).into_iter().flatten() {
            targets.push((*child, navigation.foreign_key.clone()));
        }
    }
    for other in map.iter() {
        let other_type = registry.get(&other.type_name)?;
        for navigation in other_type.navigations() {
            if navigation.side == ForeignKeySide::Source
                && other.references.get(&navigation.name) == Some(&Some(op.entry))
            {
                targets.push((other.id, navigation.foreign_key.clone()));
            }
        }
    }

    for (dependent, foreign_key) in targets {
        if let Some(row) = rows.get_mut(&dependent) {
            for (field, part) in foreign_key.iter().zip(key.parts()) {
                row.insert(field.clone(), part.clone());
            }
        }
    }
    Ok(())
}
