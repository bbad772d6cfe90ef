//! In-memory storage driver for testing.

use crate::driver::{
    Predicate, StatementKind, StorageDriver, TableMeta, TransactionHandle, WriteOutcome,
};
use crate::error::{StorageError, StorageResult};
use crate::value::{Row, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct Table {
    meta: TableMeta,
    rows: Vec<Row>,
    next_id: i64,
}

impl Table {
    fn key_of(&self, row: &Row) -> Vec<Value> {
        self.meta
            .key_columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn position_of(&self, key: &[Value]) -> Option<usize> {
        self.rows.iter().position(|r| self.key_of(r) == key)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    tables: HashMap<String, Table>,
    next_txn: u64,
    next_version: i64,
}

impl StoreState {
    fn table_mut(&mut self, name: &str) -> StorageResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    fn bump_version(&mut self) -> Value {
        self.next_version += 1;
        Value::Integer(self.next_version)
    }
}

/// Reverse image of one applied write.
#[derive(Debug)]
enum UndoOp {
    Inserted { table: String, key: Vec<Value> },
    Updated { table: String, before: Row },
    Deleted { table: String, before: Row },
}

/// Shared in-memory tables.
///
/// Cloning the store clones the handle, not the data. Open one
/// [`InMemoryDriver`] per session with [`InMemoryStore::connect`]; all of
/// them see the same committed rows.
///
/// # Example
///
/// ```rust
/// use entitrack_storage::{
///     InMemoryStore, Predicate, Row, StatementKind, StorageDriver, TableMeta, Value,
/// };
///
/// let meta = TableMeta::new("Standard", vec!["StandardId".into()])
///     .with_generated_key("StandardId")
///     .with_column("StandardName");
/// let store = InMemoryStore::new();
/// store.create_table(&meta);
///
/// let mut driver = store.connect();
/// let mut row = Row::new();
/// row.insert("StandardName".into(), Value::from("Grade 1"));
/// let outcome = driver.execute(StatementKind::Insert, &meta, &row, &Predicate::new()).unwrap();
/// assert_eq!(outcome.generated_key, Some(Value::Integer(1)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table. Re-creating an existing table keeps its rows.
    pub fn create_table(&self, meta: &TableMeta) {
        let mut state = self.state.write();
        state
            .tables
            .entry(meta.name.clone())
            .or_insert_with(|| Table {
                meta: meta.clone(),
                rows: Vec::new(),
                next_id: 0,
            });
    }

    /// Opens a new connection to this store.
    #[must_use]
    pub fn connect(&self) -> InMemoryDriver {
        InMemoryDriver {
            store: self.clone(),
            active: None,
        }
    }

    /// Inserts a row outside of any transaction, applying key generation and
    /// row versioning. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is unknown or the key is taken.
    pub fn seed(&self, table: &str, row: Row) -> StorageResult<Row> {
        let mut state = self.state.write();
        let (stored, _) = insert_row(&mut state, table, row)?;
        Ok(stored)
    }

    /// Returns a copy of all committed rows of a table.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .read()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Returns the number of rows in a table.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .read()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Applies an update directly, as another process would.
    ///
    /// Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is unknown.
    pub fn update_where(
        &self,
        table: &str,
        predicate: &Predicate,
        values: &Row,
    ) -> StorageResult<u64> {
        let mut state = self.state.write();
        let (affected, _, _) = update_rows(&mut state, table, values, predicate)?;
        Ok(affected)
    }
}

fn insert_row(
    state: &mut StoreState,
    table: &str,
    mut row: Row,
) -> StorageResult<(Row, Option<Value>)> {
    let token_column = state.table_mut(table)?.meta.token_column.clone();
    let token = token_column.as_ref().map(|_| state.bump_version());
    let t = state.table_mut(table)?;

    for column in row.keys() {
        if !t.meta.columns.contains(column) {
            return Err(StorageError::invalid_column(table, column, "unknown column"));
        }
    }

    if let Some(column) = t.meta.generated_key.clone() {
        match row.get(&column) {
            Some(Value::Integer(n)) if *n > 0 => {
                t.next_id = t.next_id.max(*n);
            }
            Some(Value::Integer(_)) | Some(Value::Null) | None => {
                t.next_id += 1;
                row.insert(column, Value::Integer(t.next_id));
            }
            Some(other) => {
                return Err(StorageError::invalid_column(
                    table,
                    column,
                    format!("generated key must be an integer, got {}", other.type_name()),
                ))
            }
        }
    }

    if let (Some(column), Some(token)) = (token_column, token.clone()) {
        row.insert(column, token);
    }

    let key = t.key_of(&row);
    if key.iter().any(Value::is_null) {
        return Err(StorageError::invalid_column(
            table,
            t.meta.key_columns.join(","),
            "key columns must not be NULL",
        ));
    }
    if t.position_of(&key).is_some() {
        return Err(StorageError::DuplicateKey {
            table: table.to_string(),
            key: render_key(&key),
        });
    }

    t.rows.push(row.clone());
    Ok((row, token))
}

fn update_rows(
    state: &mut StoreState,
    table: &str,
    values: &Row,
    predicate: &Predicate,
) -> StorageResult<(u64, Option<Value>, Vec<Row>)> {
    let token_column = state.table_mut(table)?.meta.token_column.clone();
    let matching: Vec<usize> = {
        let t = state.table_mut(table)?;
        for column in values.keys() {
            if t.meta.key_columns.contains(column) {
                return Err(StorageError::invalid_column(
                    table,
                    column,
                    "key columns are immutable",
                ));
            }
            if !t.meta.columns.contains(column) {
                return Err(StorageError::invalid_column(table, column, "unknown column"));
            }
        }
        t.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| predicate.matches(r))
            .map(|(i, _)| i)
            .collect()
    };
    if matching.is_empty() {
        return Ok((0, None, Vec::new()));
    }

    let token = token_column.as_ref().map(|_| state.bump_version());
    let t = state.table_mut(table)?;
    let mut before = Vec::with_capacity(matching.len());
    for index in &matching {
        let row = &mut t.rows[*index];
        before.push(row.clone());
        for (column, value) in values {
            row.insert(column.clone(), value.clone());
        }
        if let (Some(column), Some(token)) = (&token_column, &token) {
            row.insert(column.clone(), token.clone());
        }
    }
    Ok((matching.len() as u64, token, before))
}

fn delete_rows(
    state: &mut StoreState,
    table: &str,
    predicate: &Predicate,
) -> StorageResult<Vec<Row>> {
    let t = state.table_mut(table)?;
    let (removed, kept): (Vec<Row>, Vec<Row>) =
        t.rows.drain(..).partition(|r| predicate.matches(r));
    t.rows = kept;
    Ok(removed)
}

fn render_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
    format!("({})", parts.join(", "))
}

#[derive(Debug)]
struct ActiveTransaction {
    handle: TransactionHandle,
    undo: Vec<UndoOp>,
}

/// One connection to an [`InMemoryStore`].
///
/// Writes are applied to the shared tables immediately; an open transaction
/// keeps an undo log that `rollback` replays in reverse. Dropping the driver
/// with a transaction still open rolls it back.
#[derive(Debug)]
pub struct InMemoryDriver {
    store: InMemoryStore,
    active: Option<ActiveTransaction>,
}

impl InMemoryDriver {
    /// Returns the store this connection writes to.
    #[must_use]
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Returns true if a transaction is open on this connection.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.active.is_some()
    }

    fn record(&mut self, op: UndoOp) {
        if let Some(active) = self.active.as_mut() {
            active.undo.push(op);
        }
    }

    fn take_active(&mut self, handle: TransactionHandle) -> StorageResult<ActiveTransaction> {
        match self.active.take() {
            Some(active) if active.handle == handle => Ok(active),
            other => {
                self.active = other;
                Err(StorageError::NoActiveTransaction(handle.as_u64()))
            }
        }
    }

    fn undo(&self, ops: Vec<UndoOp>) {
        let mut state = self.store.state.write();
        for op in ops.into_iter().rev() {
            match op {
                UndoOp::Inserted { table, key } => {
                    if let Some(t) = state.tables.get_mut(&table) {
                        if let Some(pos) = t.position_of(&key) {
                            t.rows.remove(pos);
                        }
                    }
                }
                UndoOp::Updated { table, before } => {
                    if let Some(t) = state.tables.get_mut(&table) {
                        let key = t.key_of(&before);
                        if let Some(pos) = t.position_of(&key) {
                            t.rows[pos] = before;
                        }
                    }
                }
                UndoOp::Deleted { table, before } => {
                    if let Some(t) = state.tables.get_mut(&table) {
                        t.rows.push(before);
                    }
                }
            }
        }
    }
}

impl StorageDriver for InMemoryDriver {
    fn execute(
        &mut self,
        kind: StatementKind,
        table: &TableMeta,
        values: &Row,
        predicate: &Predicate,
    ) -> StorageResult<WriteOutcome> {
        match kind {
            StatementKind::Insert => {
                let (stored, token) = {
                    let mut state = self.store.state.write();
                    insert_row(&mut state, &table.name, values.clone())?
                };
                let generated_key = table
                    .generated_key
                    .as_ref()
                    .and_then(|c| stored.get(c).cloned());
                let key = table
                    .key_columns
                    .iter()
                    .map(|c| stored.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                self.record(UndoOp::Inserted {
                    table: table.name.clone(),
                    key,
                });
                Ok(WriteOutcome {
                    rows_affected: 1,
                    generated_key,
                    token,
                })
            }
            StatementKind::Update => {
                let (affected, token, before) = {
                    let mut state = self.store.state.write();
                    update_rows(&mut state, &table.name, values, predicate)?
                };
                for row in before {
                    self.record(UndoOp::Updated {
                        table: table.name.clone(),
                        before: row,
                    });
                }
                Ok(WriteOutcome {
                    rows_affected: affected,
                    generated_key: None,
                    token,
                })
            }
            StatementKind::Delete => {
                let removed = {
                    let mut state = self.store.state.write();
                    delete_rows(&mut state, &table.name, predicate)?
                };
                let affected = removed.len() as u64;
                for row in removed {
                    self.record(UndoOp::Deleted {
                        table: table.name.clone(),
                        before: row,
                    });
                }
                Ok(WriteOutcome::rows(affected))
            }
        }
    }

    fn query(&mut self, table: &TableMeta, predicate: &Predicate) -> StorageResult<Vec<Row>> {
        let state = self.store.state.read();
        let t = state
            .tables
            .get(&table.name)
            .ok_or_else(|| StorageError::TableNotFound(table.name.clone()))?;
        Ok(t.rows.iter().filter(|r| predicate.matches(r)).cloned().collect())
    }

    fn begin_transaction(&mut self) -> StorageResult<TransactionHandle> {
        if let Some(active) = &self.active {
            return Err(StorageError::TransactionActive(active.handle.as_u64()));
        }
        let handle = {
            let mut state = self.store.state.write();
            state.next_txn += 1;
            TransactionHandle::new(state.next_txn)
        };
        self.active = Some(ActiveTransaction {
            handle,
            undo: Vec::new(),
        });
        Ok(handle)
    }

    fn commit(&mut self, handle: TransactionHandle) -> StorageResult<()> {
        self.take_active(handle)?;
        Ok(())
    }

    fn rollback(&mut self, handle: TransactionHandle) -> StorageResult<()> {
        let active = self.take_active(handle)?;
        self.undo(active.undo);
        Ok(())
    }
}

impl Drop for InMemoryDriver {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            self.undo(active.undo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn student_meta() -> TableMeta {
        TableMeta::new("Student", vec!["StudentID".into()])
            .with_generated_key("StudentID")
            .with_column("StudentName")
            .with_token("RowVersion")
    }

    fn named(name: &str) -> Row {
        let mut row = Row::new();
        row.insert("StudentName".into(), Value::from(name));
        row
    }

    fn setup() -> (InMemoryStore, TableMeta) {
        let store = InMemoryStore::new();
        let meta = student_meta();
        store.create_table(&meta);
        (store, meta)
    }

    #[test]
    fn insert_generates_key_and_token() {
        let (store, meta) = setup();
        let mut driver = store.connect();

        let first = driver
            .execute(StatementKind::Insert, &meta, &named("Bill"), &Predicate::new())
            .unwrap();
        let second = driver
            .execute(StatementKind::Insert, &meta, &named("Steve"), &Predicate::new())
            .unwrap();

        assert_eq!(first.generated_key, Some(Value::Integer(1)));
        assert_eq!(second.generated_key, Some(Value::Integer(2)));
        assert_ne!(first.token, second.token);
        assert_eq!(store.row_count("Student"), 2);
    }

    #[test]
    fn explicit_key_is_kept() {
        let (store, meta) = setup();
        let mut row = named("Chris");
        row.insert("StudentID".into(), Value::Integer(10));
        store.seed("Student", row).unwrap();

        let mut driver = store.connect();
        let outcome = driver
            .execute(StatementKind::Insert, &meta, &named("Next"), &Predicate::new())
            .unwrap();
        assert_eq!(outcome.generated_key, Some(Value::Integer(11)));
    }

    #[test]
    fn duplicate_key_fails() {
        let (store, meta) = setup();
        let mut row = named("Chris");
        row.insert("StudentID".into(), Value::Integer(10));
        store.seed("Student", row.clone()).unwrap();

        let mut driver = store.connect();
        let result = driver.execute(StatementKind::Insert, &meta, &row, &Predicate::new());
        assert!(matches!(result, Err(StorageError::DuplicateKey { .. })));
    }

    #[test]
    fn update_refreshes_token() {
        let (store, meta) = setup();
        let seeded = store.seed("Student", named("Bill")).unwrap();
        let old_token = seeded.get("RowVersion").cloned().unwrap();

        let mut driver = store.connect();
        let predicate = Predicate::new()
            .and_eq("StudentID", 1)
            .and_eq("RowVersion", old_token.clone());
        let outcome = driver
            .execute(StatementKind::Update, &meta, &named("Alex"), &predicate)
            .unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_ne!(outcome.token, Some(old_token.clone()));

        // Stale token no longer matches.
        let stale = driver
            .execute(StatementKind::Update, &meta, &named("Robin"), &predicate)
            .unwrap();
        assert_eq!(stale.rows_affected, 0);
    }

    #[test]
    fn update_of_key_column_rejected() {
        let (store, meta) = setup();
        store.seed("Student", named("Bill")).unwrap();
        let mut driver = store.connect();
        let mut values = Row::new();
        values.insert("StudentID".into(), Value::Integer(5));
        let result = driver.execute(
            StatementKind::Update,
            &meta,
            &values,
            &Predicate::new().and_eq("StudentID", 1),
        );
        assert!(matches!(result, Err(StorageError::InvalidColumn { .. })));
    }

    #[test]
    fn rollback_restores_all_writes() {
        let (store, meta) = setup();
        store.seed("Student", named("Bill")).unwrap();
        store.seed("Student", named("Steve")).unwrap();
        let before = store.rows("Student");

        let mut driver = store.connect();
        let txn = driver.begin_transaction().unwrap();
        driver
            .execute(StatementKind::Insert, &meta, &named("Kapil"), &Predicate::new())
            .unwrap();
        driver
            .execute(
                StatementKind::Update,
                &meta,
                &named("Alex"),
                &Predicate::new().and_eq("StudentID", 1),
            )
            .unwrap();
        driver
            .execute(
                StatementKind::Delete,
                &meta,
                &Row::new(),
                &Predicate::new().and_eq("StudentID", 2),
            )
            .unwrap();
        driver.rollback(txn).unwrap();

        let mut after = store.rows("Student");
        let mut expected = before;
        after.sort();
        expected.sort();
        assert_eq!(after, expected);
        assert!(!driver.in_transaction());
    }

    #[test]
    fn commit_keeps_writes() {
        let (store, meta) = setup();
        let mut driver = store.connect();
        let txn = driver.begin_transaction().unwrap();
        driver
            .execute(StatementKind::Insert, &meta, &named("Arjun"), &Predicate::new())
            .unwrap();
        driver.commit(txn).unwrap();
        assert_eq!(store.row_count("Student"), 1);
    }

    #[test]
    fn nested_begin_rejected() {
        let (store, _) = setup();
        let mut driver = store.connect();
        let _txn = driver.begin_transaction().unwrap();
        assert!(matches!(
            driver.begin_transaction(),
            Err(StorageError::TransactionActive(_))
        ));
    }

    #[test]
    fn commit_with_wrong_handle_fails() {
        let (store, _) = setup();
        let mut driver = store.connect();
        let txn = driver.begin_transaction().unwrap();
        let wrong = TransactionHandle::new(txn.as_u64() + 100);
        assert!(driver.commit(wrong).is_err());
        assert!(driver.in_transaction());
    }

    #[test]
    fn drop_rolls_back_open_transaction() {
        let (store, meta) = setup();
        {
            let mut driver = store.connect();
            driver.begin_transaction().unwrap();
            driver
                .execute(StatementKind::Insert, &meta, &named("Ghost"), &Predicate::new())
                .unwrap();
        }
        assert_eq!(store.row_count("Student"), 0);
    }

    #[test]
    fn connections_share_committed_rows() {
        let (store, meta) = setup();
        let mut a = store.connect();
        let mut b = store.connect();
        a.execute(StatementKind::Insert, &meta, &named("Bill"), &Predicate::new())
            .unwrap();
        let rows = b.query(&meta, &Predicate::new().and_eq("StudentName", "Bill")).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn unknown_table_fails() {
        let store = InMemoryStore::new();
        let mut driver = store.connect();
        let result = driver.query(&student_meta(), &Predicate::new());
        assert!(matches!(result, Err(StorageError::TableNotFound(_))));
    }

    proptest! {
        #[test]
        fn rollback_restores_any_write_sequence(
            ops in prop::collection::vec((0u8..3, 1i64..6, "[a-z]{1,6}"), 1..20),
        ) {
            let (store, meta) = setup();
            for name in ["a", "b", "c"] {
                store.seed("Student", named(name)).unwrap();
            }
            let mut before = store.rows("Student");
            before.sort();

            let mut driver = store.connect();
            let txn = driver.begin_transaction().unwrap();
            for (op, id, name) in &ops {
                let by_id = Predicate::new().and_eq("StudentID", *id);
                let any = Predicate::new();
                let _ = match op {
                    0 => driver.execute(StatementKind::Insert, &meta, &named(name), &any),
                    1 => driver.execute(StatementKind::Update, &meta, &named(name), &by_id),
                    _ => driver.execute(StatementKind::Delete, &meta, &Row::new(), &by_id),
                };
            }
            driver.rollback(txn).unwrap();

            let mut after = store.rows("Student");
            after.sort();
            prop_assert_eq!(after, before);
        }
    }
}
