//! Recording storage driver.
//!
//! Wraps another driver, logs every call it forwards, and can inject a
//! failure or fire a cancel handle partway through a save.

use entitrack_core::CancelHandle;
use entitrack_storage::{
    Predicate, Row, StatementKind, StorageDriver, StorageError, StorageResult, TableMeta,
    TransactionHandle, WriteOutcome,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// One call observed by a [`RecordingDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A transaction was opened.
    Begin,
    /// A transaction was committed.
    Commit,
    /// A transaction was rolled back.
    Rollback,
    /// A write statement was executed.
    Execute {
        /// Statement kind.
        kind: StatementKind,
        /// Table written.
        table: String,
        /// Column values sent.
        values: Row,
        /// Write predicate sent.
        predicate: Predicate,
    },
    /// Rows were read.
    Query {
        /// Table read.
        table: String,
    },
}

/// Shared view of the events a [`RecordingDriver`] has seen.
#[derive(Debug, Clone, Default)]
pub struct StatementLog {
    events: Arc<Mutex<Vec<DriverEvent>>>,
}

impl StatementLog {
    fn push(&self, event: DriverEvent) {
        self.events.lock().push(event);
    }

    /// Every event, in order.
    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().clone()
    }

    /// Kind and table of every executed write, in order.
    pub fn statements(&self) -> Vec<(StatementKind, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DriverEvent::Execute { kind, table, .. } => Some((*kind, table.clone())),
                _ => None,
            })
            .collect()
    }

    /// Executed writes with their values and predicates.
    pub fn writes(&self) -> Vec<DriverEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DriverEvent::Execute { .. }))
            .cloned()
            .collect()
    }

    /// Number of executed writes.
    pub fn statement_count(&self) -> usize {
        self.statements().len()
    }

    /// Number of queries.
    pub fn query_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DriverEvent::Query { .. }))
            .count()
    }

    /// Number of occurrences of `event`.
    pub fn count(&self, event: &DriverEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// A driver that records every call before forwarding it.
#[derive(Debug)]
pub struct RecordingDriver<D> {
    inner: D,
    log: StatementLog,
    executed: usize,
    fail_at: Option<usize>,
    cancel_at: Option<(usize, CancelHandle)>,
}

impl<D: StorageDriver> RecordingDriver<D> {
    /// Wraps `inner`.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            log: StatementLog::default(),
            executed: 0,
            fail_at: None,
            cancel_at: None,
        }
    }

    /// The shared event log.
    pub fn log(&self) -> StatementLog {
        self.log.clone()
    }

    /// The wrapped driver.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Fails the `n`th write (counting from 1) from now on, once.
    pub fn fail_on_statement(&mut self, n: usize) {
        self.fail_at = Some(self.executed + n);
    }

    /// Fires `cancel` right after the `n`th write (counting from 1) from
    /// now on.
    pub fn cancel_after_statement(&mut self, n: usize, cancel: CancelHandle) {
        self.cancel_at = Some((self.executed + n, cancel));
    }
}

impl<D: StorageDriver> StorageDriver for RecordingDriver<D> {
    fn execute(
        &mut self,
        kind: StatementKind,
        table: &TableMeta,
        values: &Row,
        predicate: &Predicate,
    ) -> StorageResult<WriteOutcome> {
        self.executed += 1;
        if self.fail_at == Some(self.executed) {
            self.fail_at = None;
            return Err(StorageError::driver(format!(
                "injected failure on {kind} {}",
                table.name
            )));
        }

        let outcome = self.inner.execute(kind, table, values, predicate)?;
        self.log.push(DriverEvent::Execute {
            kind,
            table: table.name.clone(),
            values: values.clone(),
            predicate: predicate.clone(),
        });

        if let Some((at, cancel)) = &self.cancel_at {
            if *at == self.executed {
                cancel.cancel();
                self.cancel_at = None;
            }
        }
        Ok(outcome)
    }

    fn query(&mut self, table: &TableMeta, predicate: &Predicate) -> StorageResult<Vec<Row>> {
        self.log.push(DriverEvent::Query {
            table: table.name.clone(),
        });
        self.inner.query(table, predicate)
    }

    fn begin_transaction(&mut self) -> StorageResult<TransactionHandle> {
        let handle = self.inner.begin_transaction()?;
        self.log.push(DriverEvent::Begin);
        Ok(handle)
    }

    fn commit(&mut self, handle: TransactionHandle) -> StorageResult<()> {
        self.inner.commit(handle)?;
        self.log.push(DriverEvent::Commit);
        Ok(())
    }

    fn rollback(&mut self, handle: TransactionHandle) -> StorageResult<()> {
        self.inner.rollback(handle)?;
        self.log.push(DriverEvent::Rollback);
        Ok(())
    }
}
