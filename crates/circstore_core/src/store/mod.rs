//! Record store gateway contracts.
//!
//! # Responsibility
//! - Define the transactional statement-execution boundary used by services.
//! - Advertise how the backing store checks uniqueness constraints.
//!
//! # Invariants
//! - Every statement of one logical operation runs inside one transaction.
//! - A transaction dropped without `commit` is rolled back.
//! - Statements are executed in call order; `execute` returns only after the
//!   store acknowledged the statement.

use crate::db::DbError;
use classify::UniqueConstraint;
use rusqlite::types::Value;
use uuid::Uuid;

pub mod classify;
mod sqlite;

pub use sqlite::{SqliteRecordStore, SqliteTransaction};

/// Store-level failure. Gateways surface the native SQLite error.
pub type StoreError = DbError;

pub type StoreResult<T> = Result<T, StoreError>;

/// When the store validates unique constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintChecking {
    /// Checked per statement; transient duplicates abort the statement.
    Immediate,
    /// Checked at commit; transient duplicates inside a transaction are allowed.
    Deferred,
}

/// Parametrized SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Appends one positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

/// Transactional record store.
pub trait RecordStore {
    type Txn<'a>: StoreTransaction
    where
        Self: 'a;

    /// Uniqueness checking mode of the underlying store.
    fn constraint_checking(&self) -> ConstraintChecking;

    /// Opens a write transaction.
    fn begin(&self) -> StoreResult<Self::Txn<'_>>;
}

/// One open store transaction.
pub trait StoreTransaction {
    /// Executes a mutation and returns the affected row count.
    fn execute(&mut self, statement: &Statement) -> StoreResult<usize>;
    /// Executes a query and returns every row as raw column values.
    fn query_rows(&mut self, statement: &Statement) -> StoreResult<Vec<Vec<Value>>>;
    fn commit(self) -> StoreResult<()>;
    fn rollback(self) -> StoreResult<()>;
}

/// Column mapping of a table whose rows hold unique `(group, slot)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTable {
    pub table: &'static str,
    pub id_column: &'static str,
    pub group_column: &'static str,
    pub slot_column: &'static str,
    /// Column holding the serialized entity document.
    pub document_column: &'static str,
    /// Epoch-ms column refreshed by full updates, if any.
    pub touched_column: Option<&'static str>,
    /// Store constraint guarding `(group_column, slot_column)`.
    pub constraint: UniqueConstraint,
    /// Event type published after a committed batch.
    pub event_type: &'static str,
}

impl SlotTable {
    /// Moves one row to a temporary slot, leaving the rest of the row intact.
    pub fn staging_statement(&self, id: Uuid, staging_slot: i64) -> Statement {
        Statement::new(format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2;",
            self.table, self.slot_column, self.id_column
        ))
        .bind(staging_slot)
        .bind(id.to_string())
    }

    /// Writes the full row state: group, final slot and document.
    pub fn update_statement(
        &self,
        id: Uuid,
        group: String,
        slot: Option<i64>,
        document: String,
    ) -> Statement {
        let touched = self
            .touched_column
            .map(|column| format!(", {column} = (strftime('%s', 'now') * 1000)"))
            .unwrap_or_default();
        Statement::new(format!(
            "UPDATE {} SET {} = ?1, {} = ?2, {} = ?3{} WHERE {} = ?4;",
            self.table,
            self.group_column,
            self.slot_column,
            self.document_column,
            touched,
            self.id_column
        ))
        .bind(group)
        .bind(slot)
        .bind(document)
        .bind(id.to_string())
    }
}
