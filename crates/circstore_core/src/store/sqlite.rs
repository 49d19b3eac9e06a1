//! SQLite implementation of the record store gateway.

use super::{ConstraintChecking, RecordStore, Statement, StoreResult, StoreTransaction};
use crate::db::migrations::latest_version;
use crate::db::DbError;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction, TransactionBehavior};

/// Gateway over one migrated SQLite connection.
///
/// SQLite cannot defer UNIQUE checks, so this store always reports
/// [`ConstraintChecking::Immediate`].
pub struct SqliteRecordStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRecordStore<'conn> {
    /// Creates a gateway from a connection opened through `db::open_db*`.
    ///
    /// # Errors
    /// - `DbError::UnsupportedSchemaVersion` when the schema is not at the
    ///   version this binary migrates to.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        let latest = latest_version();
        let actual: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if actual != latest {
            return Err(DbError::UnsupportedSchemaVersion {
                db_version: actual,
                latest_supported: latest,
            });
        }
        Ok(Self { conn })
    }
}

impl RecordStore for SqliteRecordStore<'_> {
    type Txn<'a>
        = SqliteTransaction<'a>
    where
        Self: 'a;

    fn constraint_checking(&self) -> ConstraintChecking {
        ConstraintChecking::Immediate
    }

    fn begin(&self) -> StoreResult<Self::Txn<'_>> {
        // IMMEDIATE takes the write lock up front so overlapping batches serialize.
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        Ok(SqliteTransaction { tx })
    }
}

/// Open `BEGIN IMMEDIATE` transaction. Rolls back on drop.
pub struct SqliteTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn execute(&mut self, statement: &Statement) -> StoreResult<usize> {
        let changed = self
            .tx
            .execute(statement.sql(), params_from_iter(statement.params()))?;
        Ok(changed)
    }

    fn query_rows(&mut self, statement: &Statement) -> StoreResult<Vec<Vec<Value>>> {
        let mut stmt = self.tx.prepare(statement.sql())?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(statement.params()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                values.push(row.get::<_, Value>(index)?);
            }
            result.push(values);
        }
        Ok(result)
    }

    fn commit(self) -> StoreResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    fn rollback(self) -> StoreResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}
