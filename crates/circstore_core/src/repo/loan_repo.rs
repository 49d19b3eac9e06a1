//! Loan and loan history repository.
//!
//! # Responsibility
//! - Persist loan documents and their audit snapshots.
//! - Provide read access used to verify anonymization results.
//!
//! # Invariants
//! - History is append-only through this repository; rows are listed in
//!   insertion order.

use super::{ensure_connection_ready, parse_uuid, RepoError, RepoResult};
use crate::model::loan::{Loan, LoanHistoryEntry, LoanId};
use rusqlite::{params, Connection};
use serde::Serialize;

const DOCUMENT_COLUMNS: &[&str] = &["id", "jsonb"];

pub trait LoanRepository {
    fn create_loan(&self, loan: &Loan) -> RepoResult<LoanId>;
    fn get_loan(&self, id: LoanId) -> RepoResult<Option<Loan>>;
    fn append_history(&self, entry: &LoanHistoryEntry) -> RepoResult<()>;
    fn list_history(&self, loan_id: LoanId) -> RepoResult<Vec<LoanHistoryEntry>>;
}

pub struct SqliteLoanRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteLoanRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(
            conn,
            &[("loans", DOCUMENT_COLUMNS), ("loan_history", DOCUMENT_COLUMNS)],
        )?;
        Ok(Self { conn })
    }
}

impl LoanRepository for SqliteLoanRepository<'_> {
    fn create_loan(&self, loan: &Loan) -> RepoResult<LoanId> {
        self.conn.execute(
            "INSERT INTO loans (id, jsonb) VALUES (?1, ?2);",
            params![loan.id.to_string(), encode(&loan.id, loan)?],
        )?;
        Ok(loan.id)
    }

    fn get_loan(&self, id: LoanId) -> RepoResult<Option<Loan>> {
        let mut stmt = self.conn.prepare("SELECT id, jsonb FROM loans WHERE id = ?1;")?;
        let mut rows = stmt.query([id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let stored_id = parse_uuid(&row.get::<_, String>(0)?, "loans.id")?;
        let loan: Loan = serde_json::from_str(&row.get::<_, String>(1)?)
            .map_err(|err| RepoError::InvalidData(format!("invalid loan document for {id}: {err}")))?;
        if loan.id != stored_id {
            return Err(RepoError::InvalidData(format!(
                "loan {stored_id} column does not match its document"
            )));
        }
        Ok(Some(loan))
    }

    fn append_history(&self, entry: &LoanHistoryEntry) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO loan_history (id, jsonb) VALUES (?1, ?2);",
            params![entry.id.to_string(), encode(&entry.id, entry)?],
        )?;
        Ok(())
    }

    fn list_history(&self, loan_id: LoanId) -> RepoResult<Vec<LoanHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT jsonb
             FROM loan_history
             WHERE json_extract(jsonb, '$.loan.id') = ?1
             ORDER BY rowid ASC;",
        )?;
        let mut rows = stmt.query([loan_id.to_string()])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let document: String = row.get(0)?;
            let entry: LoanHistoryEntry = serde_json::from_str(&document).map_err(|err| {
                RepoError::InvalidData(format!("invalid loan history for {loan_id}: {err}"))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn encode<T: Serialize>(id: &uuid::Uuid, document: &T) -> RepoResult<String> {
    serde_json::to_string(document)
        .map_err(|err| RepoError::InvalidData(format!("document {id} not encodable: {err}")))
}
