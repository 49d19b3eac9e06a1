//! Loan anonymization (patron redaction).
//!
//! # Responsibility
//! - Remove `userId` from closed loans and from every history snapshot of
//!   those loans in one transaction.
//! - Report per-loan outcome: redacted, already redacted, or skipped with reason.
//!
//! # Invariants
//! - Invalid identifiers never reach the store.
//! - History is redacted strictly before loans, because the history
//!   statement selects its loans by their pre-redaction state.
//! - Open loans and loans without `userId` are never modified.
//! - Any store failure rolls back both statements; no partial report.

use crate::db::DbError;
use crate::events::{EventEmitter, EventPublisher, LOAN_ANONYMIZED};
use crate::logging::CoreLogger;
use crate::model::ids::PartitionedIds;
use crate::model::loan::LoanId;
use crate::store::{RecordStore, Statement, StoreResult, StoreTransaction};
use rusqlite::types::Value;
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

pub type RedactionResult = Result<RedactionReport, RedactionError>;

/// Why a requested loan was not anonymized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not a canonical UUID; never sent to the store.
    InvalidIdentifier,
    /// Loan is not closed.
    NotEligible,
    /// No loan with that id.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedIds {
    pub reason: SkipReason,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedactionReport {
    /// Loans whose `userId` was removed by this call.
    pub redacted: Vec<LoanId>,
    /// Closed loans that carried no `userId` already.
    pub already_redacted: Vec<LoanId>,
    /// Groups of skipped inputs, one entry per non-empty reason.
    pub skipped: Vec<SkippedIds>,
    pub event_published: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedactionOptions {
    /// List open loans under `SkipReason::NotEligible` instead of omitting them.
    pub report_ineligible: bool,
}

impl Default for RedactionOptions {
    fn default() -> Self {
        Self {
            report_ineligible: true,
        }
    }
}

#[derive(Debug)]
pub enum RedactionError {
    /// Every supplied id failed validation.
    NoValidIdentifiers { invalid: Vec<String> },
    Store(DbError),
}

impl Display for RedactionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoValidIdentifiers { .. } => write!(f, "Please provide valid loanIds"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RedactionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::NoValidIdentifiers { .. } => None,
        }
    }
}

impl From<DbError> for RedactionError {
    fn from(value: DbError) -> Self {
        Self::Store(value)
    }
}

/// The two ordered statements of one anonymization.
#[derive(Debug, Clone, PartialEq)]
pub struct AnonymizationPlan {
    /// Strips `loan.userId` from history snapshots of eligible loans.
    pub history: Statement,
    /// Strips `userId` from eligible loans.
    pub loans: Statement,
}

impl AnonymizationPlan {
    /// Both statements bind the whole id set once, as a JSON array in `?1`,
    /// so the plan never runs into SQLite's bound-variable limit.
    pub fn for_loans(loan_ids: &[LoanId]) -> Self {
        let id_set = id_set(loan_ids);
        let history = Statement::new(
            "UPDATE loan_history
             SET jsonb = json_remove(loan_history.jsonb, '$.loan.userId')
             WHERE json_extract(loan_history.jsonb, '$.loan.id') IN (
                 SELECT l.id
                 FROM loans l
                 WHERE l.id IN (SELECT value FROM json_each(?1))
                   AND json_extract(l.jsonb, '$.status.name') = 'Closed'
                   AND COALESCE(json_type(l.jsonb, '$.userId'), 'null') != 'null'
             )
               AND json_type(loan_history.jsonb, '$.loan.userId') IS NOT NULL;",
        )
        .bind(id_set.clone());
        let loans = Statement::new(
            "UPDATE loans
             SET jsonb = json_remove(jsonb, '$.userId'),
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id IN (SELECT value FROM json_each(?1))
               AND json_extract(jsonb, '$.status.name') = 'Closed'
               AND COALESCE(json_type(jsonb, '$.userId'), 'null') != 'null';",
        )
        .bind(id_set);
        Self { history, loans }
    }

    /// Statements in execution order.
    pub fn statements(&self) -> [&Statement; 2] {
        [&self.history, &self.loans]
    }
}

/// Pre-redaction state of one requested loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoanState {
    Eligible,
    AlreadyRedacted,
    NotClosed,
}

/// Redaction orchestrator.
pub struct RedactionService<S: RecordStore, P: EventPublisher> {
    store: S,
    events: EventEmitter<P>,
    options: RedactionOptions,
    logger: CoreLogger,
}

impl<S: RecordStore, P: EventPublisher> RedactionService<S, P> {
    pub fn new(
        store: S,
        events: EventEmitter<P>,
        options: RedactionOptions,
        logger: CoreLogger,
    ) -> Self {
        Self {
            store,
            events,
            options,
            logger: logger.scoped("circstore_core::redaction"),
        }
    }

    /// Anonymizes the valid ids of `ids` and reports every input.
    ///
    /// # Errors
    /// - `NoValidIdentifiers` when `ids.valid` is empty; the store is untouched.
    /// - `Store` when any statement or the commit fails; nothing is applied.
    pub fn redact(&self, ids: &PartitionedIds) -> RedactionResult {
        let mut report = RedactionReport::default();
        if !ids.invalid.is_empty() {
            self.logger.warn(format_args!(
                "event=redact_execute module=redaction status=partial error_code=invalid_ids count={}",
                ids.invalid.len()
            ));
            report.skipped.push(SkippedIds {
                reason: SkipReason::InvalidIdentifier,
                ids: ids.invalid.clone(),
            });
        }
        if ids.valid.is_empty() {
            return Err(RedactionError::NoValidIdentifiers {
                invalid: ids.invalid.clone(),
            });
        }

        let started_at = Instant::now();
        self.logger.info(format_args!(
            "event=redact_execute module=redaction status=start count={}",
            ids.valid.len()
        ));

        let states = match self.apply(&ids.valid) {
            Ok(states) => states,
            Err(err) => {
                self.logger.error(format_args!(
                    "event=redact_execute module=redaction status=error duration_ms={} error_code=store_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                ));
                return Err(RedactionError::Store(err));
            }
        };

        let mut not_eligible = Vec::new();
        let mut not_found = Vec::new();
        for id in &ids.valid {
            match states.get(id) {
                Some(LoanState::Eligible) => report.redacted.push(*id),
                Some(LoanState::AlreadyRedacted) => report.already_redacted.push(*id),
                Some(LoanState::NotClosed) => not_eligible.push(id.to_string()),
                None => not_found.push(id.to_string()),
            }
        }
        if self.options.report_ineligible && !not_eligible.is_empty() {
            report.skipped.push(SkippedIds {
                reason: SkipReason::NotEligible,
                ids: not_eligible,
            });
        }
        if !not_found.is_empty() {
            report.skipped.push(SkippedIds {
                reason: SkipReason::NotFound,
                ids: not_found,
            });
        }

        self.logger.info(format_args!(
            "event=redact_execute module=redaction status=ok duration_ms={} redacted={} already_redacted={}",
            started_at.elapsed().as_millis(),
            report.redacted.len(),
            report.already_redacted.len()
        ));

        if !report.redacted.is_empty() {
            report.event_published = self
                .events
                .emit(LOAN_ANONYMIZED, &json!({ "loanIds": report.redacted }));
        }
        Ok(report)
    }

    fn apply(&self, loan_ids: &[LoanId]) -> StoreResult<HashMap<LoanId, LoanState>> {
        let mut txn = self.store.begin()?;
        match self.apply_in(&mut txn, loan_ids) {
            Ok(states) => {
                txn.commit()?;
                Ok(states)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback() {
                    self.logger.error(format_args!(
                        "event=redact_execute module=redaction status=error error_code=rollback_failed error={}",
                        rollback_err
                    ));
                }
                Err(err)
            }
        }
    }

    fn apply_in<T: StoreTransaction>(
        &self,
        txn: &mut T,
        loan_ids: &[LoanId],
    ) -> StoreResult<HashMap<LoanId, LoanState>> {
        let states = read_states(txn, loan_ids)?;
        let eligible = states
            .values()
            .filter(|state| **state == LoanState::Eligible)
            .count();

        let plan = AnonymizationPlan::for_loans(loan_ids);
        let history_rows = txn.execute(&plan.history)?;
        let loan_rows = txn.execute(&plan.loans)?;
        if loan_rows != eligible {
            self.logger.warn(format_args!(
                "event=redact_execute module=redaction status=mismatch expected_loans={} updated_loans={}",
                eligible, loan_rows
            ));
        }
        self.logger.debug(format_args!(
            "event=redact_execute module=redaction status=applied history_rows={} loan_rows={}",
            history_rows, loan_rows
        ));
        Ok(states)
    }
}

fn read_states<T: StoreTransaction>(
    txn: &mut T,
    loan_ids: &[LoanId],
) -> StoreResult<HashMap<LoanId, LoanState>> {
    let query = Statement::new(
        "SELECT id,
                json_extract(jsonb, '$.status.name') = 'Closed',
                COALESCE(json_type(jsonb, '$.userId'), 'null') != 'null'
         FROM loans
         WHERE id IN (SELECT value FROM json_each(?1));",
    )
    .bind(id_set(loan_ids));

    let mut states = HashMap::new();
    for row in txn.query_rows(&query)? {
        let (Some(Value::Text(id)), Some(closed), Some(has_user)) =
            (row.first(), row.get(1), row.get(2))
        else {
            continue;
        };
        let Ok(id) = Uuid::parse_str(id) else {
            continue;
        };
        let state = match (is_true(closed), is_true(has_user)) {
            (true, true) => LoanState::Eligible,
            (true, false) => LoanState::AlreadyRedacted,
            (false, _) => LoanState::NotClosed,
        };
        states.insert(id, state);
    }
    Ok(states)
}

fn is_true(value: &Value) -> bool {
    matches!(value, Value::Integer(flag) if *flag != 0)
}

/// Canonical id strings as one JSON array text, read back with `json_each`.
fn id_set(ids: &[LoanId]) -> String {
    serde_json::Value::from(ids.iter().map(Uuid::to_string).collect::<Vec<_>>()).to_string()
}

#[cfg(test)]
mod tests {
    use super::AnonymizationPlan;
    use rusqlite::types::Value;
    use uuid::Uuid;

    #[test]
    fn history_statement_runs_before_loan_statement() {
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        let plan = AnonymizationPlan::for_loans(&ids);
        let [first, second] = plan.statements();

        assert!(first.sql().trim_start().starts_with("UPDATE loan_history"));
        assert!(first.sql().contains("FROM loans l"));
        assert!(second.sql().trim_start().starts_with("UPDATE loans"));
    }

    #[test]
    fn both_statements_bind_the_id_set_once() {
        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let plan = AnonymizationPlan::for_loans(&ids);
        let expected = Value::Text(format!("[\"{}\",\"{}\",\"{}\"]", ids[0], ids[1], ids[2]));

        for statement in plan.statements() {
            assert_eq!(statement.params(), std::slice::from_ref(&expected));
            assert!(statement.sql().contains("json_each(?1)"));
            assert!(!statement.sql().contains("?2"));
        }
    }

    #[test]
    fn id_set_size_does_not_change_the_bind_count() {
        let ids = (0..40_000).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
        let plan = AnonymizationPlan::for_loans(&ids);

        for statement in plan.statements() {
            assert_eq!(statement.params().len(), 1);
        }
    }
}
