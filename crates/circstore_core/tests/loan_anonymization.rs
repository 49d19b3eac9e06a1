use circstore_core::db::open_db_in_memory;
use circstore_core::{
    partition_ids, ConstraintChecking, CoreLogger, Event, EventEmitter, EventPublisher, Loan,
    LoanHistoryEntry, LoanRepository, LoanStatusName, NoopEventPublisher, PublishError,
    RecordStore, RedactionError, RedactionOptions, RedactionService, ServiceConfig, SkipReason,
    SqliteLoanRepository, SqliteRecordStore, SqliteTransaction, StoreResult,
};
use rusqlite::Connection;
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use uuid::Uuid;

fn setup() -> Connection {
    open_db_in_memory().unwrap()
}

fn redaction_service(
    conn: &Connection,
    options: RedactionOptions,
) -> RedactionService<SqliteRecordStore<'_>, NoopEventPublisher> {
    RedactionService::new(
        SqliteRecordStore::try_new(conn).unwrap(),
        EventEmitter::new(NoopEventPublisher, &ServiceConfig::default(), CoreLogger::default()),
        options,
        CoreLogger::default(),
    )
}

/// Stores a loan plus two history snapshots of it.
fn seed_loan(conn: &Connection, status: LoanStatusName, with_user: bool) -> Loan {
    let repo = SqliteLoanRepository::try_new(conn).unwrap();
    let mut loan = Loan::new(Uuid::new_v4(), Uuid::new_v4(), LoanStatusName::Open);
    loan.extra.insert("action".to_string(), json!("checkedout"));
    repo.create_loan(&loan).unwrap();
    repo.append_history(&LoanHistoryEntry::snapshot("I", &loan))
        .unwrap();

    loan.status.name = status;
    if status == LoanStatusName::Closed {
        loan.extra.insert("action".to_string(), json!("checkedin"));
    }
    if !with_user {
        loan.user_id = None;
    }
    conn.execute(
        "UPDATE loans SET jsonb = ?1 WHERE id = ?2;",
        [serde_json::to_string(&loan).unwrap(), loan.id.to_string()],
    )
    .unwrap();
    repo.append_history(&LoanHistoryEntry::snapshot("U", &loan))
        .unwrap();
    loan
}

fn stored_loan(conn: &Connection, loan: &Loan) -> Loan {
    SqliteLoanRepository::try_new(conn)
        .unwrap()
        .get_loan(loan.id)
        .unwrap()
        .unwrap()
}

fn history_users(conn: &Connection, loan: &Loan) -> Vec<Option<Uuid>> {
    SqliteLoanRepository::try_new(conn)
        .unwrap()
        .list_history(loan.id)
        .unwrap()
        .into_iter()
        .map(|entry| entry.loan.user_id)
        .collect()
}

fn ids(loans: &[&Loan]) -> Vec<String> {
    loans.iter().map(|loan| loan.id.to_string()).collect()
}

#[test]
fn closed_loans_and_their_history_lose_the_patron() {
    let conn = setup();
    let closed = seed_loan(&conn, LoanStatusName::Closed, true);
    let open = seed_loan(&conn, LoanStatusName::Open, true);

    let report = redaction_service(&conn, RedactionOptions::default())
        .redact(&partition_ids(&ids(&[&closed, &open])))
        .unwrap();

    assert_eq!(report.redacted, vec![closed.id]);
    assert!(report.already_redacted.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reason, SkipReason::NotEligible);
    assert_eq!(report.skipped[0].ids, vec![open.id.to_string()]);

    let redacted = stored_loan(&conn, &closed);
    assert_eq!(redacted.user_id, None);
    assert_eq!(redacted.item_id, closed.item_id);
    assert_eq!(redacted.extra["action"], json!("checkedin"));
    assert_eq!(history_users(&conn, &closed), vec![None, None]);

    assert_eq!(stored_loan(&conn, &open), open);
    assert_eq!(
        history_users(&conn, &open),
        vec![open.user_id, open.user_id]
    );
}

#[test]
fn anonymizing_twice_reports_already_redacted() {
    let conn = setup();
    let closed = seed_loan(&conn, LoanStatusName::Closed, true);
    let service = redaction_service(&conn, RedactionOptions::default());
    let input = partition_ids(&ids(&[&closed]));

    let first = service.redact(&input).unwrap();
    let after_first = stored_loan(&conn, &closed);
    let second = service.redact(&input).unwrap();

    assert_eq!(first.redacted, vec![closed.id]);
    assert!(second.redacted.is_empty());
    assert_eq!(second.already_redacted, vec![closed.id]);
    assert!(second.skipped.is_empty());
    assert_eq!(stored_loan(&conn, &closed), after_first);
}

#[test]
fn closed_loan_without_patron_is_already_redacted() {
    let conn = setup();
    let closed = seed_loan(&conn, LoanStatusName::Closed, false);

    let report = redaction_service(&conn, RedactionOptions::default())
        .redact(&partition_ids(&ids(&[&closed])))
        .unwrap();

    assert!(report.redacted.is_empty());
    assert_eq!(report.already_redacted, vec![closed.id]);
    // The opening snapshot still names the patron; it is only scrubbed when
    // the live loan is.
    assert_eq!(history_users(&conn, &closed)[1], None);
}

#[test]
fn invalid_ids_are_reported_and_valid_ids_still_processed() {
    let conn = setup();
    let closed = seed_loan(&conn, LoanStatusName::Closed, true);
    let unknown = Uuid::new_v4();
    let input = partition_ids(&[
        "not-a-uuid".to_string(),
        closed.id.to_string(),
        String::new(),
        unknown.to_string(),
    ]);

    let report = redaction_service(&conn, RedactionOptions::default())
        .redact(&input)
        .unwrap();

    assert_eq!(report.redacted, vec![closed.id]);
    let reasons = report
        .skipped
        .iter()
        .map(|skipped| (skipped.reason, skipped.ids.clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        reasons,
        vec![
            (
                SkipReason::InvalidIdentifier,
                vec!["not-a-uuid".to_string(), String::new()]
            ),
            (SkipReason::NotFound, vec![unknown.to_string()]),
        ]
    );
}

#[test]
fn open_loans_are_omitted_when_ineligible_reporting_is_off() {
    let conn = setup();
    let open = seed_loan(&conn, LoanStatusName::Open, true);

    let report = redaction_service(
        &conn,
        RedactionOptions {
            report_ineligible: false,
        },
    )
    .redact(&partition_ids(&ids(&[&open])))
    .unwrap();

    assert!(report.redacted.is_empty());
    assert!(report.skipped.is_empty());
    assert_eq!(stored_loan(&conn, &open), open);
}

#[test]
fn id_sets_beyond_the_bind_variable_limit_are_anonymized() {
    let conn = setup();
    let closed = seed_loan(&conn, LoanStatusName::Closed, true);
    let mut requested = (0..40_000)
        .map(|_| Uuid::new_v4().to_string())
        .collect::<Vec<_>>();
    requested.push(closed.id.to_string());

    let report = redaction_service(&conn, RedactionOptions::default())
        .redact(&partition_ids(&requested))
        .unwrap();

    assert_eq!(report.redacted, vec![closed.id]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reason, SkipReason::NotFound);
    assert_eq!(report.skipped[0].ids.len(), 40_000);
    assert_eq!(stored_loan(&conn, &closed).user_id, None);
    assert_eq!(history_users(&conn, &closed), vec![None, None]);
}

struct CountingStore<'conn> {
    inner: SqliteRecordStore<'conn>,
    begins: Rc<Cell<usize>>,
}

impl RecordStore for CountingStore<'_> {
    type Txn<'a>
        = SqliteTransaction<'a>
    where
        Self: 'a;

    fn constraint_checking(&self) -> ConstraintChecking {
        self.inner.constraint_checking()
    }

    fn begin(&self) -> StoreResult<Self::Txn<'_>> {
        self.begins.set(self.begins.get() + 1);
        self.inner.begin()
    }
}

#[test]
fn no_valid_ids_never_contacts_the_store() {
    let conn = setup();
    let begins = Rc::new(Cell::new(0));
    let service = RedactionService::new(
        CountingStore {
            inner: SqliteRecordStore::try_new(&conn).unwrap(),
            begins: Rc::clone(&begins),
        },
        EventEmitter::new(NoopEventPublisher, &ServiceConfig::default(), CoreLogger::default()),
        RedactionOptions::default(),
        CoreLogger::default(),
    );

    let err = service
        .redact(&partition_ids(&["123", "also-bad"]))
        .unwrap_err();

    match &err {
        RedactionError::NoValidIdentifiers { invalid } => {
            assert_eq!(invalid, &vec!["123".to_string(), "also-bad".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.to_string(), "Please provide valid loanIds");
    assert_eq!(begins.get(), 0);

    service
        .redact(&partition_ids::<&str>(&[]))
        .unwrap_err();
    assert_eq!(begins.get(), 0);
}

#[test]
fn loan_update_failure_rolls_back_history_redaction() {
    let conn = setup();
    let closed = seed_loan(&conn, LoanStatusName::Closed, true);
    conn.execute_batch(
        "CREATE TRIGGER freeze_loans
         BEFORE UPDATE ON loans
         BEGIN
             SELECT RAISE(ABORT, 'loans are frozen');
         END;",
    )
    .unwrap();

    let err = redaction_service(&conn, RedactionOptions::default())
        .redact(&partition_ids(&ids(&[&closed])))
        .unwrap_err();

    assert!(matches!(err, RedactionError::Store(_)));
    assert_eq!(stored_loan(&conn, &closed), closed);
    assert_eq!(
        history_users(&conn, &closed),
        vec![closed.user_id, closed.user_id]
    );
}

#[derive(Default)]
struct RecordingPublisher {
    events: RefCell<Vec<Event>>,
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: &Event) -> Result<(), PublishError> {
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }
}

#[test]
fn anonymization_event_lists_redacted_loans_only() {
    let conn = setup();
    let closed = seed_loan(&conn, LoanStatusName::Closed, true);
    let open = seed_loan(&conn, LoanStatusName::Open, true);
    let publisher = RecordingPublisher::default();
    let config = ServiceConfig {
        tenant_id: "diku".to_string(),
        ..ServiceConfig::default()
    };
    let service = RedactionService::new(
        SqliteRecordStore::try_new(&conn).unwrap(),
        EventEmitter::new(&publisher, &config, CoreLogger::default()),
        RedactionOptions::default(),
        CoreLogger::default(),
    );
    let input = partition_ids(&ids(&[&closed, &open]));

    let report = service.redact(&input).unwrap();
    assert!(report.event_published);
    let repeat = service.redact(&input).unwrap();
    assert!(!repeat.event_published);

    let events = publisher.events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "LOAN_ANONYMIZED");
    assert_eq!(events[0].event_metadata.tenant_id, "diku");
    assert_eq!(events[0].event_metadata.event_ttl, 1);
    let payload: serde_json::Value = serde_json::from_str(&events[0].event_payload).unwrap();
    assert_eq!(payload, json!({ "loanIds": [closed.id.to_string()] }));
}
