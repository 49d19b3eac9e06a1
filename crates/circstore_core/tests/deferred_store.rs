use circstore_core::{
    BatchError, BatchService, ConstraintChecking, CoreLogger, EventEmitter, NoopEventPublisher,
    RecordStore, Request, ServiceConfig, Statement, StoreError, StoreResult, StoreTransaction,
    REQUEST_QUEUE_TABLE,
};
use rusqlite::ffi;
use rusqlite::types::Value;
use std::cell::RefCell;
use std::rc::Rc;
use uuid::Uuid;

/// Store that defers uniqueness checks to commit and records every statement.
struct DeferredStore {
    executed: Rc<RefCell<Vec<String>>>,
    reject_commit: bool,
}

struct DeferredTxn {
    executed: Rc<RefCell<Vec<String>>>,
    reject_commit: bool,
}

impl RecordStore for DeferredStore {
    type Txn<'a>
        = DeferredTxn
    where
        Self: 'a;

    fn constraint_checking(&self) -> ConstraintChecking {
        ConstraintChecking::Deferred
    }

    fn begin(&self) -> StoreResult<Self::Txn<'_>> {
        Ok(DeferredTxn {
            executed: Rc::clone(&self.executed),
            reject_commit: self.reject_commit,
        })
    }
}

impl StoreTransaction for DeferredTxn {
    fn execute(&mut self, statement: &Statement) -> StoreResult<usize> {
        self.executed.borrow_mut().push(statement.sql().to_string());
        Ok(1)
    }

    fn query_rows(&mut self, _statement: &Statement) -> StoreResult<Vec<Vec<Value>>> {
        Ok(Vec::new())
    }

    fn commit(self) -> StoreResult<()> {
        if self.reject_commit {
            return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                ffi::Error::new(ffi::SQLITE_CONSTRAINT_UNIQUE),
                Some("UNIQUE constraint failed: requests.item_id, requests.position".to_string()),
            )));
        }
        Ok(())
    }

    fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

fn service(store: DeferredStore) -> BatchService<DeferredStore, NoopEventPublisher> {
    BatchService::new(
        store,
        REQUEST_QUEUE_TABLE,
        EventEmitter::new(NoopEventPublisher, &ServiceConfig::default(), CoreLogger::default()),
        CoreLogger::default(),
    )
}

#[test]
fn deferred_store_receives_updates_in_supplied_order_without_staging() {
    let executed = Rc::new(RefCell::new(Vec::new()));
    let item_id = Uuid::new_v4();
    let batch = vec![
        Request::new_hold(item_id, Uuid::new_v4(), 2),
        Request::new_hold(item_id, Uuid::new_v4(), 1),
    ];

    let outcome = service(DeferredStore {
        executed: Rc::clone(&executed),
        reject_commit: false,
    })
    .execute_batch(&batch)
    .unwrap();

    assert_eq!(outcome.applied_ids, vec![batch[0].id, batch[1].id]);
    let executed = executed.borrow();
    assert_eq!(executed.len(), 2);
    assert!(executed.iter().all(|sql| sql.contains("jsonb = ?3")));
}

#[test]
fn commit_time_violation_names_colliding_entities() {
    let item_id = Uuid::new_v4();
    let batch = vec![
        Request::new_hold(item_id, Uuid::new_v4(), 1),
        Request::new_hold(item_id, Uuid::new_v4(), 2),
        Request::new_hold(item_id, Uuid::new_v4(), 1),
    ];

    let err = service(DeferredStore {
        executed: Rc::new(RefCell::new(Vec::new())),
        reject_commit: true,
    })
    .execute_batch(&batch)
    .unwrap_err();

    match err {
        BatchError::ConstraintViolation {
            offending_ids,
            message,
        } => {
            assert_eq!(offending_ids, vec![batch[0].id, batch[2].id]);
            assert!(message.contains("requests.item_id, requests.position"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
